//! Orchestrator - reconciles a declared scope tree against stored state
//!
//! Per resource, in dependency order: load the stored record, resolve bindings
//! from upstream outputs, compute the action, persist an in-progress marker,
//! invoke exactly one provider handler and persist the result. Stored records
//! under the run's prefix that are no longer declared are deleted afterwards,
//! dependents first, unless a halt-all run has already seen a failure.

use crate::diff::{Plan, PlanEntry, compute_action};
use crate::error::{ApplyError, DeclareError, RunError};
use crate::events::{ApplyEvent, EventBus};
use crate::executor::{self, CancelToken, ExecuteOptions, KeyLocks, Scheduled, SkipReason};
use crate::graph::Graph;
use crate::lifecycle::{Action, Lifecycle};
use crate::provider::{HandlerContext, ProviderRegistry};
use crate::registry::ContextRegistry;
use crate::scope::{ResourceHandle, Scope};
use crate::types::{ApplyOptions, ApplyReport, FailurePolicy, Outcome};
use chrono::Utc;
use statekit::{ResourceStatus, StateRecord, StateStore, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl executor::Completion for Outcome {
    fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs apply, destroy, plan and read passes over a scope tree
///
/// The state store is taken from the scope. One orchestrator can run many
/// scope trees; runs sharing its [`KeyLocks`] never mutate one FQN at once.
pub struct Orchestrator {
    providers: Arc<ProviderRegistry>,
    events: EventBus,
    registry: Option<Arc<ContextRegistry>>,
    options: ApplyOptions,
    locks: Arc<KeyLocks>,
}

impl Orchestrator {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            providers,
            events: EventBus::new(),
            registry: None,
            options: ApplyOptions::default(),
            locks: Arc::new(KeyLocks::new()),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ContextRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a lock table with other orchestrators writing the same store
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<KeyLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Converge the store with the declaration, then delete orphans
    pub fn apply(&self, scope: &Scope) -> Result<ApplyReport, RunError> {
        let store = scope.store();
        let _session = statekit::session(store.as_ref())?;
        let run = Run::new(self, scope, store.as_ref());

        let resources = scope.walk();
        for handle in &resources {
            handle.set_status(ResourceStatus::Pending);
        }
        let graph = run.declared_graph(&resources)?;
        graph.check_acyclic()?;

        log::info!("Applying {} resources under {}", resources.len(), scope.fqn());
        let results = executor::execute(&graph, &run.execute_options(), |i| {
            run.apply_resource(&resources[i])
        })
        .map_err(|e| RunError::Executor(e.to_string()))?;

        let mut report = ApplyReport::default();
        for (handle, scheduled) in resources.iter().zip(results) {
            report
                .outcomes
                .push(run.unscheduled(handle.fqn(), handle.kind(), Some(handle), scheduled));
        }
        run.check_fatal()?;

        if run.cancel.is_cancelled() {
            log::warn!("Run under {} was cancelled; skipping orphan cleanup", scope.fqn());
        } else {
            let declared: HashSet<&str> = resources.iter().map(ResourceHandle::fqn).collect();
            let orphans: Vec<String> = run
                .stored_keys()?
                .into_iter()
                .filter(|key| !declared.contains(key.as_str()))
                .collect();
            let halted = self.options.failure_policy == FailurePolicy::HaltAll
                && report.outcomes.iter().any(Outcome::is_failed);
            if halted {
                if !orphans.is_empty() {
                    log::warn!(
                        "Leaving {} orphaned resources in place after a failure",
                        orphans.len()
                    );
                }
                report.outcomes.extend(run.halted_all(orphans)?);
            } else {
                if !orphans.is_empty() {
                    log::info!("Removing {} orphaned resources", orphans.len());
                }
                report.outcomes.extend(run.delete_all(orphans, &HashMap::new())?);
                run.check_fatal()?;
            }
        }

        finish(report)
    }

    /// Delete every stored resource under the scope, dependents first
    pub fn destroy(&self, scope: &Scope) -> Result<ApplyReport, RunError> {
        let store = scope.store();
        let _session = statekit::session(store.as_ref())?;
        let run = Run::new(self, scope, store.as_ref());

        let resources = scope.walk();
        for handle in &resources {
            handle.set_status(ResourceStatus::Pending);
        }
        let stored: BTreeSet<String> = run.stored_keys()?.into_iter().collect();
        let handles: HashMap<String, ResourceHandle> = resources
            .iter()
            .map(|h| (h.fqn().to_string(), h.clone()))
            .collect();

        // Declared resources keep declaration order; undeclared ones follow sorted
        let mut keys: Vec<String> = resources
            .iter()
            .map(|h| h.fqn().to_string())
            .filter(|fqn| stored.contains(fqn))
            .collect();
        keys.extend(stored.into_iter().filter(|key| !handles.contains_key(key)));

        log::info!("Destroying {} resources under {}", keys.len(), scope.fqn());
        let report = ApplyReport {
            outcomes: run.delete_all(keys, &handles)?,
        };
        run.check_fatal()?;
        finish(report)
    }

    /// Compute what `apply` would do without invoking any handler
    pub fn plan(&self, scope: &Scope) -> Result<Plan, RunError> {
        let store = scope.store();
        let _session = statekit::session(store.as_ref())?;
        let run = Run::new(self, scope, store.as_ref());

        let resources = scope.walk();
        let graph = run.declared_graph(&resources)?;
        let order = graph.topo_order()?;

        let mut entries: Vec<Option<PlanEntry>> = vec![None; resources.len()];
        for i in order {
            let handle = &resources[i];
            let record = store.get(handle.fqn())?;
            let resolved = handle
                .props()
                .resolve(|fqn| lock(&run.outputs).get(fqn).cloned());

            let (action, known_after_apply) = match resolved {
                Ok(news) => (
                    compute_action(&news, record.as_ref(), self.options.force, handle.adopt()),
                    false,
                ),
                // An upstream output changes during apply
                Err(_) => match &record {
                    Some(record) if record.has_been_created() => (Action::Update, true),
                    _ if handle.adopt() => (Action::Adopt, true),
                    _ => (Action::Create, true),
                },
            };
            if let (Action::Noop, Some(record)) = (action, &record) {
                lock(&run.outputs).insert(handle.fqn().to_string(), record.merged_output());
            }
            entries[i] = Some(PlanEntry {
                fqn: handle.fqn().to_string(),
                kind: handle.kind().to_string(),
                action,
                known_after_apply,
            });
        }

        let mut plan = Plan {
            entries: entries.into_iter().flatten().collect(),
        };
        let declared: HashSet<&str> = resources.iter().map(ResourceHandle::fqn).collect();
        for key in run.stored_keys()? {
            if declared.contains(key.as_str()) {
                continue;
            }
            let kind = store.get(&key)?.map(|r| r.kind).unwrap_or_default();
            plan.entries.push(PlanEntry {
                fqn: key,
                kind,
                action: Action::Delete,
                known_after_apply: false,
            });
        }

        log::debug!("Planned {}: {}", scope.fqn(), plan.summary());
        Ok(plan)
    }

    /// Load stored outputs into the declared handles without invoking handlers
    pub fn read(&self, scope: &Scope) -> Result<ApplyReport, RunError> {
        let store = scope.store();
        let _session = statekit::session(store.as_ref())?;

        let mut report = ApplyReport::default();
        for handle in scope.walk() {
            let outcome = match store.get(handle.fqn()) {
                Ok(Some(record)) => {
                    handle.settle(record.status, record.seq, Some(record.merged_output()));
                    Outcome {
                        fqn: record.fqn,
                        kind: record.kind,
                        action: None,
                        status: record.status,
                        seq: record.seq,
                        message: record.message,
                        error: None,
                    }
                }
                Ok(None) => Outcome {
                    fqn: handle.fqn().to_string(),
                    kind: handle.kind().to_string(),
                    action: None,
                    status: ResourceStatus::Pending,
                    seq: 0,
                    message: Some("not found in state".to_string()),
                    error: None,
                },
                Err(e) if e.is_connectivity() => return Err(RunError::Store(e)),
                Err(e) => {
                    let error = ApplyError::StateStore(e);
                    Outcome {
                        fqn: handle.fqn().to_string(),
                        kind: handle.kind().to_string(),
                        action: None,
                        status: ResourceStatus::Fail,
                        seq: 0,
                        message: Some(error.to_string()),
                        error: Some(error),
                    }
                }
            };
            report.outcomes.push(outcome);
        }
        finish(report)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.providers)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn finish(report: ApplyReport) -> Result<ApplyReport, RunError> {
    let summary = report.summary();
    if report.is_success() {
        log::info!("Run complete: {summary}");
        Ok(report)
    } else {
        log::warn!("Run finished with failures: {summary}");
        Err(RunError::Failed {
            report: Box::new(report),
        })
    }
}

/// Invoke a provider handler, turning errors and panics into [`ApplyError`]
fn call_handler<T>(call: impl FnOnce() -> anyhow::Result<T>) -> Result<T, ApplyError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result.map_err(ApplyError::from_handler),
        Err(payload) => Err(ApplyError::Handler(format!(
            "handler panicked: {}",
            executor::panic_message(payload.as_ref())
        ))),
    }
}

/// Status tracking and event emission for one resource in one run
struct Tracker<'r> {
    events: &'r EventBus,
    fqn: &'r str,
    kind: String,
    binding_id: Option<String>,
    handle: Option<&'r ResourceHandle>,
    status: ResourceStatus,
}

impl Tracker<'_> {
    fn advance(&mut self, to: ResourceStatus, message: Option<&str>) -> Result<(), ApplyError> {
        self.status = self.status.transition(self.fqn, to)?;
        if let Some(handle) = self.handle {
            handle.set_status(self.status);
        }
        let mut event = ApplyEvent::new(self.fqn, &self.kind, self.status)
            .with_binding(self.binding_id.clone());
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.events.publish(event);
        Ok(())
    }

    fn outcome(&self, action: Option<Action>, seq: u64, error: Option<ApplyError>) -> Outcome {
        Outcome {
            fqn: self.fqn.to_string(),
            kind: self.kind.clone(),
            action,
            status: self.status,
            seq,
            message: error.as_ref().map(ToString::to_string),
            error,
        }
    }

    fn fail(&mut self, action: Option<Action>, seq: u64, error: ApplyError) -> Outcome {
        let message = error.to_string();
        log::debug!("{} failed: {message}", self.fqn);
        if let Err(e) = self.advance(ResourceStatus::Fail, Some(&message)) {
            log::debug!("Not recording failure of {}: {e}", self.fqn);
        }
        self.outcome(action, seq, Some(error))
    }
}

/// State of one apply, destroy or plan pass
struct Run<'a> {
    orchestrator: &'a Orchestrator,
    scope: &'a Scope,
    store: &'a dyn StateStore,
    /// Merged outputs of settled resources and external dependencies
    outputs: Mutex<HashMap<String, Value>>,
    /// First store connectivity error; ends the run
    fatal: Mutex<Option<statekit::Error>>,
    cancel: CancelToken,
}

impl<'a> Run<'a> {
    fn new(orchestrator: &'a Orchestrator, scope: &'a Scope, store: &'a dyn StateStore) -> Self {
        Self {
            orchestrator,
            scope,
            store,
            outputs: Mutex::default(),
            fatal: Mutex::default(),
            cancel: orchestrator.options.cancel.child(),
        }
    }

    fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            concurrency: self.orchestrator.options.concurrency,
            failure_policy: self.orchestrator.options.failure_policy,
            cancel: self.cancel.clone(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}/", self.scope.fqn())
    }

    /// Stored keys belonging to this run's scope
    fn stored_keys(&self) -> Result<Vec<String>, RunError> {
        let prefix = self.prefix();
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect())
    }

    fn tracker<'r>(
        &'r self,
        fqn: &'r str,
        kind: &str,
        handle: Option<&'r ResourceHandle>,
    ) -> Tracker<'r> {
        Tracker {
            events: &self.orchestrator.events,
            fqn,
            kind: kind.to_string(),
            binding_id: handle.and_then(|h| h.binding_id().map(String::from)),
            handle,
            status: ResourceStatus::Pending,
        }
    }

    fn handler_context<'c>(
        &'c self,
        fqn: &'c str,
        handle: Option<&ResourceHandle>,
        seq: u64,
    ) -> HandlerContext<'c> {
        HandlerContext {
            fqn,
            stage: self.scope.stage(),
            phase: self.scope.phase(),
            mode: handle.map_or(self.scope.mode(), ResourceHandle::mode),
            adopt: handle.is_some_and(ResourceHandle::adopt),
            seq,
            registry: self.orchestrator.registry.as_deref(),
        }
    }

    /// Classify a store error; connectivity failures cancel the whole run
    fn store_error(&self, err: statekit::Error) -> ApplyError {
        if !err.is_connectivity() {
            return ApplyError::StateStore(err);
        }
        log::error!("State store failure, cancelling run: {err}");
        let message = format!("state store failure: {err}");
        self.cancel.cancel();
        lock(&self.fatal).get_or_insert(err);
        ApplyError::Cancelled(message)
    }

    fn check_fatal(&self) -> Result<(), RunError> {
        match lock(&self.fatal).take() {
            Some(err) => Err(RunError::Store(err)),
            None => Ok(()),
        }
    }

    /// Build the dependency graph of the declared resources
    ///
    /// Dependencies outside the declaration must already be stored, and must
    /// lie outside this run's prefix; their outputs are loaded up front.
    fn declared_graph(&self, resources: &[ResourceHandle]) -> Result<Graph, RunError> {
        let declared: HashSet<&str> = resources.iter().map(ResourceHandle::fqn).collect();
        let prefix = self.prefix();

        let mut nodes = Vec::with_capacity(resources.len());
        for handle in resources {
            if self.orchestrator.providers.get(handle.kind()).is_none() {
                return Err(DeclareError::UnknownKind {
                    fqn: handle.fqn().to_string(),
                    kind: handle.kind().to_string(),
                }
                .into());
            }
            let deps = handle.dependencies();
            for dep in &deps {
                if !declared.contains(dep.as_str()) {
                    self.load_external(handle.fqn(), dep, &prefix)?;
                }
            }
            nodes.push((handle.fqn().to_string(), deps));
        }
        Ok(Graph::new(nodes))
    }

    fn load_external(&self, fqn: &str, dep: &str, prefix: &str) -> Result<(), RunError> {
        if lock(&self.outputs).contains_key(dep) {
            return Ok(());
        }
        let unknown = || DeclareError::UnknownDependency {
            fqn: fqn.to_string(),
            dependency: dep.to_string(),
        };
        if dep.starts_with(prefix) {
            return Err(unknown().into());
        }
        let record = self.store.get(dep)?.ok_or_else(unknown)?;
        log::debug!("Resolved external dependency {dep} from state");
        lock(&self.outputs).insert(dep.to_string(), record.merged_output());
        Ok(())
    }

    /// Turn an executor result into an outcome
    fn unscheduled(
        &self,
        fqn: &str,
        kind: &str,
        handle: Option<&ResourceHandle>,
        scheduled: Scheduled<Outcome>,
    ) -> Outcome {
        let error = match scheduled {
            Scheduled::Ran(outcome) => return outcome,
            Scheduled::Panicked(message) => {
                let mut track = self.tracker(fqn, kind, handle);
                track.status = handle.map_or(ResourceStatus::Pending, ResourceHandle::status);
                let seq = handle.map_or(0, ResourceHandle::seq);
                return track.fail(None, seq, ApplyError::Handler(format!("task panicked: {message}")));
            }
            Scheduled::Skipped(SkipReason::Dependency(upstream)) => {
                ApplyError::DependencyFailure(upstream)
            }
            Scheduled::Skipped(SkipReason::Halted) => {
                ApplyError::Cancelled("halted after an earlier failure".to_string())
            }
            Scheduled::Skipped(SkipReason::Cancelled) => {
                ApplyError::Cancelled("run was cancelled".to_string())
            }
        };
        log::debug!("Skipped {fqn}: {error}");
        Outcome {
            fqn: fqn.to_string(),
            kind: kind.to_string(),
            action: None,
            status: handle.map_or(ResourceStatus::Pending, ResourceHandle::status),
            seq: handle.map_or(0, ResourceHandle::seq),
            message: Some(error.to_string()),
            error: Some(error),
        }
    }

    /// Create, update or confirm one declared resource
    fn apply_resource(&self, handle: &ResourceHandle) -> Outcome {
        let fqn = handle.fqn();
        let _guard = self.orchestrator.locks.lock(fqn);
        let mut track = self.tracker(fqn, handle.kind(), Some(handle));

        let Some(provider) = self.orchestrator.providers.get(handle.kind()) else {
            let error = ApplyError::Validation(format!("no provider for kind '{}'", handle.kind()));
            return track.fail(None, 0, error);
        };
        let record = match self.store.get(fqn) {
            Ok(record) => record,
            Err(e) => return track.fail(None, 0, self.store_error(e)),
        };
        let prior_seq = record.as_ref().map_or(0, |r| r.seq);

        if let Some(record) = &record
            && record.kind != handle.kind()
        {
            let error = ApplyError::Validation(format!(
                "kind changed from '{}' to '{}'; remove the resource before redeclaring it",
                record.kind,
                handle.kind()
            ));
            return track.fail(None, prior_seq, error);
        }

        let news = match handle
            .props()
            .resolve(|upstream| lock(&self.outputs).get(upstream).cloned())
        {
            Ok(news) => news,
            Err(e) => return track.fail(None, prior_seq, e.into()),
        };
        if let Err(e) = provider.validate(&news) {
            let error = match ApplyError::from_handler(e) {
                ApplyError::Handler(message) => ApplyError::Validation(message),
                other => other,
            };
            return track.fail(None, prior_seq, error);
        }

        let action = compute_action(
            &news,
            record.as_ref(),
            self.orchestrator.options.force,
            handle.adopt(),
        );
        if let (Action::Noop, Some(record)) = (action, &record) {
            let merged = record.merged_output();
            if let Err(e) = track.advance(ResourceStatus::Success, None) {
                return track.fail(Some(action), record.seq, e);
            }
            lock(&self.outputs).insert(fqn.to_string(), merged.clone());
            handle.settle(ResourceStatus::Success, record.seq, Some(merged));
            return track.outcome(Some(action), record.seq, None);
        }

        // The marker keeps the prior props and output on update, so a failed
        // update leaves the last applied state intact
        let mut marker = match (&record, action) {
            (Some(prior), Action::Update) => prior.clone(),
            _ => {
                let mut fresh = StateRecord::new(fqn, handle.kind(), handle.id());
                fresh.props = news.clone();
                fresh
            }
        };
        let in_progress = action
            .in_progress_status()
            .unwrap_or(ResourceStatus::Updating);
        marker.status = in_progress;
        marker.deps = handle.dependencies();
        marker.message = None;
        marker.updated_at = Utc::now();

        if let Err(e) = self.store.set(fqn, &marker) {
            return track.fail(Some(action), prior_seq, self.store_error(e));
        }
        if let Err(e) = track.advance(in_progress, None) {
            return track.fail(Some(action), prior_seq, e);
        }

        let ctx = self.handler_context(fqn, Some(handle), marker.seq);
        let result = call_handler(|| match (&record, action) {
            (Some(prior), Action::Update) => {
                provider.update(&ctx, handle.id(), &news, &prior.props, &prior.output)
            }
            _ => provider.create(&ctx, handle.id(), &news),
        });

        match result {
            Ok(output) => {
                let mut done = marker;
                done.seq += 1;
                done.status = action.done_status();
                done.props = news;
                done.output = output;
                done.updated_at = Utc::now();
                if let Err(e) = self.store.set(fqn, &done) {
                    log::error!("{fqn} was applied but its state could not be saved");
                    return track.fail(Some(action), prior_seq, self.store_error(e));
                }

                let merged = done.merged_output();
                if let Err(e) = track.advance(done.status, None) {
                    return track.fail(Some(action), done.seq, e);
                }
                lock(&self.outputs).insert(fqn.to_string(), merged.clone());
                handle.settle(done.status, done.seq, Some(merged));
                track.outcome(Some(action), done.seq, None)
            }
            Err(error) => {
                marker.status = ResourceStatus::Fail;
                marker.message = Some(error.to_string());
                marker.updated_at = Utc::now();
                if let Err(e) = self.store.set(fqn, &marker) {
                    log::warn!("Could not record failure of {fqn}: {e}");
                    self.store_error(e);
                }
                track.fail(Some(action), prior_seq, error)
            }
        }
    }

    /// Report `keys` as skipped without touching them
    fn halted_all(&self, keys: Vec<String>) -> Result<Vec<Outcome>, RunError> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let record = match self.store.get(&key) {
                Ok(record) => record,
                Err(e) if e.is_connectivity() => return Err(RunError::Store(e)),
                Err(e) => {
                    log::warn!("Could not read orphan {key}: {e}");
                    None
                }
            };
            let kind = record.as_ref().map_or("", |r| r.kind.as_str());
            let mut outcome =
                self.unscheduled(&key, kind, None, Scheduled::Skipped(SkipReason::Halted));
            if let Some(record) = &record {
                outcome.status = record.status;
                outcome.seq = record.seq;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Delete `keys` in reverse dependency order, using the deps in their records
    fn delete_all(
        &self,
        keys: Vec<String>,
        handles: &HashMap<String, ResourceHandle>,
    ) -> Result<Vec<Outcome>, RunError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut kinds = Vec::with_capacity(keys.len());
        let mut nodes = Vec::with_capacity(keys.len());
        for key in &keys {
            let (kind, deps) = match self.store.get(key) {
                Ok(Some(record)) => (record.kind, record.deps),
                Ok(None) => (String::new(), Vec::new()),
                Err(e) if e.is_connectivity() => return Err(RunError::Store(e)),
                Err(e) => {
                    log::warn!("Could not read {key} to order its deletion: {e}");
                    (String::new(), Vec::new())
                }
            };
            kinds.push(kind);
            nodes.push((key.clone(), deps));
        }

        let graph = Graph::new(nodes).reversed();
        graph.check_acyclic()?;
        let results = executor::execute(&graph, &self.execute_options(), |i| {
            self.delete_resource(&keys[i], &kinds[i], handles.get(&keys[i]))
        })
        .map_err(|e| RunError::Executor(e.to_string()))?;

        Ok(keys
            .iter()
            .zip(kinds.iter())
            .zip(results)
            .map(|((key, kind), scheduled)| {
                self.unscheduled(key, kind, handles.get(key), scheduled)
            })
            .collect())
    }

    /// Tear down one stored resource and remove its record
    fn delete_resource(&self, key: &str, kind: &str, handle: Option<&ResourceHandle>) -> Outcome {
        let _guard = self.orchestrator.locks.lock(key);
        let mut track = self.tracker(key, kind, handle);

        let record = match self.store.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Already gone
                if let Err(e) = track.advance(ResourceStatus::Success, None) {
                    return track.fail(Some(Action::Delete), 0, e);
                }
                return track.outcome(Some(Action::Noop), 0, None);
            }
            Err(e) => return track.fail(Some(Action::Delete), 0, self.store_error(e)),
        };
        track.kind.clone_from(&record.kind);

        if record.has_been_created() {
            let Some(provider) = self.orchestrator.providers.get(&record.kind) else {
                let error = ApplyError::Validation(format!(
                    "no provider for kind '{}'; cannot delete",
                    record.kind
                ));
                return track.fail(Some(Action::Delete), record.seq, error);
            };

            let mut marker = record.clone();
            marker.status = ResourceStatus::Deleting;
            marker.updated_at = Utc::now();
            if let Err(e) = self.store.set(key, &marker) {
                return track.fail(Some(Action::Delete), record.seq, self.store_error(e));
            }
            if let Err(e) = track.advance(ResourceStatus::Deleting, None) {
                return track.fail(Some(Action::Delete), record.seq, e);
            }

            let ctx = self.handler_context(key, handle, record.seq);
            if let Err(error) =
                call_handler(|| provider.delete(&ctx, &record.id, &record.props, &record.output))
            {
                marker.status = ResourceStatus::Fail;
                marker.message = Some(error.to_string());
                marker.updated_at = Utc::now();
                if let Err(e) = self.store.set(key, &marker) {
                    log::warn!("Could not record failure of {key}: {e}");
                    self.store_error(e);
                }
                return track.fail(Some(Action::Delete), record.seq, error);
            }
        } else {
            // No create ever completed, so there is nothing to tear down
            log::debug!("Dropping record of never-created {key}");
            if let Err(e) = track.advance(ResourceStatus::Deleting, None) {
                return track.fail(Some(Action::Delete), record.seq, e);
            }
        }

        if let Err(e) = self.store.delete(key) {
            return track.fail(Some(Action::Delete), record.seq, self.store_error(e));
        }
        lock(&self.outputs).remove(key);
        if let Err(e) = track.advance(ResourceStatus::Deleted, None) {
            return track.fail(Some(Action::Delete), record.seq, e);
        }
        if let Some(handle) = handle {
            handle.settle(ResourceStatus::Deleted, record.seq, None);
        }
        track.outcome(Some(Action::Delete), record.seq, None)
    }
}
