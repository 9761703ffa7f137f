//! Application entry point: declare, then apply, destroy or read
//!
//! [`App`] ties the configuration to a state store, a provider registry and a
//! context registry. Each run builds a fresh root scope, hands it to the
//! caller's declaration closure, seals it and dispatches on the phase.

use crate::config::Config;
use crate::store::StoreSelector;
use anyhow::{Context, Result};
use reconcile::{
    ApplyOptions, ApplyReport, CancelToken, ContextRegistry, EventBus, LogSubscriber,
    Orchestrator, Phase, Plan, ProviderRegistry, RootOptions, Scope, Subscription,
};
use statekit::StateStore;
use std::sync::Arc;

pub struct App {
    config: Config,
    store: Arc<dyn StateStore>,
    orchestrator: Orchestrator,
    registry: Arc<ContextRegistry>,
    cancel: CancelToken,
    _log_events: Option<Subscription>,
}

impl App {
    /// Validate `config` and open the state store it selects
    pub fn new(config: Config, providers: ProviderRegistry) -> Result<Self> {
        config.validate()?;
        let store = StoreSelector::build(&config).context("Failed to set up the state store")?;
        Self::with_store(config, providers, store)
    }

    /// Use an already constructed state store instead of the configured one
    pub fn with_store(
        config: Config,
        providers: ProviderRegistry,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ContextRegistry::new());
        let cancel = CancelToken::new();
        let options = ApplyOptions {
            concurrency: config.concurrency,
            failure_policy: config.failure_policy,
            force: config.force,
            cancel: cancel.clone(),
        };
        let events = EventBus::new();
        let log_events = (!config.quiet).then(|| LogSubscriber::attach(&events));
        let orchestrator = Orchestrator::new(Arc::new(providers))
            .with_events(events)
            .with_registry(registry.clone())
            .with_options(options);

        log::debug!(
            "Initialised app '{}' stage '{}' ({} state store, {} providers)",
            config.app,
            config.stage,
            store.backend(),
            orchestrator.providers().len()
        );
        Ok(Self {
            config,
            store,
            orchestrator,
            registry,
            cancel,
            _log_events: log_events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Subscribe here for per-resource status events
    pub fn events(&self) -> &EventBus {
        self.orchestrator.events()
    }

    /// Long-lived contexts shared with provider handlers
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Cancelling stops runs from starting new work; in-flight handlers finish
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Declare and run the configured phase
    ///
    /// A run that leaves resources failed or skipped returns an error that
    /// downcasts to [`reconcile::RunError`] carrying the full report.
    pub fn run<F>(&self, declare: F) -> Result<ApplyReport>
    where
        F: FnOnce(&Scope) -> Result<()>,
    {
        self.run_phase(self.config.phase, declare)
    }

    /// Declare and run `phase`, ignoring the configured one
    pub fn run_phase<F>(&self, phase: Phase, declare: F) -> Result<ApplyReport>
    where
        F: FnOnce(&Scope) -> Result<()>,
    {
        let scope = self.declare(phase, declare)?;
        let report = match phase {
            Phase::Up => self.orchestrator.apply(&scope)?,
            Phase::Destroy => self.orchestrator.destroy(&scope)?,
            Phase::Read => self.orchestrator.read(&scope)?,
        };
        log::debug!("Phase {phase} of {} finished: {}", scope.fqn(), report.summary());
        Ok(report)
    }

    /// Declare and compute what an `up` run would do
    pub fn plan<F>(&self, declare: F) -> Result<Plan>
    where
        F: FnOnce(&Scope) -> Result<()>,
    {
        let scope = self.declare(Phase::Up, declare)?;
        Ok(self.orchestrator.plan(&scope)?)
    }

    fn declare<F>(&self, phase: Phase, declare: F) -> Result<Scope>
    where
        F: FnOnce(&Scope) -> Result<()>,
    {
        let options = RootOptions::new(self.config.stage.as_str(), self.store.clone())
            .with_phase(phase)
            .with_mode(self.config.mode);
        let scope = Scope::root(self.config.app.as_str(), options)?;
        declare(&scope).with_context(|| format!("Declaring {} failed", scope.fqn()))?;
        scope.seal();
        Ok(scope)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        let disposed = self.registry.dispose_all();
        if disposed > 0 {
            log::debug!("Disposed {disposed} contexts for app '{}'", self.config.app);
        }
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("app", &self.config.app)
            .field("stage", &self.config.stage)
            .field("phase", &self.config.phase)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StateConfig, StoreKind};
    use reconcile::{Disposable, HandlerContext, Mode, Provider, RunError};
    use statekit::backends::MemoryStore;
    use statekit::{RecordCodec, Value};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, call: String) {
            self.0.lock().unwrap().push(call);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Bucket {
        calls: Arc<Calls>,
    }

    impl Provider for Bucket {
        fn kind(&self) -> &str {
            "bucket"
        }

        fn create(&self, ctx: &HandlerContext<'_>, id: &str, news: &Value) -> anyhow::Result<Value> {
            self.calls.push(format!("create {id} {}", ctx.mode));
            if news.get("fail").is_some() {
                anyhow::bail!("quota exceeded");
            }
            Ok(Value::map([("arn", format!("arn:bucket:{id}"))]))
        }

        fn update(
            &self,
            _ctx: &HandlerContext<'_>,
            id: &str,
            _news: &Value,
            _olds: &Value,
            prior_output: &Value,
        ) -> anyhow::Result<Value> {
            self.calls.push(format!("update {id}"));
            Ok(prior_output.clone())
        }

        fn delete(
            &self,
            _ctx: &HandlerContext<'_>,
            id: &str,
            _olds: &Value,
            _prior_output: &Value,
        ) -> anyhow::Result<()> {
            self.calls.push(format!("delete {id}"));
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            app: "shop".into(),
            stage: "dev".into(),
            quiet: true,
            state: StateConfig {
                backend: StoreKind::Memory,
                ..StateConfig::default()
            },
            ..Config::default()
        }
    }

    fn app(config: Config) -> (App, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let mut providers = ProviderRegistry::new();
        providers
            .register(Bucket {
                calls: calls.clone(),
            })
            .unwrap();
        (App::new(config, providers).unwrap(), calls)
    }

    fn declare_two(scope: &Scope) -> Result<()> {
        let assets = scope.declare("bucket", "assets", Value::map([("name", "assets")]))?;
        scope.scoped("web", |web| {
            web.declare(
                "bucket",
                "logs",
                Value::map([("target", assets.output_field("arn"))]),
            )
            .map(|_| ())
        })??;
        Ok(())
    }

    #[test]
    fn test_up_then_noop_then_destroy() {
        let (app, calls) = app(config());

        let report = app.run(declare_two).unwrap();
        assert_eq!(report.summary().created, 2);
        assert_eq!(calls.take(), vec!["create assets live", "create logs live"]);
        assert_eq!(app.store().count().unwrap(), 2);

        let report = app.run(declare_two).unwrap();
        assert_eq!(report.summary().unchanged, 2);
        assert!(calls.take().is_empty());

        let report = app.run_phase(Phase::Destroy, |_| Ok(())).unwrap();
        assert_eq!(report.summary().deleted, 2);
        assert_eq!(calls.take(), vec!["delete logs", "delete assets"]);
        assert_eq!(app.store().count().unwrap(), 0);
    }

    #[test]
    fn test_mode_reaches_handlers() {
        let (app, calls) = app(Config {
            mode: Mode::Local,
            ..config()
        });
        app.run(|scope| scope.declare("bucket", "a", Value::Null).map(|_| ()).map_err(Into::into))
            .unwrap();
        assert_eq!(calls.take(), vec!["create a local"]);
    }

    #[test]
    fn test_read_phase_loads_outputs() {
        let (app, calls) = app(config());
        app.run(declare_two).unwrap();
        calls.take();

        let mut logs = None;
        let report = app
            .run_phase(Phase::Read, |scope| {
                declare_two(scope)?;
                logs = scope.find("shop/dev/web/logs");
                Ok(())
            })
            .unwrap();
        assert!(report.is_success());
        assert!(calls.take().is_empty());
        let logs = logs.unwrap();
        assert_eq!(
            logs.current_output().unwrap().get("arn"),
            Some(&Value::from("arn:bucket:logs"))
        );
    }

    #[test]
    fn test_plan_invokes_no_handler() {
        let (app, calls) = app(config());
        let plan = app.plan(declare_two).unwrap();
        assert_eq!(plan.summary().creates, 2);
        assert!(plan.get("shop/dev/web/logs").unwrap().known_after_apply);
        assert!(calls.take().is_empty());
        assert_eq!(app.store().count().unwrap(), 0);
    }

    #[test]
    fn test_declaration_error_aborts_run() {
        let (app, calls) = app(config());
        let err = app
            .run(|scope| {
                scope.declare("bucket", "a", Value::Null)?;
                scope.declare("bucket", "a", Value::Null)?;
                Ok(())
            })
            .unwrap_err();
        assert!(format!("{err:#}").contains("already declared"), "{err:#}");
        assert!(calls.take().is_empty());
        assert_eq!(app.store().count().unwrap(), 0);
    }

    #[test]
    fn test_failed_run_carries_report() {
        let (app, _calls) = app(config());
        let err = app
            .run(|scope| {
                scope.declare("bucket", "broken", Value::map([("fail", true)]))?;
                scope.declare("bucket", "fine", Value::Null)?;
                Ok(())
            })
            .unwrap_err();
        let report = err.downcast_ref::<RunError>().and_then(RunError::report).unwrap();
        let summary = report.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.created, 1);
    }

    #[test]
    fn test_shared_store_across_apps() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new("", RecordCodec::plain()));
        let calls = Arc::new(Calls::default());
        let providers = || {
            let mut providers = ProviderRegistry::new();
            providers
                .register(Bucket {
                    calls: calls.clone(),
                })
                .unwrap();
            providers
        };

        let first = App::with_store(config(), providers(), store.clone()).unwrap();
        first.run(declare_two).unwrap();
        drop(first);

        let second = App::with_store(config(), providers(), store).unwrap();
        let report = second.run(declare_two).unwrap();
        assert_eq!(report.summary().unchanged, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let providers = ProviderRegistry::new();
        assert!(App::new(Config { app: String::new(), ..config() }, providers).is_err());
    }

    struct Emulator {
        disposed: Arc<AtomicBool>,
    }

    impl Disposable for Emulator {
        fn dispose(&self) -> anyhow::Result<()> {
            self.disposed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_registry_disposed_on_drop() {
        let (app, _calls) = app(config());
        let disposed = Arc::new(AtomicBool::new(false));
        app.registry().register(
            "emulator",
            Arc::new(Emulator {
                disposed: disposed.clone(),
            }),
        );
        assert!(!disposed.load(Ordering::SeqCst));
        drop(app);
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_app_starts_nothing() {
        let (app, calls) = app(config());
        app.cancel_token().cancel();
        let err = app.run(declare_two).unwrap_err();
        let report = err.downcast_ref::<RunError>().and_then(RunError::report).unwrap();
        assert_eq!(report.skipped().count(), 2);
        assert!(calls.take().is_empty());
    }
}
