//! Declaration tree
//!
//! A [`Scope`] is a node in the tree built by running declaration code once.
//! Resources are registered with [`Scope::declare`]; nested groupings with
//! [`Scope::child`] or [`Scope::scoped`]. The scope handle is passed
//! explicitly to every declaration, so independent trees can be built and run
//! concurrently.
//!
//! Fully-qualified names have the form `<app>/<stage>/<scope ids...>/<id>`.

use crate::error::{DeclareError, Result};
use crate::types::{Mode, Phase};
use statekit::{OutputRef, ResourceStatus, StateStore, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Check an id against `[A-Za-z0-9._-]+`
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DeclareError::InvalidId(id.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Per-declaration options
#[derive(Debug, Clone, Default)]
pub struct DeclareOptions {
    /// Claim an existing object with the same identity instead of failing
    pub adopt: bool,
    /// Ordering-only dependencies, in addition to the bindings found in props
    pub depends_on: Vec<String>,
    /// Opaque id forwarded on progress events
    pub binding_id: Option<String>,
}

impl DeclareOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn adopt(mut self) -> Self {
        self.adopt = true;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, upstream: &ResourceHandle) -> Self {
        self.depends_on.push(upstream.fqn().to_string());
        self
    }

    #[must_use]
    pub fn depends_on_fqn(mut self, fqn: impl Into<String>) -> Self {
        self.depends_on.push(fqn.into());
        self
    }

    #[must_use]
    pub fn binding(mut self, binding_id: impl Into<String>) -> Self {
        self.binding_id = Some(binding_id.into());
        self
    }
}

#[derive(Debug)]
struct Runtime {
    status: ResourceStatus,
    seq: u64,
    output: Option<Value>,
}

struct ResourceNode {
    fqn: String,
    id: String,
    kind: String,
    props: Value,
    mode: Mode,
    options: DeclareOptions,
    runtime: Mutex<Runtime>,
}

/// A declared resource
///
/// The handle is how dependents bind to this resource's output: put
/// [`output`](Self::output) or [`output_field`](Self::output_field) into
/// another resource's props and the orchestrator orders the two and resolves
/// the binding before the dependent's handler runs.
#[derive(Clone)]
pub struct ResourceHandle(Arc<ResourceNode>);

impl ResourceHandle {
    pub fn fqn(&self) -> &str {
        &self.0.fqn
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    /// Declared props, possibly containing unresolved bindings
    pub fn props(&self) -> &Value {
        &self.0.props
    }

    pub fn mode(&self) -> Mode {
        self.0.mode
    }

    pub fn adopt(&self) -> bool {
        self.0.options.adopt
    }

    pub fn binding_id(&self) -> Option<&str> {
        self.0.options.binding_id.as_deref()
    }

    /// Binding to this resource's whole output
    pub fn output(&self) -> Value {
        Value::Ref(self.output_ref())
    }

    /// Binding to one field of this resource's output
    pub fn output_field(&self, name: impl Into<String>) -> Value {
        Value::Ref(self.output_ref().field(name))
    }

    pub fn output_ref(&self) -> OutputRef {
        OutputRef::new(self.fqn())
    }

    /// FQNs this resource depends on: bindings in props, then `depends_on`
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let bound = self.0.props.refs().into_iter().map(|r| r.fqn.as_str());
        let explicit = self.0.options.depends_on.iter().map(String::as_str);
        for fqn in bound.chain(explicit) {
            if !deps.iter().any(|d| d == fqn) {
                deps.push(fqn.to_string());
            }
        }
        deps
    }

    /// Status reached in the latest run
    pub fn status(&self) -> ResourceStatus {
        lock(&self.0.runtime).status
    }

    /// Stored revision after the latest run
    pub fn seq(&self) -> u64 {
        lock(&self.0.runtime).seq
    }

    /// Props merged with the output, once the resource has been applied or read
    pub fn current_output(&self) -> Option<Value> {
        lock(&self.0.runtime).output.clone()
    }

    pub(crate) fn set_status(&self, status: ResourceStatus) {
        lock(&self.0.runtime).status = status;
    }

    pub(crate) fn settle(&self, status: ResourceStatus, seq: u64, output: Option<Value>) {
        let mut runtime = lock(&self.0.runtime);
        runtime.status = status;
        runtime.seq = seq;
        runtime.output = output;
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("fqn", &self.0.fqn)
            .field("kind", &self.0.kind)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Scopes
// =============================================================================

/// Settings of a root scope
#[derive(Clone)]
pub struct RootOptions {
    pub stage: String,
    pub phase: Phase,
    pub mode: Mode,
    pub store: Arc<dyn StateStore>,
}

impl RootOptions {
    pub fn new(stage: impl Into<String>, store: Arc<dyn StateStore>) -> Self {
        Self {
            stage: stage.into(),
            phase: Phase::default(),
            mode: Mode::default(),
            store,
        }
    }

    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

struct Shared {
    app: String,
    stage: String,
    phase: Phase,
    store: Arc<dyn StateStore>,
}

#[derive(Default)]
struct ScopeInner {
    children: Vec<Scope>,
    resources: Vec<ResourceHandle>,
    sealed: bool,
}

impl ScopeInner {
    fn has_name(&self, id: &str) -> bool {
        self.children.iter().any(|c| c.id() == id) || self.resources.iter().any(|r| r.id() == id)
    }
}

struct ScopeNode {
    id: String,
    fqn: String,
    mode: Mode,
    parent: Weak<ScopeNode>,
    shared: Arc<Shared>,
    inner: Mutex<ScopeInner>,
}

/// Handle to a node of the declaration tree
#[derive(Clone)]
pub struct Scope(Arc<ScopeNode>);

impl Scope {
    /// Start a new tree for `app`
    pub fn root(app: impl Into<String>, options: RootOptions) -> Result<Self> {
        let app = app.into();
        validate_id(&app)?;
        validate_id(&options.stage)?;

        let fqn = format!("{app}/{}", options.stage);
        Ok(Self(Arc::new(ScopeNode {
            id: app.clone(),
            fqn,
            mode: options.mode,
            parent: Weak::new(),
            shared: Arc::new(Shared {
                app,
                stage: options.stage,
                phase: options.phase,
                store: options.store,
            }),
            inner: Mutex::default(),
        })))
    }

    /// Create a child scope inheriting this scope's mode
    pub fn child(&self, id: &str) -> Result<Self> {
        self.child_with_mode(id, self.mode())
    }

    pub fn child_with_mode(&self, id: &str, mode: Mode) -> Result<Self> {
        validate_id(id)?;
        let mut inner = lock(&self.0.inner);
        self.check_open(&inner, id)?;

        let child = Self(Arc::new(ScopeNode {
            id: id.to_string(),
            fqn: format!("{}/{id}", self.0.fqn),
            mode,
            parent: Arc::downgrade(&self.0),
            shared: Arc::clone(&self.0.shared),
            inner: Mutex::default(),
        }));
        inner.children.push(child.clone());
        Ok(child)
    }

    /// Run a declaration block in a new child scope, sealing it afterwards
    pub fn scoped<R>(&self, id: &str, block: impl FnOnce(&Scope) -> R) -> Result<R> {
        let child = self.child(id)?;
        let result = block(&child);
        child.seal();
        Ok(result)
    }

    /// Declare a resource in this scope
    pub fn declare(
        &self,
        kind: impl Into<String>,
        id: &str,
        props: impl Into<Value>,
    ) -> Result<ResourceHandle> {
        self.declare_with(kind, id, props, DeclareOptions::default())
    }

    pub fn declare_with(
        &self,
        kind: impl Into<String>,
        id: &str,
        props: impl Into<Value>,
        options: DeclareOptions,
    ) -> Result<ResourceHandle> {
        validate_id(id)?;
        let mut inner = lock(&self.0.inner);
        self.check_open(&inner, id)?;

        let handle = ResourceHandle(Arc::new(ResourceNode {
            fqn: format!("{}/{id}", self.0.fqn),
            id: id.to_string(),
            kind: kind.into(),
            props: props.into(),
            mode: self.0.mode,
            options,
            runtime: Mutex::new(Runtime {
                status: ResourceStatus::Pending,
                seq: 0,
                output: None,
            }),
        }));
        inner.resources.push(handle.clone());
        Ok(handle)
    }

    fn check_open(&self, inner: &ScopeInner, id: &str) -> Result<()> {
        if inner.sealed {
            return Err(DeclareError::Sealed(self.0.fqn.clone()));
        }
        if inner.has_name(id) {
            return Err(DeclareError::Duplicate {
                scope: self.0.fqn.clone(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Close this scope and its descendants to further declarations
    pub fn seal(&self) {
        let children = {
            let mut inner = lock(&self.0.inner);
            inner.sealed = true;
            inner.children.clone()
        };
        for child in children {
            child.seal();
        }
    }

    pub fn is_sealed(&self) -> bool {
        lock(&self.0.inner).sealed
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn fqn(&self) -> &str {
        &self.0.fqn
    }

    /// Scope ids from the root (the app) down to this scope
    pub fn path(&self) -> Vec<String> {
        let mut path = vec![self.0.id.clone()];
        let mut current = self.parent();
        while let Some(scope) = current {
            path.push(scope.0.id.clone());
            current = scope.parent();
        }
        path.reverse();
        path
    }

    pub fn parent(&self) -> Option<Scope> {
        self.0.parent.upgrade().map(Scope)
    }

    pub fn root_scope(&self) -> Scope {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn app(&self) -> &str {
        &self.0.shared.app
    }

    pub fn stage(&self) -> &str {
        &self.0.shared.stage
    }

    pub fn phase(&self) -> Phase {
        self.0.shared.phase
    }

    pub fn mode(&self) -> Mode {
        self.0.mode
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.0.shared.store)
    }

    /// Resources declared directly in this scope, in declaration order
    pub fn resources(&self) -> Vec<ResourceHandle> {
        lock(&self.0.inner).resources.clone()
    }

    /// Child scopes in declaration order
    pub fn children(&self) -> Vec<Scope> {
        lock(&self.0.inner).children.clone()
    }

    /// Every resource in the subtree: this scope's own resources first, then
    /// each child scope's subtree in declaration order
    pub fn walk(&self) -> Vec<ResourceHandle> {
        let mut out = self.resources();
        for child in self.children() {
            out.extend(child.walk());
        }
        out
    }

    pub fn find(&self, fqn: &str) -> Option<ResourceHandle> {
        self.walk().into_iter().find(|r| r.fqn() == fqn)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("fqn", &self.0.fqn)
            .field("mode", &self.0.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statekit::RecordCodec;
    use statekit::backends::MemoryStore;

    fn root() -> Scope {
        let store = Arc::new(MemoryStore::new("", RecordCodec::plain()));
        Scope::root("shop", RootOptions::new("dev", store)).unwrap()
    }

    #[test]
    fn test_fqn_from_ancestry() {
        let root = root();
        let api = root.child("api").unwrap();
        let bucket = api.declare("bucket", "assets", Value::Null).unwrap();

        assert_eq!(root.fqn(), "shop/dev");
        assert_eq!(bucket.fqn(), "shop/dev/api/assets");
        assert_eq!(api.path(), vec!["shop", "api"]);
        assert_eq!(api.root_scope().fqn(), "shop/dev");
        assert_eq!(api.app(), "shop");
        assert_eq!(api.stage(), "dev");
    }

    #[test]
    fn test_invalid_ids() {
        let root = root();
        for bad in ["", "a/b", "has space", "..", "ü"] {
            assert_eq!(
                root.declare("bucket", bad, Value::Null).unwrap_err(),
                DeclareError::InvalidId(bad.to_string())
            );
        }
        assert!(root.declare("bucket", "a.b_c-1", Value::Null).is_ok());
    }

    #[test]
    fn test_duplicates_share_one_namespace() {
        let root = root();
        root.declare("bucket", "a", Value::Null).unwrap();
        assert!(matches!(
            root.declare("queue", "a", Value::Null),
            Err(DeclareError::Duplicate { .. })
        ));
        assert!(matches!(root.child("a"), Err(DeclareError::Duplicate { .. })));

        // Same id in another scope is fine
        root.child("api").unwrap().declare("bucket", "a", Value::Null).unwrap();
    }

    #[test]
    fn test_scoped_block_seals() {
        let root = root();
        let inner = root
            .scoped("api", |api| {
                api.declare("bucket", "b", Value::Null).unwrap();
                api.child("nested").unwrap()
            })
            .unwrap();

        assert!(inner.is_sealed());
        assert_eq!(
            inner.declare("bucket", "late", Value::Null).unwrap_err(),
            DeclareError::Sealed("shop/dev/api/nested".into())
        );
        assert!(!root.is_sealed());
    }

    #[test]
    fn test_walk_order_and_find() {
        let root = root();
        root.declare("k", "first", Value::Null).unwrap();
        let a = root.child("a").unwrap();
        a.declare("k", "x", Value::Null).unwrap();
        let b = root.child("b").unwrap();
        b.declare("k", "y", Value::Null).unwrap();
        a.declare("k", "z", Value::Null).unwrap();
        root.declare("k", "last", Value::Null).unwrap();

        let order: Vec<String> = root.walk().iter().map(|r| r.fqn().to_string()).collect();
        assert_eq!(
            order,
            vec![
                "shop/dev/first",
                "shop/dev/last",
                "shop/dev/a/x",
                "shop/dev/a/z",
                "shop/dev/b/y"
            ]
        );
        assert!(root.find("shop/dev/b/y").is_some());
        assert!(root.find("shop/dev/b/nope").is_none());
    }

    #[test]
    fn test_dependencies_from_bindings_and_options() {
        let root = root();
        let bucket = root.declare("bucket", "b", Value::Null).unwrap();
        let queue = root.declare("queue", "q", Value::Null).unwrap();
        let func = root
            .declare_with(
                "function",
                "f",
                Value::map([
                    ("bucket", bucket.output_field("arn")),
                    ("bucket_name", bucket.output_field("name")),
                ]),
                DeclareOptions::new().depends_on(&queue).binding("FN"),
            )
            .unwrap();

        assert_eq!(func.dependencies(), vec!["shop/dev/b", "shop/dev/q"]);
        assert_eq!(func.binding_id(), Some("FN"));
        assert_eq!(func.status(), ResourceStatus::Pending);
        assert!(func.current_output().is_none());
    }

    #[test]
    fn test_child_mode() {
        let root = root();
        let local = root.child_with_mode("emu", Mode::Local).unwrap();
        let nested = local.child("inner").unwrap();
        let r = nested.declare("bucket", "b", Value::Null).unwrap();
        assert_eq!(root.mode(), Mode::Live);
        assert_eq!(r.mode(), Mode::Local);
    }
}
