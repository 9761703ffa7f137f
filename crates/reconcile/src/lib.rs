//! # Reconcile
//!
//! Resource orchestration: declare resources into a scope tree, diff them
//! against stored state and converge the target platform with bounded
//! concurrency.
//!
//! ## Core Concepts
//!
//! - **Scope**: a node of the declaration tree; resources are declared into it
//!   with ordinary code, and the handle is passed explicitly
//! - **Provider**: the create/update/delete handlers of one resource kind
//! - **Orchestrator**: runs apply, destroy, plan and read passes
//! - **EventBus**: streams status transitions to subscribers
//! - **ContextRegistry**: long-lived named contexts owned by the caller
//!
//! Dependencies are data: putting one resource's
//! [`output_field`](ResourceHandle::output_field) into another's props orders
//! the two and resolves the binding before the dependent's handler runs.
//!
//! ## Example
//!
//! ```
//! use reconcile::{HandlerContext, Orchestrator, Provider, ProviderRegistry, RootOptions, Scope};
//! use statekit::backends::MemoryStore;
//! use statekit::{RecordCodec, Value};
//! use std::sync::Arc;
//!
//! struct Bucket;
//!
//! impl Provider for Bucket {
//!     fn kind(&self) -> &str {
//!         "bucket"
//!     }
//!
//!     fn create(&self, _ctx: &HandlerContext<'_>, id: &str, _news: &Value) -> anyhow::Result<Value> {
//!         Ok(Value::map([("arn", format!("arn:bucket:{id}"))]))
//!     }
//!
//!     fn update(
//!         &self,
//!         _ctx: &HandlerContext<'_>,
//!         _id: &str,
//!         _news: &Value,
//!         _olds: &Value,
//!         prior_output: &Value,
//!     ) -> anyhow::Result<Value> {
//!         Ok(prior_output.clone())
//!     }
//!
//!     fn delete(
//!         &self,
//!         _ctx: &HandlerContext<'_>,
//!         _id: &str,
//!         _olds: &Value,
//!         _prior_output: &Value,
//!     ) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let mut providers = ProviderRegistry::new();
//! providers.register(Bucket).unwrap();
//! let orchestrator = Orchestrator::new(Arc::new(providers));
//!
//! let store = Arc::new(MemoryStore::new("", RecordCodec::plain()));
//! let scope = Scope::root("shop", RootOptions::new("dev", store)).unwrap();
//! let assets = scope
//!     .declare("bucket", "assets", Value::map([("name", "assets")]))
//!     .unwrap();
//!
//! let report = orchestrator.apply(&scope).unwrap();
//! assert_eq!(report.summary().created, 1);
//! assert_eq!(
//!     assets.current_output().unwrap().get("arn"),
//!     Some(&Value::from("arn:bucket:assets"))
//! );
//! ```

pub mod diff;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod lifecycle;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod scope;
pub mod types;

// Re-export main types at crate root
pub use diff::{Plan, PlanEntry, PlanSummary, compute_action};
pub use error::{ApplyError, DeclareError, GraphError, RunError, TransitionError};
pub use events::{ApplyEvent, EventBus, LogSubscriber, Subscription};
pub use executor::{CancelToken, ExecuteOptions, KeyLocks, execute};
pub use graph::Graph;
pub use lifecycle::{Action, Lifecycle};
pub use orchestrator::Orchestrator;
pub use provider::{Conflict, HandlerContext, Invalid, Provider, ProviderRegistry};
pub use registry::{ContextRegistry, Disposable};
pub use scope::{DeclareOptions, ResourceHandle, RootOptions, Scope};
pub use types::{ApplyOptions, ApplyReport, FailurePolicy, Mode, Outcome, Phase, Summary};
