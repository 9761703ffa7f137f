//! # Stratum
//!
//! Embeddable infrastructure-as-code engine. Resources are declared with
//! ordinary Rust code into a scope tree, then reconciled against recorded
//! state by provider handlers.
//!
//! This crate is the bootstrap layer over [`reconcile`] and [`statekit`]:
//!
//! - [`Config`]: `stratum.toml` plus `STRATUM_*` environment overrides
//! - [`paths`]: config and state directory resolution
//! - [`logging`]: `env_logger` setup from verbosity flags
//! - [`StoreSelector`]: the state backend a config selects
//! - [`App`]: runs a declaration closure, then apply, destroy or read
//!
//! ## Example
//!
//! ```
//! use stratum::{App, Config, StoreKind};
//! use stratum::reconcile::{HandlerContext, Provider, ProviderRegistry};
//! use stratum::statekit::Value;
//!
//! struct Queue;
//!
//! impl Provider for Queue {
//!     fn kind(&self) -> &str {
//!         "queue"
//!     }
//!
//!     fn create(&self, _ctx: &HandlerContext<'_>, id: &str, _news: &Value) -> anyhow::Result<Value> {
//!         Ok(Value::map([("url", format!("queue://{id}"))]))
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
//! let mut config = Config::default();
//! config.app = "shop".into();
//! config.stage = "dev".into();
//! config.state.backend = StoreKind::Memory;
//!
//! let mut providers = ProviderRegistry::new();
//! providers.register(Queue)?;
//! let app = App::new(config, providers)?;
//!
//! let report = app.run(|scope| {
//!     scope.declare("queue", "orders", Value::map([("fifo", true)]))?;
//!     Ok(())
//! })?;
//! assert_eq!(report.summary().created, 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod app;
pub mod config;
pub mod logging;
pub mod paths;
pub mod store;

pub use app::App;
pub use config::{Config, StateConfig, StoreKind};
pub use store::StoreSelector;

pub use reconcile;
pub use statekit;
