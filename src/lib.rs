//! driftgate - reconcile declared deployments against their source
//!
//! Each declared deployment names a source and a set of timing windows. A
//! reconciliation fetches the source, has the deployment engine materialize
//! it, stores the result as a content-addressed artifact and deploys it
//! when the deploy window allows. When a source moves to a new revision,
//! [`fanout::affected_dependents`] lists the deployments to requeue in
//! dependency order.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod engine;
pub mod events;
pub mod fanout;
pub mod metrics;
pub mod mock;
pub mod object;
pub mod pipeline;
pub mod source;

pub use cancel::{Context, ContextError};
pub use config::{ConfigError, ControllerConfig, EffectiveConfig};
pub use controller::{Controller, ReconcileOutcome};
pub use engine::{Engine, EngineError, ProcessEngine};
pub use fanout::{affected_dependents, FanoutError, ReconcileRequest};
pub use object::{Deployment, DeploymentSpec, ObjectKey, Reconcilable, SourceKey};
pub use pipeline::{PipelineError, ReconcileResult, Reconciler, Services};
