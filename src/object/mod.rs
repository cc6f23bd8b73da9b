//! Owner objects and the capability set the pipeline depends on.
//!
//! The pipeline and the fan-out logic only see [`Reconcilable`]; concrete
//! kinds such as [`Deployment`] implement it.

mod deployment;
pub mod status;

pub use deployment::{
    DependencyRef, Deployment, DeploymentLoadError, DeploymentSpec, ImageOverride, ObjectMeta,
    DEPLOYMENT_KIND,
};
pub use status::{Condition, ConditionStatus, DeploymentStatus, OperationResult};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Finalizer that keeps an object around until its artifacts are removed.
pub const FINALIZER: &str = "driftgate.dev/finalizer";

/// Namespace used when an object does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Source kind used when a reference does not name one.
pub const DEFAULT_SOURCE_KIND: &str = "GitRepository";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid object key {0:?}: expected <namespace>/<name>")]
pub struct ObjectKeyError(pub String);

/// `namespace/name` identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = ObjectKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(ObjectKey::new(ns, name))
            }
            None if !s.is_empty() => Ok(ObjectKey::new(DEFAULT_NAMESPACE, s)),
            _ => Err(ObjectKeyError(s.to_string())),
        }
    }
}

/// Reference to the upstream source an object deploys from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(default = "default_source_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Local directory holding the source tree, for providers that read
    /// from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_source_kind() -> String {
    DEFAULT_SOURCE_KIND.to_string()
}

/// Kind-qualified identity of an upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub kind: String,
    pub key: ObjectKey,
}

impl SourceKey {
    pub fn new(kind: impl Into<String>, key: ObjectKey) -> Self {
        Self {
            kind: kind.into(),
            key,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

impl SourceRef {
    /// Source identity, defaulting the namespace to the referring object's.
    pub fn resolve(&self, default_namespace: &str) -> ObjectKey {
        ObjectKey::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            self.name.clone(),
        )
    }

    /// Source identity including its kind.
    pub fn source_key(&self, default_namespace: &str) -> SourceKey {
        SourceKey::new(self.kind.clone(), self.resolve(default_namespace))
    }
}

/// Action windows for deploy and prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<String>,
}

/// Capability set shared by every reconcilable kind.
pub trait Reconcilable: Send {
    fn kind(&self) -> &'static str;
    fn key(&self) -> ObjectKey;
    fn generation(&self) -> i64;

    fn is_deleting(&self) -> bool;
    fn is_suspended(&self) -> bool;
    fn has_finalizer(&self, finalizer: &str) -> bool;
    fn add_finalizer(&mut self, finalizer: &str);
    fn remove_finalizer(&mut self, finalizer: &str);

    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Objects that must be reconciled before this one, namespaces resolved.
    fn depends_on(&self) -> Vec<ObjectKey>;
    fn source_ref(&self) -> &SourceRef;
    fn timing(&self) -> Option<&TimingSpec>;

    fn project_status(&self) -> &DeploymentStatus;
    fn project_status_mut(&mut self) -> &mut DeploymentStatus;

    fn deployment_spec(&self) -> &DeploymentSpec;

    /// Requeue interval after a successful reconciliation.
    fn interval(&self) -> Duration;
    /// Requeue interval after a transient failure.
    fn retry_interval(&self) -> Duration;
}
