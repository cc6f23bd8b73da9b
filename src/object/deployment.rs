//! The `Deployment` kind: a declared deployment intent.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Condition, DeploymentStatus, ObjectKey, Reconcilable, SourceRef, TimingSpec,
    DEFAULT_NAMESPACE,
};

pub const DEPLOYMENT_KIND: &str = "Deployment";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_generation() -> i64 {
    1
}

fn default_interval_seconds() -> u64 {
    300
}

fn default_retry_interval_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_generation")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Reference to another deployment that must be ready first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Image pinned by the deployment instead of the one the project declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    pub image: String,
    pub result_image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub source: SourceRef,
    /// Sub-directory of the source tree holding the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageOverride>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,
    /// Patterns excluded from the stored artifact.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub prune: bool,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default)]
    pub delete_on_removal: bool,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: u64,
    /// Engine timeout; falls back to the controller default. Zero disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingSpec>,
    /// Names of credential entries handed to the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<String>,
}

impl DeploymentSpec {
    pub fn new(source: SourceRef) -> Self {
        Self {
            source,
            path: None,
            target: None,
            args: BTreeMap::new(),
            images: Vec::new(),
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            ignore: Vec::new(),
            dry_run: false,
            prune: false,
            validate: true,
            delete_on_removal: false,
            suspend: false,
            interval_seconds: default_interval_seconds(),
            retry_interval_seconds: default_retry_interval_seconds(),
            timeout_seconds: None,
            depends_on: Vec::new(),
            timing: None,
            credentials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

impl Deployment {
    pub fn new(namespace: &str, name: &str, spec: DeploymentSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                generation: default_generation(),
                deletion_timestamp: None,
                finalizers: Vec::new(),
            },
            spec,
            status: DeploymentStatus::default(),
        }
    }

    /// Load a deployment manifest from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, DeploymentLoadError> {
        let contents = fs::read_to_string(path).map_err(|e| DeploymentLoadError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| DeploymentLoadError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeploymentLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Reconcilable for Deployment {
    fn kind(&self) -> &'static str {
        DEPLOYMENT_KIND
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    fn generation(&self) -> i64 {
        self.metadata.generation
    }

    fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn is_suspended(&self) -> bool {
        self.spec.suspend
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.metadata.finalizers.push(finalizer.to_string());
        }
    }

    fn remove_finalizer(&mut self, finalizer: &str) {
        self.metadata.finalizers.retain(|f| f != finalizer);
    }

    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }

    fn depends_on(&self) -> Vec<ObjectKey> {
        self.spec
            .depends_on
            .iter()
            .map(|d| {
                ObjectKey::new(
                    d.namespace.as_deref().unwrap_or(&self.metadata.namespace),
                    d.name.clone(),
                )
            })
            .collect()
    }

    fn source_ref(&self) -> &SourceRef {
        &self.spec.source
    }

    fn timing(&self) -> Option<&TimingSpec> {
        self.spec.timing.as_ref()
    }

    fn project_status(&self) -> &DeploymentStatus {
        &self.status
    }

    fn project_status_mut(&mut self) -> &mut DeploymentStatus {
        &mut self.status
    }

    fn deployment_spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.spec.interval_seconds)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.spec.retry_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[metadata]
name = "web"
namespace = "apps"

[spec]
target = "prod"
prune = true
intervalSeconds = 120
includeTags = ["web"]

[spec.source]
name = "platform"
path = "/srv/platform"

[[spec.dependsOn]]
name = "database"

[[spec.dependsOn]]
name = "network"
namespace = "infra"

[spec.timing]
deploy = "Mon-Fri 06:30-20:30 Europe/Berlin"
"#;

    #[test]
    fn test_manifest_defaults() {
        let deployment: Deployment = toml::from_str(MANIFEST).unwrap();
        assert_eq!(deployment.metadata.generation, 1);
        assert_eq!(deployment.spec.source.kind, "GitRepository");
        assert!(deployment.spec.validate);
        assert!(!deployment.spec.dry_run);
        assert_eq!(deployment.interval(), Duration::from_secs(120));
        assert_eq!(deployment.retry_interval(), Duration::from_secs(60));
        assert_eq!(deployment.status, DeploymentStatus::default());
    }

    #[test]
    fn test_depends_on_resolves_namespaces() {
        let deployment: Deployment = toml::from_str(MANIFEST).unwrap();
        assert_eq!(
            deployment.depends_on(),
            vec![
                ObjectKey::new("apps", "database"),
                ObjectKey::new("infra", "network"),
            ]
        );
    }

    #[test]
    fn test_finalizers_are_unique() {
        let mut deployment: Deployment = toml::from_str(MANIFEST).unwrap();
        deployment.add_finalizer("a");
        deployment.add_finalizer("a");
        assert_eq!(deployment.metadata.finalizers, vec!["a".to_string()]);
        deployment.remove_finalizer("a");
        assert!(!deployment.has_finalizer("a"));
    }

    #[test]
    fn test_timing_exposed() {
        let deployment: Deployment = toml::from_str(MANIFEST).unwrap();
        let timing = deployment.timing().unwrap();
        assert_eq!(timing.deploy.as_deref(), Some("Mon-Fri 06:30-20:30 Europe/Berlin"));
        assert!(timing.prune.is_none());
    }
}
