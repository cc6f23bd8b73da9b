//! Built-in controller defaults (layer 1)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where artifacts live and how they are advertised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory of the artifact store.
    pub path: PathBuf,

    /// Host (and port) used in advertised artifact URLs.
    pub hostname: String,

    /// How long to wait for an artifact lock (default: 30)
    pub lock_timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./artifacts"),
            hostname: "localhost:9090".to_string(),
            lock_timeout_seconds: 30,
        }
    }
}

/// Deployment engine subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub binary: PathBuf,

    /// Arguments placed before every subcommand.
    pub args: Vec<String>,

    /// Time between SIGTERM and SIGKILL on cancellation (default: 10)
    pub termination_grace_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kluctl"),
            args: Vec::new(),
            termination_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Objects reconciled in parallel (default: 4)
    pub max_concurrent: usize,

    /// Whole-reconciliation timeout; 0 disables it (default: 600)
    pub timeout_seconds: u64,

    /// Minimum artifact age before collection (default: 300)
    pub gc_grace_seconds: u64,

    /// Requeue delay while outside a deploy window (default: 60)
    pub window_recheck_seconds: u64,

    /// Directory holding one subdirectory per credential reference.
    pub credentials_dir: Option<PathBuf>,

    /// Directory that relative source paths resolve against.
    pub source_base_dir: Option<PathBuf>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout_seconds: 600,
            gc_grace_seconds: 300,
            window_recheck_seconds: 60,
            credentials_dir: None,
            source_base_dir: None,
        }
    }
}

impl ReconcileConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Gitignore-style patterns excluded from every artifact.
    pub ignore: Vec<String>,
}

/// Complete controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub reconcile: ReconcileConfig,
    pub archive: ArchiveConfig,
}

impl ControllerConfig {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
