//! Effective configuration with provenance
//!
//! Captures the merged [`ControllerConfig`] plus the layers it was built
//! from, so a run can report where each setting came from.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use driftgate_store::{Storage, StoreError};

use super::defaults::ControllerConfig;
use super::merge::merge_layers;
use crate::engine::ProcessEngineConfig;
use crate::pipeline::PipelineSettings;

/// Upper bound for any timeout, in seconds.
const MAX_TIMEOUT_SECONDS: u64 = 86_400;

const MAX_CONCURRENT: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing layer.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// SHA-256 of the raw file bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,
    pub config: ControllerConfig,
    /// Contributing layers in precedence order.
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Merge defaults, an optional TOML file and CLI overrides, then
    /// validate the result.
    pub fn build(file: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut layers = vec![ControllerConfig::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = file {
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_path_buf()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let config: ControllerConfig = serde_json::from_value(merge_layers(layers))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;

        Ok(Self {
            created_at: Utc::now(),
            config,
            sources,
        })
    }
}

fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::Parse(format!("{}: invalid UTF-8: {e}", path.display())))?;
    let table: toml::Value = toml::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;

    Ok((toml_to_json(table), digest))
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            Value::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect())
        }
    }
}

fn check_range(field: &str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::Validation(format!("{field} must be in (0, {max}]")));
    }
    Ok(())
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.hostname.trim().is_empty() {
            return Err(ConfigError::Validation("storage.hostname must not be empty".to_string()));
        }
        check_range("storage.lock_timeout_seconds", self.storage.lock_timeout_seconds, 3600)?;
        check_range("engine.termination_grace_seconds", self.engine.termination_grace_seconds, 300)?;
        check_range("reconcile.max_concurrent", self.reconcile.max_concurrent as u64, MAX_CONCURRENT as u64)?;
        check_range(
            "reconcile.gc_grace_seconds",
            self.reconcile.gc_grace_seconds,
            MAX_TIMEOUT_SECONDS,
        )?;
        check_range(
            "reconcile.window_recheck_seconds",
            self.reconcile.window_recheck_seconds,
            MAX_TIMEOUT_SECONDS,
        )?;
        if self.reconcile.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(ConfigError::Validation(format!(
                "reconcile.timeout_seconds must be at most {MAX_TIMEOUT_SECONDS}"
            )));
        }
        if self.engine.binary.as_os_str().is_empty() {
            return Err(ConfigError::Validation("engine.binary must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            gc_grace: Duration::from_secs(self.reconcile.gc_grace_seconds),
            window_recheck: Duration::from_secs(self.reconcile.window_recheck_seconds),
            default_timeout: self.reconcile.timeout(),
            ignore: self.archive.ignore.clone(),
        }
    }

    pub fn process_engine(&self) -> ProcessEngineConfig {
        ProcessEngineConfig {
            binary: self.engine.binary.clone(),
            global_args: self.engine.args.clone(),
            termination_grace: Duration::from_secs(self.engine.termination_grace_seconds),
        }
    }

    pub fn open_storage(&self) -> Result<Storage, StoreError> {
        Ok(Storage::new(&self.storage.path, self.storage.hostname.clone())?
            .with_lock_timeout(Duration::from_secs(self.storage.lock_timeout_seconds)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let effective = EffectiveConfig::build(None, None).unwrap();
        assert_eq!(effective.config, ControllerConfig::default());
        assert_eq!(effective.sources.len(), 1);
        assert_eq!(effective.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[storage]\nhostname = \"artifacts.internal\"\n\n[reconcile]\nmax_concurrent = 8\n\n[archive]\nignore = [\"*.md\"]"
        )
        .unwrap();

        let cli = serde_json::json!({"reconcile": {"max_concurrent": 2}});
        let effective = EffectiveConfig::build(Some(file.path()), Some(cli)).unwrap();

        assert_eq!(effective.config.storage.hostname, "artifacts.internal");
        assert_eq!(effective.config.storage.lock_timeout_seconds, 30);
        assert_eq!(effective.config.reconcile.max_concurrent, 2);
        assert_eq!(effective.config.archive.ignore, vec!["*.md".to_string()]);

        let origins: Vec<_> = effective.sources.iter().map(|s| s.origin).collect();
        assert_eq!(origins, vec![ConfigOrigin::Builtin, ConfigOrigin::File, ConfigOrigin::Cli]);
        assert_eq!(effective.sources[1].digest.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\nbase = \"/tmp\"").unwrap();

        let err = EffectiveConfig::build(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = EffectiveConfig::build(Some(Path::new("/nonexistent/driftgate.toml")), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validation_bounds() {
        let cli = serde_json::json!({"reconcile": {"max_concurrent": 0}});
        let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("reconcile.max_concurrent"));

        let cli = serde_json::json!({"engine": {"termination_grace_seconds": 301}});
        assert!(EffectiveConfig::build(None, Some(cli)).is_err());

        let cli = serde_json::json!({"storage": {"hostname": " "}});
        assert!(EffectiveConfig::build(None, Some(cli)).is_err());
    }

    #[test]
    fn test_gc_grace_must_be_positive() {
        let mut config = ControllerConfig::default();
        config.reconcile.gc_grace_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconcile.gc_grace_seconds"));

        let cli = serde_json::json!({"reconcile": {"gc_grace_seconds": 0}});
        assert!(matches!(
            EffectiveConfig::build(None, Some(cli)),
            Err(ConfigError::Validation(_))
        ));

        config.reconcile.gc_grace_seconds = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_settings() {
        let mut config = ControllerConfig::default();
        config.reconcile.timeout_seconds = 0;
        config.archive.ignore = vec!["*.tmp".to_string()];

        let settings = config.pipeline_settings();
        assert_eq!(settings.default_timeout, None);
        assert_eq!(settings.gc_grace, Duration::from_secs(300));
        assert_eq!(settings.ignore, vec!["*.tmp".to_string()]);
    }
}
