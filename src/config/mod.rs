//! Controller configuration
//!
//! Three layers, merged in order:
//! 1. Built-in defaults
//! 2. Optional TOML file (`-c driftgate.toml`)
//! 3. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{ArchiveConfig, ControllerConfig, EngineConfig, ReconcileConfig, StorageConfig};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers};
