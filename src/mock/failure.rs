//! Failure injection for the fake engine.

use std::collections::HashMap;
use std::time::Duration;

use crate::engine::CommandResult;

/// Engine operation a failure can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Archive,
    Deploy,
    Prune,
    Validate,
    Delete,
}

/// Failure configuration for an operation
#[derive(Debug, Clone, Default)]
pub struct FailureConfig {
    /// Invocation error (the engine could not run at all)
    pub error_message: Option<String>,
    /// Result with per-resource errors returned instead of the normal one
    pub result: Option<CommandResult>,
    /// Delay before responding; the context is honoured while waiting
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    /// Fail the invocation itself.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Return an engine-reported result, typically one carrying errors.
    pub fn result(result: CommandResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn delay(duration: Duration) -> Self {
        Self {
            delay: Some(duration),
            ..Default::default()
        }
    }

    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<EngineOp, FailureConfig>,
    call_counts: HashMap<EngineOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, op: EngineOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    pub fn inject_error(&mut self, op: EngineOp, message: impl Into<String>) {
        self.inject(op, FailureConfig::error(message));
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    pub fn clear_op(&mut self, op: EngineOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Returns the failure config if one should apply to this call.
    pub fn check(&mut self, op: EngineOp) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?;
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }
        Some(config.clone())
    }
}
