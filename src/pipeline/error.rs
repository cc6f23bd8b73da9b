//! Stage and pipeline errors.

use std::time::Duration;

use thiserror::Error;

use driftgate_store::StoreError;

use crate::cancel::ContextError;
use crate::engine::EngineError;
use crate::source::SourceError;

/// Machine-readable reasons used in conditions and events.
pub mod reason {
    pub const SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const PROGRESSING: &str = "Progressing";
    pub const CANCELLED: &str = "ReconciliationCancelled";

    pub const INVALID_SPEC: &str = "InvalidSpec";

    pub const SOURCE_NOT_READY: &str = "SourceNotReady";
    pub const SOURCE_FETCH_FAILED: &str = "SourceFetchFailed";

    pub const DIR_CREATION_FAILED: &str = "DirectoryCreationFailed";
    pub const HASH_FAILED: &str = "HashOperationFailed";
    pub const LOCK_FAILED: &str = "AcquireLockFailed";
    pub const ARCHIVE_OPERATION_FAILED: &str = "ArchiveOperationFailed";
    pub const STORAGE_OPERATION_FAILED: &str = "StorageOperationFailed";
    pub const SYMLINK_FAILED: &str = "SymlinkUpdateFailed";
    pub const GC_SUCCEEDED: &str = "GarbageCollectionSucceeded";
    pub const GC_FAILED: &str = "GarbageCollectionFailed";

    pub const ARTIFACT_STORED: &str = "Succeeded";
    pub const ARTIFACT_MISSING: &str = "NoArtifact";

    pub const ARCHIVE_FAILED: &str = "ArchiveFailed";
    pub const DEPLOY_FAILED: &str = "DeployFailed";
    pub const PRUNE_FAILED: &str = "PruneFailed";
    pub const VALIDATE_FAILED: &str = "ValidateFailed";
    pub const DELETE_FAILED: &str = "DeleteFailed";
    pub const OUTSIDE_WINDOW: &str = "OutsideWindow";
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
}

/// Failure of a single stage.
///
/// Storage and engine failures are kept apart so consumers can tell an
/// unhealthy store from a source that could not be materialized.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{message}")]
    Storage {
        reason: &'static str,
        message: String,
    },

    #[error("{message}")]
    Engine {
        reason: &'static str,
        message: String,
    },

    #[error("failed to fetch source: {0}")]
    Source(#[source] SourceError),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("reconciliation aborted: {0}")]
    Cancelled(#[from] ContextError),
}

impl StageError {
    pub fn storage(reason: &'static str, err: impl std::fmt::Display) -> Self {
        StageError::Storage {
            reason,
            message: err.to_string(),
        }
    }

    pub fn store(reason: &'static str, context: &str, err: StoreError) -> Self {
        StageError::Storage {
            reason,
            message: format!("{context}: {err}"),
        }
    }

    /// Map an engine failure, keeping cancellation distinct.
    pub fn engine(reason: &'static str, context: &str, err: EngineError) -> Self {
        match err {
            EngineError::Aborted(e) => StageError::Cancelled(e),
            other => StageError::Engine {
                reason,
                message: format!("{context}: {other}"),
            },
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StageError::Storage { reason, .. } | StageError::Engine { reason, .. } => reason,
            StageError::Source(_) => reason::SOURCE_FETCH_FAILED,
            StageError::InvalidSpec(_) => reason::INVALID_SPEC,
            StageError::Cancelled(_) => reason::CANCELLED,
        }
    }

    /// Config errors are not retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageError::InvalidSpec(_))
    }
}

impl From<SourceError> for StageError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Aborted(e) => StageError::Cancelled(e),
            e if e.is_config_error() => StageError::InvalidSpec(e.to_string()),
            e => StageError::Source(e),
        }
    }
}

/// Failed reconciliation as reported to the caller.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: &'static str,
    #[source]
    pub source: StageError,
    /// When to retry; `None` for terminal errors.
    pub retry_after: Option<Duration>,
}

impl PipelineError {
    pub fn is_terminal(&self) -> bool {
        self.retry_after.is_none()
    }

    pub fn reason(&self) -> &'static str {
        self.source.reason()
    }
}
