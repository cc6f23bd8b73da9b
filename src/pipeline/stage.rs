//! The stage interface and the state shared between stages.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use driftgate_store::{ArchiveFilter, Storage};

use super::{ReconcileResult, StageError};
use crate::cancel::Context;
use crate::engine::{ArchiveInfo, ArchiveOutput, Engine};
use crate::events::{Event, EventRecorder};
use crate::metrics::MetricsSink;
use crate::object::Reconcilable;
use crate::source::{CredentialsProvider, SourceProvider, SourceRevision};

/// One step of a reconciliation.
pub trait Stage<O: Reconcilable>: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        ctx: &Context,
        object: &mut O,
        state: &mut ReconcileState,
    ) -> Result<ReconcileResult, StageError>;
}

/// Tunables the stages read.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Artifacts younger than this survive garbage collection.
    pub gc_grace: Duration,
    /// Requeue delay while outside a deploy window.
    pub window_recheck: Duration,
    /// Whole-reconciliation timeout when the object sets none.
    pub default_timeout: Option<Duration>,
    /// Exclusions applied to every artifact on top of per-object ones.
    pub ignore: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            gc_grace: Duration::from_secs(300),
            window_recheck: Duration::from_secs(60),
            default_timeout: Some(Duration::from_secs(600)),
            ignore: Vec::new(),
        }
    }
}

/// Collaborators shared by every stage.
pub struct Services {
    pub storage: Storage,
    pub engine: Arc<dyn Engine>,
    pub sources: Arc<dyn SourceProvider>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub events: Arc<dyn EventRecorder>,
    pub metrics: Arc<dyn MetricsSink>,
    pub settings: PipelineSettings,
}

impl Services {
    pub fn emit(&self, event: Event) {
        self.events.record(event);
    }

    /// Archive filter for an object's ignore patterns.
    pub fn filter(&self, extra: &[String]) -> Result<ArchiveFilter, StageError> {
        let patterns: Vec<&String> = self.settings.ignore.iter().chain(extra).collect();
        ArchiveFilter::with_patterns(&patterns)
            .map_err(|e| StageError::InvalidSpec(format!("invalid ignore pattern: {e}")))
    }
}

/// Scratch state of one reconciliation.
///
/// Owns a temp directory that holds fetched sources, materialized trees and
/// credential material; it is deleted when the state is dropped.
pub struct ReconcileState {
    work_dir: TempDir,
    pub credentials_dir: Option<PathBuf>,
    pub source: Option<SourceRevision>,
    pub archive: Option<ArchiveOutput>,
    pub archive_info: Option<ArchiveInfo>,
    /// Reason and message when the reconciliation waits on something
    /// external.
    pub pending: Option<(&'static str, String)>,
    /// Human summary for the Ready condition.
    pub message: Option<String>,
}

impl ReconcileState {
    pub fn new() -> io::Result<Self> {
        let work_dir = tempfile::Builder::new().prefix("driftgate-").tempdir()?;
        Ok(Self {
            work_dir,
            credentials_dir: None,
            source: None,
            archive: None,
            archive_info: None,
            pending: None,
            message: None,
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn tree_dir(&self) -> Option<&Path> {
        self.archive.as_ref().map(|a| a.tree_dir.as_path())
    }
}
