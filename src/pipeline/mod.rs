//! Staged reconciliation pipeline.
//!
//! A reconciliation runs an ordered list of [`Stage`]s:
//!
//! - `storage`: check the advertised artifact still exists, refresh its URL,
//!   collect old artifacts
//! - `archive`: fetch the source, have the engine materialize the project,
//!   compute [`crate::engine::ArchiveInfo`]
//! - `publish`: store a new artifact unless the revision is unchanged
//! - `deploy`: deploy, prune and validate inside the allowed windows
//!
//! Stage results are merged with [`fold_results`]; the first error or
//! immediate requeue stops the run. Objects carrying a deletion marker take
//! the delete path instead.

mod archive;
mod deploy;
mod error;
mod publish;
mod result;
mod stage;
mod storage;

pub use archive::ArchiveStage;
pub use deploy::DeployStage;
pub use error::{reason, PipelineError, StageError};
pub use publish::PublishStage;
pub use result::{fold_results, ReconcileResult};
pub use stage::{PipelineSettings, ReconcileState, Services, Stage};
pub use storage::StorageStage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use crate::cancel::Context;
use crate::engine::DeployRequest;
use crate::events::Event;
use crate::object::status::{self, ConditionStatus, READY, RECONCILING, STALLED};
use crate::object::{Reconcilable, FINALIZER};
use crate::source::materialize_credentials;

/// State captured before the stages run, for change detection.
struct Snapshot {
    checksum: Option<String>,
    failed: bool,
}

impl Snapshot {
    fn take<O: Reconcilable>(object: &O) -> Self {
        let ready = status::find_condition(object.conditions(), READY);
        Self {
            checksum: object
                .project_status()
                .artifact
                .as_ref()
                .and_then(|a| a.checksum.clone()),
            failed: ready.is_some_and(|c| c.status == ConditionStatus::False),
        }
    }
}

type StageOutcome = Result<ReconcileResult, (&'static str, StageError)>;

pub struct Reconciler<O: Reconcilable> {
    services: Arc<Services>,
    stages: Vec<Box<dyn Stage<O>>>,
}

impl<O: Reconcilable> Reconciler<O> {
    /// Reconciler with the standard stage list.
    pub fn new(services: Services) -> Self {
        let services = Arc::new(services);
        let stages: Vec<Box<dyn Stage<O>>> = vec![
            Box::new(StorageStage::new(Arc::clone(&services))),
            Box::new(ArchiveStage::new(Arc::clone(&services))),
            Box::new(PublishStage::new(Arc::clone(&services))),
            Box::new(DeployStage::new(Arc::clone(&services))),
        ];
        Self { services, stages }
    }

    pub fn with_stages(services: Arc<Services>, stages: Vec<Box<dyn Stage<O>>>) -> Self {
        Self { services, stages }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Reconcile one object, updating its status in place.
    pub fn reconcile(&self, ctx: &Context, object: &mut O) -> Result<ReconcileResult, PipelineError> {
        let key = object.key();
        let span = info_span!("reconcile", object = %key);
        let _enter = span.enter();
        let started = Instant::now();

        if object.is_deleting() {
            return self.reconcile_delete(ctx, object);
        }

        if object.is_suspended() {
            info!("reconciliation suspended, skipping");
            self.services.metrics.suspended(&key, true);
            return Ok(ReconcileResult::Success);
        }
        self.services.metrics.suspended(&key, false);
        object.add_finalizer(FINALIZER);

        let snapshot = Snapshot::take(object);
        let generation = object.generation();
        status::set_condition(
            object.conditions_mut(),
            RECONCILING,
            ConditionStatus::True,
            reason::PROGRESSING,
            "reconciliation in progress",
            generation,
        );

        // Zero disables the deadline, matching the controller setting.
        let timeout = match object.deployment_spec().timeout_seconds {
            Some(0) => None,
            Some(seconds) => Some(Duration::from_secs(seconds)),
            None => self.services.settings.default_timeout,
        };
        let ctx = match timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let (result, pending, message) = match ReconcileState::new() {
            Ok(mut state) => {
                let result = fold_results(self.stages.iter().map(|stage| -> StageOutcome {
                    ctx.check().map_err(|e| (stage.name(), StageError::from(e)))?;
                    debug!(stage = stage.name(), "running stage");
                    stage
                        .run(&ctx, &mut *object, &mut state)
                        .map_err(|e| (stage.name(), e))
                }));
                (result, state.pending.take(), state.message.take())
            }
            Err(e) => {
                let err = StageError::storage(
                    reason::DIR_CREATION_FAILED,
                    format!("failed to create work directory: {e}"),
                );
                (Err(("setup", err)), None, None)
            }
        };

        let outcome = self.summarize(object, result, pending, message);
        self.notify(object, &snapshot);

        let ready = object.project_status().is_ready();
        self.services
            .metrics
            .reconcile_finished(&key, ready, started.elapsed());
        outcome
    }

    /// Fold the stage outcome into status and pick the requeue.
    fn summarize(
        &self,
        object: &mut O,
        result: StageOutcome,
        pending: Option<(&'static str, String)>,
        message: Option<String>,
    ) -> Result<ReconcileResult, PipelineError> {
        let key = object.key();
        let generation = object.generation();
        let now = Utc::now();

        match result {
            Ok(result) if pending.is_some() || result == ReconcileResult::RequeueImmediate => {
                let (reason, message) = pending
                    .unwrap_or_else(|| (reason::PROGRESSING, "reconciliation requeued".to_string()));
                status::set_condition(
                    object.conditions_mut(),
                    READY,
                    ConditionStatus::Unknown,
                    reason,
                    &message,
                    generation,
                );
                Ok(result)
            }
            Ok(result) => {
                let message = message.unwrap_or_else(|| "reconciliation succeeded".to_string());
                let conditions = object.conditions_mut();
                status::set_condition(
                    conditions,
                    READY,
                    ConditionStatus::True,
                    reason::SUCCEEDED,
                    &message,
                    generation,
                );
                status::remove_condition(conditions, RECONCILING);
                status::remove_condition(conditions, STALLED);

                let project = object.project_status_mut();
                project.observed_generation = generation;
                project.last_success_at = Some(now);
                info!(%message, "reconciliation succeeded");

                Ok(ReconcileResult::RequeueAfter(
                    result.requeue_after().unwrap_or_else(|| object.interval()),
                ))
            }
            Err((stage, err)) => {
                let message = err.to_string();
                let reason = err.reason();
                let terminal = err.is_terminal();

                let conditions = object.conditions_mut();
                status::set_condition(conditions, READY, ConditionStatus::False, reason, &message, generation);
                status::remove_condition(conditions, RECONCILING);
                if terminal {
                    status::set_condition(conditions, STALLED, ConditionStatus::True, reason, &message, generation);
                } else {
                    status::remove_condition(conditions, STALLED);
                }

                let project = object.project_status_mut();
                project.last_failure_at = Some(now);
                if terminal {
                    project.observed_generation = generation;
                }

                warn!(stage, reason, error = %message, "reconciliation failed");
                self.services
                    .emit(Event::warning(key, reason, status::truncate_message(&message)));

                Err(PipelineError {
                    stage,
                    source: err,
                    retry_after: (!terminal).then(|| object.retry_interval()),
                })
            }
        }
    }

    /// Emit a notification when a ready object got new artifact content or
    /// just recovered from a failure.
    fn notify(&self, object: &O, snapshot: &Snapshot) {
        let project = object.project_status();
        if !project.is_ready() {
            return;
        }

        let artifact = project.artifact.as_ref();
        let checksum = artifact.and_then(|a| a.checksum.as_ref());
        let changed = checksum.is_some() && checksum != snapshot.checksum.as_ref();
        if !(changed || snapshot.failed) {
            return;
        }

        let message = status::find_condition(object.conditions(), READY)
            .map(|c| c.message.clone())
            .unwrap_or_default();
        let mut event = Event::normal(object.key(), reason::SUCCEEDED, message);
        if let Some(artifact) = artifact {
            event = event.with_revision(artifact.revision.clone());
        }
        self.services.emit(event);
    }

    /// Remove everything the object owns and release its finalizer.
    fn reconcile_delete(&self, ctx: &Context, object: &mut O) -> Result<ReconcileResult, PipelineError> {
        if !object.has_finalizer(FINALIZER) {
            return Ok(ReconcileResult::Success);
        }
        let retry_after = Some(object.retry_interval());
        let fail = |err: StageError| {
            warn!(reason = err.reason(), error = %err, "deletion failed");
            PipelineError {
                stage: "delete",
                source: err,
                retry_after,
            }
        };

        if object.deployment_spec().delete_on_removal {
            self.delete_deployed(ctx, object).map_err(fail)?;
        }

        let key = object.key();
        let storage = &self.services.storage;
        let owner = match object.project_status().artifact.clone() {
            Some(artifact) => artifact,
            None => storage
                .new_artifact(object.kind(), &key.namespace, &key.name, "")
                .map_err(|e| fail(StageError::store(reason::STORAGE_OPERATION_FAILED, "invalid artifact", e)))?,
        };
        let removed = storage.remove_all(&owner).map_err(|e| {
            fail(StageError::store(
                reason::STORAGE_OPERATION_FAILED,
                "failed to remove artifacts",
                e,
            ))
        })?;
        if !removed.is_empty() {
            self.services.metrics.artifacts_collected(&key, removed.len());
            self.services.emit(Event::normal(
                key.clone(),
                reason::GC_SUCCEEDED,
                format!("removed {} artifacts", removed.len()),
            ));
        }

        object.project_status_mut().artifact = None;
        status::remove_condition(object.conditions_mut(), status::ARTIFACT_IN_STORAGE);
        object.remove_finalizer(FINALIZER);
        info!(removed = removed.len(), "object deleted, finalizer removed");
        Ok(ReconcileResult::Success)
    }

    /// Ask the engine to delete what the last stored artifact deployed.
    fn delete_deployed(&self, ctx: &Context, object: &O) -> Result<(), StageError> {
        let storage = &self.services.storage;
        let Some(artifact) = object
            .project_status()
            .artifact
            .clone()
            .filter(|a| storage.exists(a))
        else {
            warn!("no stored artifact, skipping engine delete");
            return Ok(());
        };

        let state = ReconcileState::new().map_err(|e| {
            StageError::storage(
                reason::DIR_CREATION_FAILED,
                format!("failed to create work directory: {e}"),
            )
        })?;
        let tree_dir = state.work_dir().join("tree");
        storage.unpack(&artifact, &tree_dir).map_err(|e| {
            StageError::store(reason::STORAGE_OPERATION_FAILED, "failed to unpack artifact", e)
        })?;

        let spec = object.deployment_spec();
        let credentials_dir = materialize_credentials(
            self.services.credentials.as_ref(),
            &spec.credentials,
            &state.work_dir().join("credentials"),
        )?;
        let request = DeployRequest::for_spec(spec, tree_dir, credentials_dir);
        let result = self.services.engine.delete(ctx, &request).map_err(|e| {
            StageError::engine(reason::DELETE_FAILED, "failed to delete deployed objects", e)
        })?;
        if !result.is_success() {
            return Err(StageError::Engine {
                reason: reason::DELETE_FAILED,
                message: format!("delete failed ({}): {}", result.summary(), result.error_detail()),
            });
        }
        info!(summary = %result.summary(), "deployed objects deleted");
        Ok(())
    }
}
