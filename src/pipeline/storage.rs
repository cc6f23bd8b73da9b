//! Storage stage: reconcile the advertised artifact with the store.

use std::sync::Arc;

use tracing::{debug, warn};

use driftgate_store::Artifact;

use super::error::reason;
use super::{ReconcileResult, ReconcileState, Services, Stage, StageError};
use crate::cancel::Context;
use crate::events::Event;
use crate::object::status::{self, ConditionStatus, ARTIFACT_IN_STORAGE};
use crate::object::{ObjectKey, Reconcilable};

pub struct StorageStage {
    services: Arc<Services>,
}

impl StorageStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

impl<O: Reconcilable> Stage<O> for StorageStage {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn run(
        &self,
        ctx: &Context,
        object: &mut O,
        _state: &mut ReconcileState,
    ) -> Result<ReconcileResult, StageError> {
        let generation = object.generation();
        let Some(mut artifact) = object.project_status().artifact.clone() else {
            status::remove_condition(object.conditions_mut(), ARTIFACT_IN_STORAGE);
            return Ok(ReconcileResult::Success);
        };

        if !self.services.storage.exists(&artifact) {
            warn!(object = %object.key(), path = %artifact.path, "advertised artifact missing from storage");
            let message = format!("artifact for revision {} is missing from storage", artifact.revision);
            let project = object.project_status_mut();
            project.artifact = None;
            project.archive_info = None;
            status::set_condition(
                object.conditions_mut(),
                ARTIFACT_IN_STORAGE,
                ConditionStatus::False,
                reason::ARTIFACT_MISSING,
                &message,
                generation,
            );
            return Ok(ReconcileResult::Success);
        }

        let url = artifact.url.clone();
        self.services.storage.set_artifact_url(&mut artifact);
        if artifact.url != url {
            debug!(object = %object.key(), url = %artifact.url, "advertised URL refreshed");
        }

        collect_garbage(&self.services, ctx, &object.key(), &artifact);

        let message = format!("stored artifact for revision {}", artifact.revision);
        object.project_status_mut().artifact = Some(artifact);
        status::set_condition(
            object.conditions_mut(),
            ARTIFACT_IN_STORAGE,
            ConditionStatus::True,
            reason::ARTIFACT_STORED,
            &message,
            generation,
        );
        Ok(ReconcileResult::Success)
    }
}

/// Collect old artifacts of the owner. Failures only produce a warning
/// event; they never fail the reconciliation.
pub(super) fn collect_garbage(services: &Services, ctx: &Context, key: &ObjectKey, current: &Artifact) {
    let grace = services.settings.gc_grace;
    match services
        .storage
        .garbage_collect(current, grace, &|| ctx.is_done())
    {
        Ok(deleted) if deleted.is_empty() => {}
        Ok(deleted) => {
            services.metrics.artifacts_collected(key, deleted.len());
            services.emit(Event::normal(
                key.clone(),
                reason::GC_SUCCEEDED,
                format!("garbage collected {} artifacts", deleted.len()),
            ));
        }
        Err(e) => {
            warn!(object = %key, error = %e, "garbage collection failed");
            services.emit(Event::warning(
                key.clone(),
                reason::GC_FAILED,
                format!("garbage collection failed: {e}"),
            ));
        }
    }
}
