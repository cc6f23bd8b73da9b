//! Publish stage: store the materialized tree as a content-addressed
//! artifact unless the stored one already has the same revision.

use std::sync::Arc;

use tracing::{debug, info, warn};

use driftgate_store::LATEST_ALIAS;

use super::error::reason;
use super::storage::collect_garbage;
use super::{ReconcileResult, ReconcileState, Services, Stage, StageError};
use crate::cancel::Context;
use crate::events::Event;
use crate::object::status::{self, ConditionStatus, ARTIFACT_IN_STORAGE};
use crate::object::Reconcilable;

pub struct PublishStage {
    services: Arc<Services>,
}

impl PublishStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

impl<O: Reconcilable> Stage<O> for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn run(
        &self,
        ctx: &Context,
        object: &mut O,
        state: &mut ReconcileState,
    ) -> Result<ReconcileResult, StageError> {
        let (Some(info), Some(tree_dir)) = (state.archive_info.clone(), state.tree_dir()) else {
            return Ok(ReconcileResult::Success);
        };
        let tree_dir = tree_dir.to_path_buf();
        let key = object.key();
        let generation = object.generation();
        let revision = info.revision();
        let storage = &self.services.storage;

        let current = object.project_status().artifact.clone();
        let unchanged = object.project_status().archive_revision().as_deref() == Some(revision.as_str());
        if let Some(current) = current.filter(|a| unchanged && storage.exists(a)) {
            debug!(object = %key, %revision, "artifact up to date");
            state.message = Some(format!("artifact up to date with revision {}", current.revision));
            return Ok(ReconcileResult::Success);
        }

        ctx.check()?;
        let mut artifact = storage
            .new_artifact(object.kind(), &key.namespace, &key.name, &revision)
            .map_err(|e| StageError::store(reason::STORAGE_OPERATION_FAILED, "invalid artifact", e))?;
        storage.mkdir_all(&artifact).map_err(|e| {
            StageError::store(reason::DIR_CREATION_FAILED, "failed to create artifact directory", e)
        })?;

        let filter = self.services.filter(&object.deployment_spec().ignore)?;
        {
            let _lock = storage
                .lock(&artifact)
                .map_err(|e| StageError::store(reason::LOCK_FAILED, "failed to lock artifact", e))?;
            storage
                .archive(&mut artifact, &tree_dir, Some(&filter))
                .map_err(|e| {
                    StageError::store(reason::ARCHIVE_OPERATION_FAILED, "failed to archive project", e)
                })?;
        }

        let message = format!("stored artifact for revision {revision}");
        let project = object.project_status_mut();
        project.artifact = Some(artifact.clone());
        project.archive_info = Some(info);
        status::set_condition(
            object.conditions_mut(),
            ARTIFACT_IN_STORAGE,
            ConditionStatus::True,
            reason::ARTIFACT_STORED,
            &message,
            generation,
        );

        match storage.symlink(&artifact, LATEST_ALIAS) {
            Ok(url) => debug!(object = %key, %url, "latest alias updated"),
            Err(e) => {
                warn!(object = %key, error = %e, "failed to update latest alias");
                self.services.emit(Event::warning(
                    key.clone(),
                    reason::SYMLINK_FAILED,
                    format!("failed to update {LATEST_ALIAS}: {e}"),
                ));
            }
        }

        info!(
            object = %key,
            %revision,
            checksum = artifact.checksum.as_deref().unwrap_or(""),
            size = artifact.size.unwrap_or(0),
            "artifact stored"
        );
        self.services.metrics.artifact_published(&key);
        collect_garbage(&self.services, ctx, &key, &artifact);

        state.message = Some(message);
        Ok(ReconcileResult::Success)
    }
}
