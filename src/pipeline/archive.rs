//! Archive stage: fetch the source and have the engine materialize the
//! project, then compute its [`ArchiveInfo`].

use std::sync::Arc;

use tracing::{debug, info};

use driftgate_window::TimeSpec;

use super::error::reason;
use super::{ReconcileResult, ReconcileState, Services, Stage, StageError};
use crate::cancel::Context;
use crate::engine::{ArchiveInfo, ArchiveRequest};
use crate::object::status::{self, ConditionStatus, RECONCILING};
use crate::object::Reconcilable;
use crate::source::materialize_credentials;

pub struct ArchiveStage {
    services: Arc<Services>,
}

impl ArchiveStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

/// Reject malformed timing windows before anything is touched.
fn validate_timing<O: Reconcilable>(object: &O) -> Result<(), StageError> {
    let Some(timing) = object.timing() else {
        return Ok(());
    };
    for (field, spec) in [("deploy", &timing.deploy), ("prune", &timing.prune)] {
        if let Some(spec) = spec {
            spec.parse::<TimeSpec>()
                .map_err(|e| StageError::InvalidSpec(format!("timing.{field}: {e}")))?;
        }
    }
    Ok(())
}

impl<O: Reconcilable> Stage<O> for ArchiveStage {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn run(
        &self,
        ctx: &Context,
        object: &mut O,
        state: &mut ReconcileState,
    ) -> Result<ReconcileResult, StageError> {
        validate_timing(object)?;
        let key = object.key();
        let spec = object.deployment_spec().clone();
        let filter = self.services.filter(&spec.ignore)?;

        state.credentials_dir = materialize_credentials(
            self.services.credentials.as_ref(),
            &spec.credentials,
            &state.work_dir().join("credentials"),
        )?;

        let source_dir = state.work_dir().join("source");
        let Some(source) = self
            .services
            .sources
            .fetch(ctx, &spec.source, &key.namespace, &source_dir)?
        else {
            let message = format!(
                "source {} has no revision available yet",
                spec.source.resolve(&key.namespace)
            );
            info!(object = %key, "{message}");
            let generation = object.generation();
            status::set_condition(
                object.conditions_mut(),
                RECONCILING,
                ConditionStatus::True,
                reason::SOURCE_NOT_READY,
                &message,
                generation,
            );
            state.pending = Some((reason::SOURCE_NOT_READY, message));
            return Ok(ReconcileResult::RequeueAfter(object.retry_interval()));
        };
        debug!(object = %key, revision = %source.revision, "source fetched");

        let output = self
            .services
            .engine
            .archive(
                ctx,
                &ArchiveRequest {
                    source_dir: source.dir.clone(),
                    project_path: spec.path.clone(),
                    output_dir: state.work_dir().join("archive"),
                    credentials_dir: state.credentials_dir.clone(),
                },
            )
            .map_err(|e| {
                StageError::engine(reason::ARCHIVE_FAILED, "failed to materialize project", e)
            })?;

        let info = ArchiveInfo::compute(
            &output.tree_dir,
            Some(&filter),
            output.involved_repos.clone(),
            output.targets.clone(),
        )
        .map_err(|e| StageError::store(reason::HASH_FAILED, "failed to hash project tree", e))?;

        object.project_status_mut().last_attempted_revision = Some(source.revision.clone());
        state.source = Some(source);
        state.archive = Some(output);
        state.archive_info = Some(info);
        Ok(ReconcileResult::Success)
    }
}
