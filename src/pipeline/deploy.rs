//! Deploy stage: apply, prune and validate the materialized project,
//! gated by the object's timing windows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use driftgate_window::matches;

use super::error::reason;
use super::{ReconcileResult, ReconcileState, Services, Stage, StageError};
use crate::cancel::Context;
use crate::engine::{CommandResult, DeployRequest, EngineError};
use crate::object::{DeploymentSpec, OperationResult, Reconcilable};

pub struct DeployStage {
    services: Arc<Services>,
}

impl DeployStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

/// Whether `spec` allows acting at `now`. A missing spec always allows.
fn window_allows(now: DateTime<Utc>, field: &str, spec: Option<&str>) -> Result<bool, StageError> {
    match spec {
        None => Ok(true),
        Some(spec) => matches(now, spec)
            .map_err(|e| StageError::InvalidSpec(format!("timing.{field}: {e}"))),
    }
}

/// Run one engine operation and capture its outcome.
///
/// Invocation failures land in `error`; engine-reported resource errors
/// keep the full result so partial progress stays visible.
fn attempt(
    ctx: &Context,
    revision: &str,
    spec: &DeploymentSpec,
    op: impl FnOnce(&Context) -> Result<CommandResult, EngineError>,
) -> Result<OperationResult, StageError> {
    let attempted_at = Utc::now();
    let (result, error) = match op(ctx) {
        Ok(result) => {
            let error = (!result.is_success()).then(|| result.error_detail());
            (Some(result), error)
        }
        Err(EngineError::Aborted(e)) => return Err(StageError::Cancelled(e)),
        Err(e) => (None, Some(e.to_string())),
    };
    Ok(OperationResult {
        attempted_at,
        revision: revision.to_string(),
        target_name: spec.target.clone(),
        objects_hash: result.as_ref().map(CommandResult::objects_hash),
        result,
        error,
    })
}

fn failure(reason: &'static str, what: &str, op: &OperationResult) -> StageError {
    let detail = op.error.as_deref().unwrap_or("unknown error");
    let summary = op
        .result
        .as_ref()
        .map(|r| format!(" ({})", r.summary()))
        .unwrap_or_default();
    StageError::Engine {
        reason,
        message: format!("{what} failed{summary}: {detail}"),
    }
}

impl<O: Reconcilable> Stage<O> for DeployStage {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn run(
        &self,
        ctx: &Context,
        object: &mut O,
        state: &mut ReconcileState,
    ) -> Result<ReconcileResult, StageError> {
        let (Some(info), Some(tree_dir)) = (state.archive_info.as_ref(), state.tree_dir()) else {
            return Ok(ReconcileResult::Success);
        };
        let revision = info.revision();
        let tree_dir = tree_dir.to_path_buf();
        let key = object.key();
        let spec = object.deployment_spec().clone();
        let timing = object.timing().cloned().unwrap_or_default();
        let now = Utc::now();

        if !window_allows(now, "deploy", timing.deploy.as_deref())? {
            info!(object = %key, "outside deploy window, deferring");
            state.pending = Some((
                reason::OUTSIDE_WINDOW,
                format!("revision {revision} waits for the deploy window"),
            ));
            return Ok(ReconcileResult::RequeueAfter(self.services.settings.window_recheck));
        }

        let request = DeployRequest::for_spec(&spec, tree_dir, state.credentials_dir.clone());
        let engine = &self.services.engine;

        let status = object.project_status();
        let needs_deploy = match &status.last_deploy_result {
            None => true,
            Some(last) => {
                last.revision != revision
                    || !last.succeeded()
                    || status.observed_generation != object.generation()
            }
        };

        if needs_deploy {
            let op = attempt(ctx, &revision, &spec, |ctx| engine.deploy(ctx, &request))?;
            let ok = op.succeeded();
            if let Some(result) = &op.result {
                info!(object = %key, %revision, summary = %result.summary(), "deploy finished");
            }
            let err = (!ok).then(|| failure(reason::DEPLOY_FAILED, "deploy", &op));
            object.project_status_mut().last_deploy_result = Some(op);
            if let Some(err) = err {
                return Err(err);
            }
        }

        if spec.prune && window_allows(now, "prune", timing.prune.as_deref())? {
            let op = attempt(ctx, &revision, &spec, |ctx| engine.prune(ctx, &request))?;
            let err = (!op.succeeded()).then(|| failure(reason::PRUNE_FAILED, "prune", &op));
            object.project_status_mut().last_prune_result = Some(op);
            if let Some(err) = err {
                return Err(err);
            }
        }

        if spec.validate {
            let op = attempt(ctx, &revision, &spec, |ctx| engine.validate(ctx, &request))?;
            let err = (!op.succeeded()).then(|| failure(reason::VALIDATE_FAILED, "validate", &op));
            object.project_status_mut().last_validate_result = Some(op);
            if let Some(err) = err {
                return Err(err);
            }
        }

        state.message = Some(format!("deployed revision {revision}"));
        Ok(ReconcileResult::Success)
    }
}
