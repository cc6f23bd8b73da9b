//! In-memory engine.
//!
//! `archive` copies the project directory into the output tree and overlays
//! any files configured with [`FakeEngine::set_file`]. The other operations
//! return configured [`CommandResult`]s. Every call is recorded.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::failure::{EngineOp, FailureConfig, FailureInjector};
use crate::cancel::Context;
use crate::engine::{
    ArchiveOutput, ArchiveRequest, CommandResult, DeployRequest, Engine, EngineError,
    InvolvedRepo, TargetInfo,
};
use crate::source::copy_tree;

/// A recorded engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub op: EngineOp,
    pub project_dir: PathBuf,
    pub target: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    files: BTreeMap<String, Vec<u8>>,
    involved_repos: Vec<InvolvedRepo>,
    targets: Vec<TargetInfo>,
    results: HashMap<EngineOp, CommandResult>,
    calls: Vec<EngineCall>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    failures: Arc<Mutex<FailureInjector>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // === Test configuration ===

    /// Add or replace a file in every materialized tree.
    pub fn set_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), contents.into());
    }

    pub fn set_targets(&self, targets: Vec<TargetInfo>) {
        self.state.lock().unwrap().targets = targets;
    }

    pub fn set_involved_repos(&self, repos: Vec<InvolvedRepo>) {
        self.state.lock().unwrap().involved_repos = repos;
    }

    /// Result returned by `op` when no failure is injected.
    pub fn set_result(&self, op: EngineOp, result: CommandResult) {
        self.state.lock().unwrap().results.insert(op, result);
    }

    pub fn inject_error(&self, op: EngineOp, message: &str) {
        self.failures.lock().unwrap().inject_error(op, message);
    }

    pub fn inject_failure(&self, op: EngineOp, config: FailureConfig) {
        self.failures.lock().unwrap().inject(op, config);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    // === Assertions ===

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: EngineOp) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    // === Internals ===

    fn record(&self, op: EngineOp, project_dir: &Path, target: Option<&str>, dry_run: bool) {
        self.state.lock().unwrap().calls.push(EngineCall {
            op,
            project_dir: project_dir.to_path_buf(),
            target: target.map(str::to_string),
            dry_run,
        });
    }

    /// Apply an injected failure, if any. `Ok(Some(result))` replaces the
    /// normal result.
    fn check_failure(
        &self,
        ctx: &Context,
        op: EngineOp,
    ) -> Result<Option<CommandResult>, EngineError> {
        let failure = self.failures.lock().unwrap().check(op);
        let Some(failure) = failure else {
            return Ok(None);
        };

        if let Some(delay) = failure.delay {
            wait(ctx, delay)?;
        }
        if let Some(message) = failure.error_message {
            return Err(EngineError::Exit {
                code: Some(1),
                stderr: message,
            });
        }
        Ok(failure.result)
    }

    fn run(&self, ctx: &Context, op: EngineOp, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        ctx.check()?;
        self.record(op, &request.project_dir, request.target.as_deref(), request.dry_run);
        if let Some(result) = self.check_failure(ctx, op)? {
            return Ok(result);
        }
        let state = self.state.lock().unwrap();
        Ok(state.results.get(&op).cloned().unwrap_or_default())
    }
}

fn wait(ctx: &Context, delay: Duration) -> Result<(), EngineError> {
    let start = Instant::now();
    while start.elapsed() < delay {
        ctx.check()?;
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

impl Engine for FakeEngine {
    fn archive(&self, ctx: &Context, request: &ArchiveRequest) -> Result<ArchiveOutput, EngineError> {
        ctx.check()?;
        let project_dir = match &request.project_path {
            Some(path) => request.source_dir.join(path),
            None => request.source_dir.clone(),
        };
        self.record(EngineOp::Archive, &project_dir, None, false);
        self.check_failure(ctx, EngineOp::Archive)?;

        if !project_dir.is_dir() {
            return Err(EngineError::Project(format!(
                "project directory {} does not exist",
                project_dir.display()
            )));
        }

        let tree_dir = request.output_dir.join("tree");
        fs::create_dir_all(&tree_dir)?;
        copy_tree(&project_dir, &tree_dir)?;

        let state = self.state.lock().unwrap();
        for (path, contents) in &state.files {
            let dest = tree_dir.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, contents)?;
        }

        Ok(ArchiveOutput {
            tree_dir,
            involved_repos: state.involved_repos.clone(),
            targets: state.targets.clone(),
        })
    }

    fn deploy(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run(ctx, EngineOp::Deploy, request)
    }

    fn prune(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run(ctx, EngineOp::Prune, request)
    }

    fn validate(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run(ctx, EngineOp::Validate, request)
    }

    fn delete(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run(ctx, EngineOp::Delete, request)
    }
}
