//! Engine implementation that shells out to the engine binary.
//!
//! Every invocation runs `<binary> <command> --project-dir <dir> ...` with
//! JSON output on stdout. The child is polled against the reconciliation
//! context and terminated (SIGTERM, grace period, SIGKILL) once the context
//! is cancelled or its deadline passes. On unix the child leads its own
//! process group and the signals go to the whole group.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    ArchiveOutput, ArchiveRequest, CommandResult, DeployRequest, Engine, EngineError,
    InvolvedRepo, TargetInfo,
};
use crate::cancel::Context;

/// Environment variable pointing the engine at the credentials directory.
pub const CREDENTIALS_DIR_ENV: &str = "DRIFTGATE_CREDENTIALS_DIR";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum stderr bytes kept for error messages.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub binary: PathBuf,
    /// Extra arguments placed before the subcommand.
    pub global_args: Vec<String>,
    pub termination_grace: Duration,
}

impl Default for ProcessEngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kluctl"),
            global_args: Vec::new(),
            termination_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: ProcessEngineConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveMetadataFile {
    #[serde(default)]
    involved_repos: Vec<InvolvedRepo>,
    #[serde(default)]
    targets: Vec<TargetInfo>,
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }

    /// Arguments shared by deploy, prune, validate and delete.
    pub fn deploy_args(command: &str, request: &DeployRequest) -> Vec<String> {
        let mut args = vec![
            command.to_string(),
            "--project-dir".to_string(),
            request.project_dir.display().to_string(),
        ];
        if let Some(target) = &request.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        if request.dry_run {
            args.push("--dry-run".to_string());
        }
        for (key, value) in &request.args {
            args.push("--arg".to_string());
            args.push(format!("{key}={value}"));
        }
        for image in &request.images {
            args.push("--fixed-image".to_string());
            args.push(format!("{}={}", image.image, image.result_image));
        }
        for tag in &request.include_tags {
            args.push("--include-tag".to_string());
            args.push(tag.clone());
        }
        for tag in &request.exclude_tags {
            args.push("--exclude-tag".to_string());
            args.push(tag.clone());
        }
        args.push("--yes".to_string());
        args.push("--output-format".to_string());
        args.push("json".to_string());
        args
    }

    fn run(
        &self,
        ctx: &Context,
        args: &[String],
        credentials_dir: Option<&Path>,
    ) -> Result<ProcessOutput, EngineError> {
        ctx.check()?;

        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = credentials_dir {
            command.env(CREDENTIALS_DIR_ENV, dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!(binary = %self.config.binary.display(), ?args, "starting engine");
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {e}", self.config.binary.display())))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_handle = thread::spawn(move || drain(stdout));
        let stderr_handle = thread::spawn(move || drain(stderr));

        let status = loop {
            if let Err(reason) = ctx.check() {
                warn!(%reason, "aborting engine invocation");
                self.terminate(&mut child)?;
                // Detach the drains; a descendant may still hold the pipes.
                drop((stdout_handle, stderr_handle));
                return Err(EngineError::Aborted(reason));
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        })
    }

    fn terminate(&self, child: &mut Child) -> Result<(), EngineError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let _ = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < self.config.termination_grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let _ = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
        }
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }

    /// Run a command whose stdout is a JSON [`CommandResult`].
    ///
    /// A non-zero exit with a parseable result is still returned as a result
    /// so per-resource errors survive; anything else becomes an error.
    fn run_command(
        &self,
        ctx: &Context,
        command: &str,
        request: &DeployRequest,
    ) -> Result<CommandResult, EngineError> {
        let args = Self::deploy_args(command, request);
        let output = self.run(ctx, &args, request.credentials_dir.as_deref())?;

        match serde_json::from_slice::<CommandResult>(&output.stdout) {
            Ok(result) => {
                if !output.status.success() && result.is_success() {
                    return Err(exit_error(&output));
                }
                Ok(result)
            }
            Err(e) if output.status.success() => Err(EngineError::Output(e.to_string())),
            Err(_) => Err(exit_error(&output)),
        }
    }
}

fn drain<R: Read>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf);
    }
    buf
}

fn exit_error(output: &ProcessOutput) -> EngineError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    let tail_start = (tail_start..stderr.len())
        .find(|i| stderr.is_char_boundary(*i))
        .unwrap_or(stderr.len());
    EngineError::Exit {
        code: output.status.code(),
        stderr: stderr[tail_start..].trim().to_string(),
    }
}

impl Engine for ProcessEngine {
    fn archive(&self, ctx: &Context, request: &ArchiveRequest) -> Result<ArchiveOutput, EngineError> {
        let project_dir = match &request.project_path {
            Some(path) => request.source_dir.join(path),
            None => request.source_dir.clone(),
        };
        if !project_dir.is_dir() {
            return Err(EngineError::Project(format!(
                "project directory {} does not exist",
                project_dir.display()
            )));
        }

        let tree_dir = request.output_dir.join("tree");
        let metadata_path = request.output_dir.join("metadata.json");
        fs::create_dir_all(&tree_dir)?;

        let args = vec![
            "archive".to_string(),
            "--project-dir".to_string(),
            project_dir.display().to_string(),
            "--output-archive-dir".to_string(),
            tree_dir.display().to_string(),
            "--output-metadata".to_string(),
            metadata_path.display().to_string(),
        ];
        let output = self.run(ctx, &args, request.credentials_dir.as_deref())?;
        if !output.status.success() {
            return Err(exit_error(&output));
        }

        let metadata = fs::read(&metadata_path)?;
        let metadata: ArchiveMetadataFile = serde_json::from_slice(&metadata)
            .map_err(|e| EngineError::Output(format!("{}: {e}", metadata_path.display())))?;

        Ok(ArchiveOutput {
            tree_dir,
            involved_repos: metadata.involved_repos,
            targets: metadata.targets,
        })
    }

    fn deploy(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run_command(ctx, "deploy", request)
    }

    fn prune(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run_command(ctx, "prune", request)
    }

    fn validate(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run_command(ctx, "validate", request)
    }

    fn delete(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError> {
        self.run_command(ctx, "delete", request)
    }
}
