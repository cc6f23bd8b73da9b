//! driftgate CLI
//!
//! Entry point for the `driftgate` command-line tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use driftgate::config::EffectiveConfig;
use driftgate::events::LogRecorder;
use driftgate::metrics::NoopMetrics;
use driftgate::object::{DeploymentStatus, DEFAULT_SOURCE_KIND};
use driftgate::source::{LocalSource, StaticCredentials};
use driftgate::{
    affected_dependents, Context, Controller, Deployment, ObjectKey, ProcessEngine, Reconcilable,
    Reconciler, Services, SourceKey,
};

/// Exit code for invalid input or configuration.
const EXIT_USAGE: i32 = 2;

/// Exit code when interrupted.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "driftgate")]
#[command(about = "Reconcile declared deployments against their source", version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile deployments once and write their status next to each manifest
    Reconcile {
        /// Controller config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Override reconcile.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Override storage.path
        #[arg(long)]
        storage_path: Option<PathBuf>,

        /// Deployment manifests (TOML)
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },

    /// Check whether a time-window spec allows acting now
    Window {
        /// Window spec, e.g. "Mon-Fri 09:00-17:00 Europe/Berlin"
        spec: String,

        /// Evaluate at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<String>,
    },

    /// List deployments to requeue after a source revision change
    Dependents {
        /// Source that changed, as namespace/name
        #[arg(long)]
        source: String,

        /// Kind of the source that changed
        #[arg(long, default_value = DEFAULT_SOURCE_KIND)]
        kind: String,

        /// New revision of the source
        #[arg(long)]
        revision: String,

        /// Deployment manifests (TOML)
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
}

/// Persisted state of one manifest between runs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StatusFile {
    #[serde(default)]
    finalizers: Vec<String>,
    #[serde(default)]
    status: DeploymentStatus,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Commands::Reconcile {
            config,
            max_concurrent,
            storage_path,
            manifests,
        } => run_reconcile(config, max_concurrent, storage_path, &manifests),
        Commands::Window { spec, at } => run_window(&spec, at.as_deref()),
        Commands::Dependents {
            source,
            kind,
            revision,
            manifests,
        } => run_dependents(&source, &kind, &revision, &manifests),
    };
    process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn status_path(manifest: &Path) -> PathBuf {
    manifest.with_extension("status.json")
}

/// Load a manifest together with the status persisted by the last run.
fn load_deployment(manifest: &Path) -> Result<Deployment, String> {
    let mut deployment = Deployment::from_toml_file(manifest).map_err(|e| e.to_string())?;
    let path = status_path(manifest);
    if path.exists() {
        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let saved: StatusFile = serde_json::from_str(&contents)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        deployment.metadata.finalizers = saved.finalizers;
        deployment.status = saved.status;
    }
    Ok(deployment)
}

fn save_status(manifest: &Path, deployment: &Deployment) -> Result<(), String> {
    let path = status_path(manifest);
    let saved = StatusFile {
        finalizers: deployment.metadata.finalizers.clone(),
        status: deployment.status.clone(),
    };
    let json = serde_json::to_string_pretty(&saved).map_err(|e| e.to_string())?;
    fs::write(&path, json).map_err(|e| format!("failed to write {}: {e}", path.display()))
}

fn load_all(manifests: &[PathBuf]) -> Result<Vec<Deployment>, String> {
    manifests.iter().map(|m| load_deployment(m)).collect()
}

fn run_reconcile(
    config_path: Option<PathBuf>,
    max_concurrent: Option<usize>,
    storage_path: Option<PathBuf>,
    manifests: &[PathBuf],
) -> i32 {
    let mut overrides = serde_json::Map::new();
    if let Some(n) = max_concurrent {
        overrides.insert("reconcile".into(), serde_json::json!({ "max_concurrent": n }));
    }
    if let Some(path) = storage_path {
        overrides.insert("storage".into(), serde_json::json!({ "path": path }));
    }
    let cli_layer = (!overrides.is_empty()).then(|| serde_json::Value::Object(overrides));

    let effective = match EffectiveConfig::build(config_path.as_deref(), cli_layer) {
        Ok(effective) => effective,
        Err(e) => {
            error!("configuration error: {e}");
            return EXIT_USAGE;
        }
    };
    let config = effective.config;

    let mut deployments = match load_all(manifests) {
        Ok(deployments) => deployments,
        Err(e) => {
            error!("{e}");
            return EXIT_USAGE;
        }
    };

    let storage = match config.open_storage() {
        Ok(storage) => storage,
        Err(e) => {
            error!("failed to open artifact storage: {e}");
            return EXIT_USAGE;
        }
    };
    let credentials = match &config.reconcile.credentials_dir {
        Some(dir) => match StaticCredentials::from_dir(dir) {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("failed to load credentials: {e}");
                return EXIT_USAGE;
            }
        },
        None => StaticCredentials::new(),
    };
    let sources = match &config.reconcile.source_base_dir {
        Some(dir) => LocalSource::with_base_dir(dir),
        None => LocalSource::new(),
    };

    let services = Services {
        storage,
        engine: Arc::new(ProcessEngine::new(config.process_engine())),
        sources: Arc::new(sources),
        credentials: Arc::new(credentials),
        events: Arc::new(LogRecorder),
        metrics: Arc::new(NoopMetrics),
        settings: config.pipeline_settings(),
    };
    let controller = Controller::new(Reconciler::new(services), config.reconcile.max_concurrent);

    let ctx = Context::background();
    let flag = ctx.cancellation_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt, cancelling in-flight reconciliations...");
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }) {
        warn!("failed to install interrupt handler: {e}");
    }

    let run_id = ulid::Ulid::new().to_string().to_lowercase();
    let span = info_span!("run", %run_id);
    let _enter = span.enter();

    let outcomes = match controller.reconcile_all(&ctx, &mut deployments) {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!("{e}");
            return EXIT_USAGE;
        }
    };
    for outcome in &outcomes {
        match &outcome.result {
            Ok(result) => info!(object = %outcome.key, ?result, "reconciled"),
            Err(e) => warn!(object = %outcome.key, error = %e, "reconcile failed"),
        }
    }

    let mut all_ready = true;
    for (manifest, deployment) in manifests.iter().zip(&deployments) {
        if let Err(e) = save_status(manifest, deployment) {
            error!("{e}");
            all_ready = false;
        }
        let gone = deployment.is_deleting() && deployment.metadata.finalizers.is_empty();
        if !(gone || deployment.status.is_ready() || deployment.is_suspended()) {
            all_ready = false;
        }
    }

    if ctx.is_done() {
        return EXIT_CANCELLED;
    }
    i32::from(!all_ready)
}

fn run_window(spec: &str, at: Option<&str>) -> i32 {
    let now = match at {
        Some(at) => match DateTime::parse_from_rfc3339(at) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                eprintln!("invalid --at: {e}");
                return EXIT_USAGE;
            }
        },
        None => Utc::now(),
    };

    match driftgate_window::matches(now, spec) {
        Ok(true) => {
            println!("allow");
            0
        }
        Ok(false) => {
            println!("deny");
            1
        }
        Err(e) => {
            eprintln!("invalid window: {e}");
            EXIT_USAGE
        }
    }
}

fn run_dependents(source: &str, kind: &str, revision: &str, manifests: &[PathBuf]) -> i32 {
    let changed = match source.parse::<ObjectKey>() {
        Ok(key) => SourceKey::new(kind, key),
        Err(e) => {
            eprintln!("invalid --source: {e}");
            return EXIT_USAGE;
        }
    };
    let deployments = match load_all(manifests) {
        Ok(deployments) => deployments,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_USAGE;
        }
    };

    match affected_dependents(&changed, revision, &deployments) {
        Ok(requests) => {
            for request in requests {
                println!("{request}");
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
