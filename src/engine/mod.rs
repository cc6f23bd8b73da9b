//! Interface to the external deployment engine.
//!
//! The engine materializes a project's source tree (`archive`) and mutates
//! the target environment (`deploy`, `prune`, `delete`) or checks it
//! (`validate`). The pipeline only depends on the [`Engine`] trait;
//! [`ProcessEngine`] shells out to the engine binary and
//! [`crate::mock::FakeEngine`] is the in-memory stand-in for tests.

mod process;

pub use process::{ProcessEngine, ProcessEngineConfig};

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use driftgate_store::{hash_tree, ArchiveFilter, StoreError};

use crate::cancel::{Context, ContextError};
use crate::object::{DeploymentSpec, ImageOverride};

/// Errors from invoking the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Spawn(String),

    #[error("engine exited with {}: {stderr}", describe_exit(.code))]
    Exit { code: Option<i32>, stderr: String },

    #[error("unreadable engine output: {0}")]
    Output(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("engine invocation aborted: {0}")]
    Aborted(#[from] ContextError),

    #[error("invalid project: {0}")]
    Project(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// Kubernetes-style object reference reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.group.is_empty() {
            write!(f, "{}/", self.group)?;
        }
        write!(f, "{}/", self.kind)?;
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}/")?;
        }
        f.write_str(&self.name)
    }
}

/// Error or warning attached to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIssue {
    #[serde(rename = "ref")]
    pub reference: ObjectRef,
    pub message: String,
}

/// Structured result of a deploy, prune, validate or delete run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_objects: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_objects: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_objects: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphan_objects: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_hook_objects: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResourceIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResourceIssue>,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !(self.new_objects.is_empty()
            && self.changed_objects.is_empty()
            && self.deleted_objects.is_empty())
    }

    /// One-line human summary, used in events and condition messages.
    pub fn summary(&self) -> String {
        format!(
            "{} new, {} changed, {} deleted, {} orphan, {} hooks, {} errors, {} warnings",
            self.new_objects.len(),
            self.changed_objects.len(),
            self.deleted_objects.len(),
            self.orphan_objects.len(),
            self.applied_hook_objects.len(),
            self.errors.len(),
            self.warnings.len()
        )
    }

    /// Per-resource error detail joined into one message.
    pub fn error_detail(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.reference, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Stable digest of every object the engine reported touching.
    pub fn objects_hash(&self) -> String {
        let mut refs: Vec<String> = self
            .new_objects
            .iter()
            .chain(&self.changed_objects)
            .chain(&self.orphan_objects)
            .chain(&self.applied_hook_objects)
            .map(ToString::to_string)
            .collect();
        refs.sort();
        refs.dedup();

        let mut hasher = Sha256::new();
        for r in refs {
            hasher.update(r.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// A git repository that contributed to an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvolvedRepo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    pub commit: String,
}

/// A deployment target declared by the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
}

/// Deterministic description of a produced archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub archive_hash: String,
    pub metadata_hash: String,
    #[serde(default)]
    pub involved_repos: Vec<InvolvedRepo>,
    #[serde(default)]
    pub targets: Vec<TargetInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveMetadata<'a> {
    involved_repos: &'a [InvolvedRepo],
    targets: &'a [TargetInfo],
}

impl ArchiveInfo {
    /// Hash a materialized tree and its metadata.
    ///
    /// `archive_hash` covers the tree contents; `metadata_hash` is the
    /// SHA-256 of the canonical JSON of repos and targets.
    pub fn compute(
        tree_dir: &Path,
        filter: Option<&ArchiveFilter>,
        involved_repos: Vec<InvolvedRepo>,
        targets: Vec<TargetInfo>,
    ) -> Result<Self, StoreError> {
        let archive_hash = hash_tree(tree_dir, filter)?;
        let metadata_hash = metadata_hash(&involved_repos, &targets);
        Ok(Self {
            archive_hash,
            metadata_hash,
            involved_repos,
            targets,
        })
    }

    pub fn revision(&self) -> String {
        format!("{}-{}", self.archive_hash, self.metadata_hash)
    }
}

fn metadata_hash(involved_repos: &[InvolvedRepo], targets: &[TargetInfo]) -> String {
    let metadata = ArchiveMetadata {
        involved_repos,
        targets,
    };
    // Plain strings and vectors always serialize.
    let bytes = serde_json_canonicalizer::to_vec(&metadata).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Input for materializing a project.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    /// Checked-out upstream source.
    pub source_dir: PathBuf,
    /// Project sub-directory inside `source_dir`.
    pub project_path: Option<String>,
    /// Directory the engine writes the materialized tree into.
    pub output_dir: PathBuf,
    pub credentials_dir: Option<PathBuf>,
}

/// A materialized project tree plus its metadata.
#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    pub tree_dir: PathBuf,
    pub involved_repos: Vec<InvolvedRepo>,
    pub targets: Vec<TargetInfo>,
}

/// Input for deploy, prune, validate and delete.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub project_dir: PathBuf,
    pub target: Option<String>,
    pub dry_run: bool,
    pub args: BTreeMap<String, String>,
    pub images: Vec<ImageOverride>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub credentials_dir: Option<PathBuf>,
}

impl DeployRequest {
    /// Request carrying the engine settings of a deployment spec.
    pub fn for_spec(
        spec: &DeploymentSpec,
        project_dir: PathBuf,
        credentials_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            project_dir,
            target: spec.target.clone(),
            dry_run: spec.dry_run,
            args: spec.args.clone(),
            images: spec.images.clone(),
            include_tags: spec.include_tags.clone(),
            exclude_tags: spec.exclude_tags.clone(),
            credentials_dir,
        }
    }
}

/// The external deployment engine.
pub trait Engine: Send + Sync {
    fn archive(&self, ctx: &Context, request: &ArchiveRequest) -> Result<ArchiveOutput, EngineError>;
    fn deploy(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError>;
    fn prune(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError>;
    fn validate(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError>;
    fn delete(&self, ctx: &Context, request: &DeployRequest) -> Result<CommandResult, EngineError>;
}
