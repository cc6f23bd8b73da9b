//! Upstream sources and credentials.
//!
//! Fetching and authentication belong to the host platform; the pipeline
//! sees them through [`SourceProvider`] and [`CredentialsProvider`].
//! Credential material only ever lands inside one reconciliation's temp
//! directory.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use driftgate_store::{hash_tree, ArchiveFilter, StoreError};

use crate::cancel::{Context, ContextError};
use crate::object::SourceRef;

/// Well-known credential file names.
pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const CA_FILE: &str = "ca.crt";
pub const KNOWN_HOSTS: &str = "known_hosts";
pub const IDENTITY: &str = "identity";
pub const KUBECONFIG: &str = "kubeconfig";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid source reference: {0}")]
    InvalidRef(String),

    #[error("credential {0:?} not found")]
    MissingCredential(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("source fetch aborted: {0}")]
    Aborted(#[from] ContextError),
}

impl SourceError {
    /// Errors that will not go away without a spec change.
    pub fn is_config_error(&self) -> bool {
        matches!(self, SourceError::InvalidRef(_) | SourceError::MissingCredential(_))
    }

    fn io(path: &Path) -> impl FnOnce(io::Error) -> SourceError + '_ {
        move |source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A fetched source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRevision {
    pub revision: String,
    pub dir: PathBuf,
}

pub trait SourceProvider: Send + Sync {
    /// Place the current revision of `source` under `dest`.
    ///
    /// `Ok(None)` means no revision is available yet; callers report that
    /// as reconciling, not failed.
    fn fetch(
        &self,
        ctx: &Context,
        source: &SourceRef,
        namespace: &str,
        dest: &Path,
    ) -> Result<Option<SourceRevision>, SourceError>;
}

/// Source provider reading directories from the local filesystem.
///
/// Relative `path`s in source references resolve against `base_dir`. The
/// revision is `local/<tree hash>`.
#[derive(Debug, Clone, Default)]
pub struct LocalSource {
    base_dir: Option<PathBuf>,
}

impl LocalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, source: &SourceRef, namespace: &str) -> Result<PathBuf, SourceError> {
        let path = source.path.as_deref().ok_or_else(|| {
            SourceError::InvalidRef(format!(
                "{} {} has no path",
                source.kind,
                source.resolve(namespace)
            ))
        })?;
        let path = Path::new(path);
        Ok(match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        })
    }
}

impl SourceProvider for LocalSource {
    fn fetch(
        &self,
        ctx: &Context,
        source: &SourceRef,
        namespace: &str,
        dest: &Path,
    ) -> Result<Option<SourceRevision>, SourceError> {
        ctx.check()?;
        let root = self.resolve(source, namespace)?;
        if !root.is_dir() {
            debug!(path = %root.display(), "source directory not available yet");
            return Ok(None);
        }

        // The revision describes the copy, not the live tree.
        copy_tree(&root, dest).map_err(SourceError::io(dest))?;
        let filter = ArchiveFilter::new()?;
        let revision = format!("local/{}", hash_tree(dest, Some(&filter))?);
        Ok(Some(SourceRevision {
            revision,
            dir: dest.to_path_buf(),
        }))
    }
}

/// Recursively copy regular files and directories from `from` into `to`.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Named bundle of credential files, e.g. `username` + `password`.
pub type Credential = BTreeMap<String, Vec<u8>>;

pub trait CredentialsProvider: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Credential>, SourceError>;
}

/// Credentials held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: BTreeMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, file: &str, contents: impl Into<Vec<u8>>) {
        self.entries
            .entry(name.to_string())
            .or_default()
            .insert(file.to_string(), contents.into());
    }

    /// Load every sub-directory of `dir` as one credential.
    pub fn from_dir(dir: &Path) -> Result<Self, SourceError> {
        let mut creds = Self::new();
        let entries = fs::read_dir(dir).map_err(SourceError::io(dir))?;
        for entry in entries {
            let entry = entry.map_err(SourceError::io(dir))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            for file in fs::read_dir(&path).map_err(SourceError::io(&path))? {
                let file = file.map_err(SourceError::io(&path))?;
                let file_path = file.path();
                if file_path.is_file() {
                    let contents = fs::read(&file_path).map_err(SourceError::io(&file_path))?;
                    creds.insert(&name, &file.file_name().to_string_lossy(), contents);
                }
            }
        }
        Ok(creds)
    }
}

impl CredentialsProvider for StaticCredentials {
    fn get(&self, name: &str) -> Result<Option<Credential>, SourceError> {
        Ok(self.entries.get(name).cloned())
    }
}

/// Write the named credentials into `dest/<name>/<file>` with owner-only
/// permissions. Returns `None` when nothing was requested.
pub fn materialize_credentials(
    provider: &dyn CredentialsProvider,
    names: &[String],
    dest: &Path,
) -> Result<Option<PathBuf>, SourceError> {
    if names.is_empty() {
        return Ok(None);
    }

    for name in names {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SourceError::InvalidRef(format!("invalid credential name {name:?}")));
        }
        let credential = provider
            .get(name)?
            .ok_or_else(|| SourceError::MissingCredential(name.clone()))?;

        let dir = dest.join(name);
        fs::create_dir_all(&dir).map_err(SourceError::io(&dir))?;
        for (file, contents) in &credential {
            let path = dir.join(file);
            fs::write(&path, contents).map_err(SourceError::io(&path))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                    .map_err(SourceError::io(&path))?;
            }
        }
    }
    Ok(Some(dest.to_path_buf()))
}
