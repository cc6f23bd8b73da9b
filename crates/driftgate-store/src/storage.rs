//! Artifact storage rooted at a local directory.
//!
//! Layout: `<base>/<kind>/<namespace>/<name>/<sha256(revision)>.tar.gz`,
//! plus `<file>.lock` sidecars and named aliases (symlinks) such as
//! `latest.tar.gz` in the same owner directory.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::archive::{checksum, digest_str, write_tarball};
use crate::lock::LOCK_SUFFIX;
use crate::{ArchiveFilter, Artifact, ArtifactLock, StoreError, StoreResult};

/// File extension of stored artifacts.
pub const ARTIFACT_EXTENSION: &str = "tar.gz";

/// Prefix of in-flight temp files inside an owner directory.
const TEMP_PREFIX: &str = ".tmp-";

/// Local artifact store.
#[derive(Debug, Clone)]
pub struct Storage {
    base_path: PathBuf,
    hostname: String,
    lock_timeout: Duration,
}

impl Storage {
    /// Open (and create if needed) a store rooted at `base_path`.
    ///
    /// `hostname` is the authority artifacts are advertised under.
    pub fn new(base_path: impl AsRef<Path>, hostname: impl Into<String>) -> StoreResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(StoreError::io(&base_path))?;
        Ok(Self {
            base_path,
            hostname: hostname.into(),
            lock_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Build the artifact record for an owner revision.
    pub fn new_artifact(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        revision: &str,
    ) -> StoreResult<Artifact> {
        let kind = kind.to_ascii_lowercase();
        for segment in [kind.as_str(), namespace, name] {
            validate_segment(segment)?;
        }

        let path = format!(
            "{kind}/{namespace}/{name}/{}.{ARTIFACT_EXTENSION}",
            digest_str(revision)
        );
        let url = self.artifact_url(&path);
        Ok(Artifact {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            revision: revision.to_string(),
            path,
            url,
            checksum: None,
            size: None,
            last_update_time: None,
        })
    }

    /// Absolute local path of an artifact.
    pub fn local_path(&self, artifact: &Artifact) -> PathBuf {
        self.base_path.join(&artifact.path)
    }

    fn owner_dir(&self, artifact: &Artifact) -> PathBuf {
        self.base_path.join(artifact.owner_dir())
    }

    /// Advertised URL for a store-relative path.
    pub fn artifact_url(&self, rel_path: &str) -> String {
        format!(
            "http://{}/{}",
            self.hostname.trim_end_matches('/'),
            rel_path.trim_start_matches('/')
        )
    }

    /// Refresh the advertised URL, e.g. after the hostname changed.
    pub fn set_artifact_url(&self, artifact: &mut Artifact) {
        artifact.url = self.artifact_url(&artifact.path);
    }

    /// Whether the artifact file is present.
    pub fn exists(&self, artifact: &Artifact) -> bool {
        fs::symlink_metadata(self.local_path(artifact))
            .map(|m| m.file_type().is_file())
            .unwrap_or(false)
    }

    /// Create the owner directory with owner-only permissions.
    pub fn mkdir_all(&self, artifact: &Artifact) -> StoreResult<()> {
        let dir = self.owner_dir(artifact);
        fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
                .map_err(StoreError::io(&dir))?;
        }
        Ok(())
    }

    /// Take the exclusive write lock for an artifact path.
    pub fn lock(&self, artifact: &Artifact) -> StoreResult<ArtifactLock> {
        ArtifactLock::acquire(&self.local_path(artifact), self.lock_timeout)
    }

    /// Pack `source_dir` into the artifact's storage path.
    ///
    /// Bytes are written to a temp file in the owner directory, fsynced and
    /// renamed into place, so readers never observe a partial artifact. On
    /// success the artifact's checksum, size and update time are set.
    pub fn archive(
        &self,
        artifact: &mut Artifact,
        source_dir: &Path,
        filter: Option<&ArchiveFilter>,
    ) -> StoreResult<()> {
        let final_path = self.local_path(artifact);
        let dir = self.owner_dir(artifact);
        let temp_path = dir.join(temp_name(artifact.file_name()));

        let file = File::create(&temp_path).map_err(StoreError::io(&temp_path))?;
        let written = write_tarball(source_dir, filter, &file).and_then(|(sum, size)| {
            file.sync_all().map_err(StoreError::io(&temp_path))?;
            Ok((sum, size))
        });
        drop(file);

        let (sum, size) = match written {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io {
                path: final_path,
                source: e,
            });
        }

        debug!(path = %artifact.path, checksum = %sum, size, "artifact archived");
        artifact.checksum = Some(sum);
        artifact.size = Some(size);
        artifact.last_update_time = Some(Utc::now());
        Ok(())
    }

    /// Point the alias `alias` in the owner directory at `artifact`.
    ///
    /// Returns the advertised URL of the alias.
    pub fn symlink(&self, artifact: &Artifact, alias: &str) -> StoreResult<String> {
        validate_segment(alias)?;
        let dir = self.owner_dir(artifact);
        let link_path = dir.join(alias);
        let temp_link = dir.join(temp_name(alias));

        create_symlink(Path::new(artifact.file_name()), &temp_link)
            .map_err(StoreError::io(&temp_link))?;
        if let Err(e) = fs::rename(&temp_link, &link_path) {
            let _ = fs::remove_file(&temp_link);
            return Err(StoreError::Io {
                path: link_path,
                source: e,
            });
        }

        let owner = artifact.owner_dir();
        Ok(self.artifact_url(&format!("{owner}/{alias}")))
    }

    /// Delete every artifact of the owner except `current`.
    ///
    /// Files younger than `grace` are kept so that readers who just received
    /// a reference are not racing the delete. Aliases and lock files are
    /// never candidates. `cancelled` is polled between deletions.
    pub fn garbage_collect(
        &self,
        current: &Artifact,
        grace: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> StoreResult<Vec<PathBuf>> {
        let dir = self.owner_dir(current);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path: dir, source: e }),
        };

        let now = SystemTime::now();
        let mut deleted = Vec::new();

        for entry in entries {
            let entry = entry.map_err(StoreError::io(&dir))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name == current.file_name()
                || file_name.ends_with(LOCK_SUFFIX)
                || file_name.starts_with(TEMP_PREFIX)
            {
                continue;
            }

            let path = entry.path();
            let metadata = fs::symlink_metadata(&path).map_err(StoreError::io(&path))?;
            if !metadata.file_type().is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age < grace {
                debug!(path = %path.display(), age_secs = age.as_secs(), "skipping artifact within grace period");
                continue;
            }

            if cancelled() {
                return Err(StoreError::Interrupted {
                    deleted: deleted.len(),
                });
            }

            fs::remove_file(&path).map_err(StoreError::io(&path))?;
            let mut lock_path = path.as_os_str().to_owned();
            lock_path.push(LOCK_SUFFIX);
            let _ = fs::remove_file(PathBuf::from(lock_path));
            deleted.push(path);
        }

        deleted.sort();
        if !deleted.is_empty() {
            info!(owner = %current.owner_dir(), count = deleted.len(), "garbage collected artifacts");
        }
        Ok(deleted)
    }

    /// Delete the whole owner directory, including the current artifact.
    ///
    /// Returns the artifact files that were removed.
    pub fn remove_all(&self, artifact: &Artifact) -> StoreResult<Vec<PathBuf>> {
        let dir = self.owner_dir(artifact);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path: dir, source: e }),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StoreError::io(&dir))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file && name.ends_with(ARTIFACT_EXTENSION) && !name.starts_with(TEMP_PREFIX) {
                removed.push(entry.path());
            }
        }

        fs::remove_dir_all(&dir).map_err(StoreError::io(&dir))?;
        removed.sort();
        info!(owner = %artifact.owner_dir(), count = removed.len(), "removed all artifacts");
        Ok(removed)
    }

    /// Verify a stored artifact and unpack it into `dest`.
    pub fn unpack(&self, artifact: &Artifact, dest: &Path) -> StoreResult<()> {
        self.verify(artifact)?;
        let path = self.local_path(artifact);
        let file = File::open(&path).map_err(StoreError::io(&path))?;
        fs::create_dir_all(dest).map_err(StoreError::io(dest))?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(StoreError::io(&path))?;
        debug!(path = %artifact.path, dest = %dest.display(), "artifact unpacked");
        Ok(())
    }

    /// Recompute the checksum of a stored artifact and compare.
    pub fn verify(&self, artifact: &Artifact) -> StoreResult<()> {
        let path = self.local_path(artifact);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { path })
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        let actual = checksum(file).map_err(StoreError::io(&path))?;

        match &artifact.checksum {
            Some(expected) if *expected != actual => {
                warn!(path = %path.display(), %expected, %actual, "artifact checksum mismatch");
                Err(StoreError::ChecksumMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                })
            }
            _ => Ok(()),
        }
    }
}

fn validate_segment(segment: &str) -> StoreResult<()> {
    let invalid = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0');
    if invalid {
        return Err(StoreError::InvalidSegment {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

fn temp_name(target: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{TEMP_PREFIX}{target}.{}.{nanos}", std::process::id())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_path_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path(), "store.local").unwrap();

        let a = storage.new_artifact("Deployment", "default", "app", "main/abc").unwrap();
        let b = storage.new_artifact("Deployment", "default", "app", "main/abc").unwrap();
        let c = storage.new_artifact("Deployment", "default", "app", "main/def").unwrap();

        assert_eq!(a.path, b.path);
        assert_ne!(a.path, c.path);
        assert!(a.path.starts_with("deployment/default/app/"));
        assert!(a.path.ends_with(".tar.gz"));
        assert_eq!(a.url, format!("http://store.local/{}", a.path));
    }

    #[test]
    fn test_invalid_segments_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path(), "store.local").unwrap();

        for (ns, name) in [("..", "app"), ("default", "a/b"), ("", "app")] {
            assert!(matches!(
                storage.new_artifact("Deployment", ns, name, "r1"),
                Err(StoreError::InvalidSegment { .. })
            ));
        }
    }

    #[test]
    fn test_set_artifact_url_follows_hostname() {
        let temp_dir = TempDir::new().unwrap();
        let old = Storage::new(temp_dir.path(), "old.local").unwrap();
        let new = Storage::new(temp_dir.path(), "new.local/").unwrap();

        let mut artifact = old.new_artifact("Deployment", "default", "app", "r1").unwrap();
        new.set_artifact_url(&mut artifact);
        assert!(artifact.url.starts_with("http://new.local/deployment/"));
    }

    #[test]
    #[cfg(unix)]
    fn test_mkdir_all_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path(), "store.local").unwrap();
        let artifact = storage.new_artifact("Deployment", "default", "app", "r1").unwrap();

        storage.mkdir_all(&artifact).unwrap();
        let mode = fs::metadata(temp_dir.path().join("deployment/default/app"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_remove_all_missing_owner_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path(), "store.local").unwrap();
        let artifact = storage.new_artifact("Deployment", "default", "ghost", "r1").unwrap();
        assert!(storage.remove_all(&artifact).unwrap().is_empty());
    }
}
