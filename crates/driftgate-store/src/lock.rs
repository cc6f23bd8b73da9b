//! Advisory per-artifact write locks.
//!
//! Only writers lock; readers of a published artifact never block. The lock
//! is a `flock` on a `<artifact>.lock` sidecar file and is released when the
//! guard is dropped, so every exit path (including errors and cancellation)
//! releases it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{StoreError, StoreResult};

/// Suffix of lock sidecar files.
pub const LOCK_SUFFIX: &str = ".lock";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONTENTION_WARNING_AFTER: Duration = Duration::from_millis(500);

/// Exclusive write lock on one artifact path.
#[derive(Debug)]
pub struct ArtifactLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl ArtifactLock {
    /// Acquire the lock for `artifact_path`, waiting up to `timeout`.
    ///
    /// The parent directory must already exist.
    pub fn acquire(artifact_path: &Path, timeout: Duration) -> StoreResult<Self> {
        let mut lock_path = artifact_path.as_os_str().to_owned();
        lock_path.push(LOCK_SUFFIX);
        let lock_path = PathBuf::from(lock_path);

        let start = Instant::now();
        let mut warned = false;

        loop {
            match try_acquire_exclusive(&lock_path) {
                Ok(file) => {
                    if warned {
                        debug!(
                            lock = %lock_path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "artifact lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > CONTENTION_WARNING_AFTER {
                        warn!(lock = %lock_path.display(), "artifact lock contended, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(StoreError::io(&lock_path)(e)),
            }

            if start.elapsed() >= timeout {
                return Err(StoreError::LockTimeout {
                    path: lock_path,
                    timeout,
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

#[cfg(unix)]
fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(lock_path)?;

    // SAFETY: fd is owned by `file`, which outlives the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(file)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        }
        Err(e) => Err(e),
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the fd is still owned by `self.lock_file`.
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
