//! Content-addressed artifact store.
//!
//! Artifacts are deterministic tarballs keyed by `(kind, namespace/name,
//! revision)`. The store provides write-once archiving with atomic renames,
//! per-artifact advisory write locks, grace-period garbage collection and
//! atomically updated aliases such as `latest.tar.gz`.

mod archive;
mod artifact;
mod error;
mod filter;
mod lock;
mod storage;

pub use archive::{checksum, digest_str, hash_tree, write_tarball};
pub use artifact::Artifact;
pub use error::{StoreError, StoreResult};
pub use filter::ArchiveFilter;
pub use lock::{ArtifactLock, LOCK_SUFFIX};
pub use storage::{Storage, ARTIFACT_EXTENSION};

/// Alias that always points at the most recently stored artifact.
pub const LATEST_ALIAS: &str = "latest.tar.gz";
