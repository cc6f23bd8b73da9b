//! Deterministic packing and hashing of source trees.
//!
//! Archives are gzip-compressed tarballs with sorted paths, zeroed
//! timestamps and owners, and normalized modes, so identical trees always
//! produce identical bytes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::{ArchiveFilter, StoreError, StoreResult};

/// Streaming SHA-256 of everything readable from `reader`, as lowercase hex.
pub fn checksum<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a string, as lowercase hex.
pub fn digest_str(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Writer adapter that hashes bytes as they pass through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
enum TreeEntry {
    File { executable: bool },
    Directory,
    Symlink { target: PathBuf },
}

/// Walk `root` in sorted order, skipping filtered paths.
fn collect_entries(
    root: &Path,
    filter: Option<&ArchiveFilter>,
) -> StoreResult<BTreeMap<PathBuf, TreeEntry>> {
    let mut entries = BTreeMap::new();

    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        let rel_path = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };

        if filter.is_some_and(|f| f.is_excluded(&rel_path)) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let file_type = entry.file_type();
        let tree_entry = if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(StoreError::io(entry.path()))?;
            TreeEntry::Symlink { target }
        } else if file_type.is_dir() {
            TreeEntry::Directory
        } else {
            TreeEntry::File {
                executable: is_executable(entry.path()),
            }
        };
        entries.insert(rel_path, tree_entry);
    }

    Ok(entries)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn canonical_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

/// Pack `root` into a deterministic tar.gz written to `out`.
///
/// Returns the SHA-256 checksum and byte length of the compressed stream.
pub fn write_tarball<W: Write>(
    root: &Path,
    filter: Option<&ArchiveFilter>,
    out: W,
) -> StoreResult<(String, u64)> {
    let entries = collect_entries(root, filter)?;

    let hashing = HashingWriter::new(out);
    let encoder = GzEncoder::new(hashing, Compression::default());
    let mut builder = Builder::new(encoder);
    let write_err = |e: io::Error| StoreError::Io {
        path: root.to_path_buf(),
        source: e,
    };

    for (rel_path, entry) in &entries {
        match entry {
            TreeEntry::File { executable } => {
                let full_path = root.join(rel_path);
                let contents = fs::read(&full_path).map_err(StoreError::io(&full_path))?;
                let mode = if *executable { 0o755 } else { 0o644 };
                let mut header = canonical_header(EntryType::Regular, mode, contents.len() as u64);
                builder
                    .append_data(&mut header, rel_path, contents.as_slice())
                    .map_err(write_err)?;
            }
            TreeEntry::Directory => {
                let mut header = canonical_header(EntryType::Directory, 0o755, 0);
                builder
                    .append_data(&mut header, rel_path, io::empty())
                    .map_err(write_err)?;
            }
            TreeEntry::Symlink { target } => {
                let mut header = canonical_header(EntryType::Symlink, 0o777, 0);
                builder
                    .append_link(&mut header, rel_path, target)
                    .map_err(write_err)?;
            }
        }
    }

    let encoder = builder.into_inner().map_err(write_err)?;
    let hashing = encoder.finish().map_err(write_err)?;
    let (mut out, checksum, size) = hashing.finish();
    out.flush().map_err(write_err)?;
    Ok((checksum, size))
}

/// Deterministic digest of a directory tree.
///
/// Covers relative paths, entry types, executable bits, file contents and
/// symlink targets; ignores timestamps and ownership.
pub fn hash_tree(root: &Path, filter: Option<&ArchiveFilter>) -> StoreResult<String> {
    let entries = collect_entries(root, filter)?;
    let mut hasher = Sha256::new();

    for (rel_path, entry) in &entries {
        let rel = rel_path.to_string_lossy();
        match entry {
            TreeEntry::File { executable } => {
                let full_path = root.join(rel_path);
                let file = File::open(&full_path).map_err(StoreError::io(&full_path))?;
                let content = checksum(file).map_err(StoreError::io(&full_path))?;
                let mode = if *executable { "x" } else { "f" };
                hasher.update(format!("{mode} {rel} {content}\n").as_bytes());
            }
            TreeEntry::Directory => {
                hasher.update(format!("d {rel}\n").as_bytes());
            }
            TreeEntry::Symlink { target } => {
                hasher.update(format!("l {rel} {}\n", target.to_string_lossy()).as_bytes());
            }
        }
    }

    Ok(hex::encode(hasher.finalize()))
}
