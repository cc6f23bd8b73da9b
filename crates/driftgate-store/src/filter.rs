//! Exclusion rules applied while archiving and hashing source trees.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::StoreResult;

/// Patterns that are never packed into an artifact.
const DEFAULT_EXCLUDES: &[&str] = &[".git", ".git/**", "**/.DS_Store"];

/// Glob-based exclusion filter.
#[derive(Debug, Clone)]
pub struct ArchiveFilter {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl ArchiveFilter {
    /// Default exclusions only.
    pub fn new() -> StoreResult<Self> {
        Self::with_patterns(&[] as &[&str])
    }

    /// Default exclusions plus `patterns`. Empty patterns are ignored.
    pub fn with_patterns<S: AsRef<str>>(patterns: &[S]) -> StoreResult<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();

        for pattern in DEFAULT_EXCLUDES {
            builder.add(Glob::new(pattern)?);
        }
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            builder.add(Glob::new(pattern)?);
            kept.push(pattern.to_string());
        }

        Ok(Self {
            glob_set: builder.build()?,
            patterns: kept,
        })
    }

    /// Caller supplied patterns, without the defaults.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a path relative to the archive root is excluded.
    pub fn is_excluded(&self, rel_path: &Path) -> bool {
        self.glob_set.is_match(rel_path.to_string_lossy().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_dir_excluded_by_default() {
        let filter = ArchiveFilter::new().unwrap();
        assert!(filter.is_excluded(Path::new(".git")));
        assert!(filter.is_excluded(Path::new(".git/HEAD")));
        assert!(!filter.is_excluded(Path::new("deploy/app.yaml")));
    }

    #[test]
    fn test_custom_patterns() {
        let filter = ArchiveFilter::with_patterns(&["*.tmp", "", "secrets/**"]).unwrap();
        assert!(filter.is_excluded(Path::new("scratch.tmp")));
        assert!(filter.is_excluded(Path::new("secrets/key.pem")));
        assert!(!filter.is_excluded(Path::new("values.yaml")));
        assert_eq!(filter.patterns(), &["*.tmp".to_string(), "secrets/**".to_string()]);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(ArchiveFilter::with_patterns(&["a/[b"]).is_err());
    }
}
