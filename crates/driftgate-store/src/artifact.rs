//! Artifact records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A packaged, content-addressed snapshot owned by one object.
///
/// `path` is relative to the store root and uses `/` separators; it is a
/// pure function of `(kind, namespace, name, revision)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub revision: String,
    pub path: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Artifact {
    /// Directory holding all artifacts of the owner, relative to the store root.
    pub fn owner_dir(&self) -> String {
        match self.path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        }
    }

    /// File name of the artifact inside its owner directory.
    pub fn file_name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, file)) => file,
            None => &self.path,
        }
    }

    /// Whether both records describe the same stored bytes.
    pub fn has_same_content(&self, other: &Artifact) -> bool {
        self.path == other.path && self.checksum.is_some() && self.checksum == other.checksum
    }
}
