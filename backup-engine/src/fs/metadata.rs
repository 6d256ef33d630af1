//! Size and modification-time stamps used for change detection.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Size plus last-modified time (nanoseconds since the Unix epoch).
///
/// Two stamps are equal when a file is assumed unchanged; this is the same
/// heuristic rsync uses by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub size: u64,
    #[serde(rename = "mtime")]
    pub modified_ns: i64,
}

impl FileStamp {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(&fs::metadata(path)?))
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let modified_ns = metadata
            .modified()
            .ok()
            .map(|t| match t.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => d.as_nanos() as i64,
                Err(e) => -(e.duration().as_nanos() as i64),
            })
            .unwrap_or(0);

        Self {
            size: metadata.len(),
            modified_ns,
        }
    }
}
