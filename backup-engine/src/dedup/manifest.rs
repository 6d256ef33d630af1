//! Chunk manifests: the ordered chunk list that reassembles one file.
//!
//! Inside a backup directory a chunked file is represented by a pointer file
//! `<relative path>.chunks` holding its manifest as JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Suffix of chunk pointer files inside backup directories.
pub const CHUNK_POINTER_SUFFIX: &str = ".chunks";

/// One chunk occurrence within a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub digest: String,
    pub offset: u64,
    pub len: u64,
}

/// Ordered chunks of a single file. A digest may repeat when the file
/// contains the same block more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunks: Vec<ChunkRef>,
    pub total_size: u64,
}

impl ChunkManifest {
    pub fn push(&mut self, digest: String, len: u64) {
        self.chunks.push(ChunkRef {
            digest,
            offset: self.total_size,
            len,
        });
        self.total_size += len;
    }

    pub fn digests(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(|c| c.digest.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn read_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn write_to(&self, path: &Path) -> crate::Result<()> {
        let json = serde_json::to_vec(self)?;
        crate::fs::write_atomic(path, &json)?;
        Ok(())
    }
}

/// Pointer path for a captured file, e.g. `world/region.dat` → `world/region.dat.chunks`.
pub fn pointer_path_for(relative_path: &str) -> String {
    format!("{relative_path}{CHUNK_POINTER_SUFFIX}")
}

/// Inverse of [`pointer_path_for`].
pub fn file_path_for_pointer(pointer: &str) -> Option<&str> {
    pointer.strip_suffix(CHUNK_POINTER_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_tracks_offsets() {
        let mut manifest = ChunkManifest::default();
        manifest.push("aa".into(), 4);
        manifest.push("bb".into(), 4);
        manifest.push("aa".into(), 2);

        assert_eq!(manifest.total_size, 10);
        let offsets: Vec<_> = manifest.chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(manifest.digests().collect::<Vec<_>>(), vec!["aa", "bb", "aa"]);
    }

    #[test]
    fn test_pointer_paths() {
        assert_eq!(pointer_path_for("world/r.0.0.mca"), "world/r.0.0.mca.chunks");
        assert_eq!(file_path_for_pointer("a.bin.chunks"), Some("a.bin"));
        assert_eq!(file_path_for_pointer("a.bin"), None);
    }
}
