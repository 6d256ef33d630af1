//! Backup integrity validation.
//!
//! A backup is valid when its directory exists, every manifest file exists
//! and still matches the checksum recorded the first time it was validated,
//! and (for incrementals) its parent is in the catalog. For chunk pointers
//! every referenced chunk must also be present in the dedup store. File
//! hashes are memoized per path and only recomputed when size or mtime
//! changes.

use crate::catalog::{BackupRecord, BackupType, MetadataCatalog};
use crate::dedup::{ChunkManifest, DedupStore};
use crate::fs::FileStamp;
use crate::utils::errors::Result;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HASH_BUFFER_SIZE: usize = 8 * 1024;

pub const VALID_MESSAGE: &str = "Backup is valid";

/// Memoized per-file result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub valid: bool,
    pub size: u64,
    pub modified_ns: i64,
    pub checksum: String,
}

/// Backup-level result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub backup_id: String,
    pub valid: bool,
    pub message: String,
}

#[derive(Default)]
pub struct ValidationService {
    files: DashMap<PathBuf, FileCheck>,
    results: DashMap<String, ValidationOutcome>,
}

impl ValidationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `record` against its directory under `backup_root` and write
    /// the outcome (plus any newly learned checksums) back to the catalog.
    pub fn validate_backup(
        &self,
        record: &BackupRecord,
        backup_root: &Path,
        catalog: &MetadataCatalog,
        dedup: &DedupStore,
    ) -> Result<BackupRecord> {
        let backup_dir = backup_root.join(&record.id);
        let mut problems = Vec::new();
        let mut learned = Vec::new();

        if !backup_dir.is_dir() {
            problems.push("Backup directory not found".to_string());
        } else {
            for (provider, files) in &record.files {
                let provider_dir = backup_dir.join(provider);
                for file in files {
                    let path = provider_dir.join(file);
                    if !path.is_file() {
                        problems.push(format!("Missing file for provider {provider}: {file}"));
                        continue;
                    }

                    let checksum = match self.checksum(&path) {
                        Ok(checksum) => checksum,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Failed to hash backup file");
                            self.mark(&path, false);
                            problems.push(format!("Corrupted file for provider {provider}: {file}"));
                            continue;
                        }
                    };

                    let baseline = record.checksums.get(provider).and_then(|m| m.get(file));
                    match baseline {
                        Some(expected) if *expected != checksum => {
                            self.mark(&path, false);
                            problems.push(format!("Corrupted file for provider {provider}: {file}"));
                            continue;
                        }
                        Some(_) => {}
                        None => learned.push((provider.clone(), file.clone(), checksum)),
                    }

                    if record.is_chunk_pointer(provider, file) {
                        match missing_chunks(&path, dedup) {
                            Some(missing) => problems.extend(missing.into_iter().map(|digest| {
                                format!("Missing chunk for provider {provider}: {file} ({digest})")
                            })),
                            None => {
                                self.mark(&path, false);
                                problems.push(format!("Corrupted file for provider {provider}: {file}"));
                            }
                        }
                    }
                }
            }
        }

        if record.backup_type == BackupType::Incremental {
            match &record.parent_id {
                None => problems.push("Incremental backup without parent".to_string()),
                Some(parent) if !catalog.contains(parent) => {
                    problems.push(format!("Parent backup not found: {parent}"));
                }
                Some(_) => {}
            }
        }

        let valid = problems.is_empty();
        let message = if valid {
            VALID_MESSAGE.to_string()
        } else {
            problems.join("; ")
        };

        if valid {
            info!(backup_id = %record.id, "Backup validated");
        } else {
            warn!(backup_id = %record.id, problems = %message, "Backup failed validation");
        }

        let updated = catalog.update(&record.id, |r| {
            r.validated = true;
            r.valid = valid;
            r.validation_message = Some(message.clone());
            for (provider, file, checksum) in learned {
                r.checksums
                    .entry(provider)
                    .or_default()
                    .entry(file)
                    .or_insert(checksum);
            }
        })?;

        self.results.insert(
            record.id.clone(),
            ValidationOutcome {
                backup_id: record.id.clone(),
                valid,
                message,
            },
        );

        Ok(updated)
    }

    /// SHA-256 of `path`, reusing the memo while size and mtime are unchanged.
    pub fn checksum(&self, path: &Path) -> std::io::Result<String> {
        let stamp = FileStamp::from_path(path)?;
        if let Some(cached) = self.files.get(path) {
            if cached.size == stamp.size && cached.modified_ns == stamp.modified_ns {
                return Ok(cached.checksum.clone());
            }
        }

        let checksum = sha256_file(path)?;
        debug!(path = %path.display(), "Hashed backup file");
        self.files.insert(
            path.to_path_buf(),
            FileCheck {
                valid: true,
                size: stamp.size,
                modified_ns: stamp.modified_ns,
                checksum: checksum.clone(),
            },
        );
        Ok(checksum)
    }

    fn mark(&self, path: &Path, valid: bool) {
        if let Some(mut entry) = self.files.get_mut(path) {
            entry.valid = valid;
        }
    }

    pub fn file_check(&self, path: &Path) -> Option<FileCheck> {
        self.files.get(path).map(|e| e.clone())
    }

    pub fn last_result(&self, backup_id: &str) -> Option<ValidationOutcome> {
        self.results.get(backup_id).map(|e| e.clone())
    }

    /// Drop memo entries belonging to a deleted backup.
    pub fn evict(&self, backup_id: &str, backup_root: &Path) {
        let backup_dir = backup_root.join(backup_id);
        self.files.retain(|path, _| !path.starts_with(&backup_dir));
        self.results.remove(backup_id);
    }

    pub fn cached_files(&self) -> usize {
        self.files.len()
    }
}

/// Distinct digests referenced by the pointer at `path` that the store
/// lacks, or `None` when the pointer cannot be read.
fn missing_chunks(path: &Path, dedup: &DedupStore) -> Option<Vec<String>> {
    let manifest = match ChunkManifest::read_from(path) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable chunk pointer");
            return None;
        }
    };
    let mut seen = BTreeSet::new();
    Some(
        manifest
            .digests()
            .filter(|digest| seen.insert(*digest) && !dedup.contains(digest))
            .map(str::to_string)
            .collect(),
    )
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
