//! Durable catalog of backup records.
//!
//! Every record lives in `metadata/<id>.json`. The whole directory is loaded
//! at startup into a concurrent map; every mutation is written through to
//! disk before it becomes visible in memory.

pub mod record;

pub use record::{BackupRecord, BackupType, Checksums, Manifest};

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct MetadataCatalog {
    metadata_dir: PathBuf,
    records: DashMap<String, BackupRecord>,
}

impl MetadataCatalog {
    /// Open the catalog, loading every readable record in `metadata_dir`.
    pub fn open(metadata_dir: impl Into<PathBuf>) -> Result<Self> {
        let metadata_dir = metadata_dir.into();
        std::fs::create_dir_all(&metadata_dir)?;

        let catalog = Self {
            metadata_dir,
            records: DashMap::new(),
        };
        catalog.load_all()?;
        Ok(catalog)
    }

    fn load_all(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.metadata_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => {
                    self.records.insert(record.id.clone(), record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable backup record");
                }
            }
        }
        info!(
            records = self.records.len(),
            dir = %self.metadata_dir.display(),
            "Loaded backup catalog"
        );
        Ok(())
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn record_path(&self, backup_id: &str) -> PathBuf {
        self.metadata_dir.join(format!("{backup_id}.json"))
    }

    /// Insert or replace a record and persist it.
    pub fn save(&self, record: BackupRecord) -> Result<()> {
        self.persist(&record)?;
        debug!(backup_id = %record.id, "Saved backup record");
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Read-modify-write of one record under its map entry lock.
    pub fn update<F>(&self, backup_id: &str, f: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord),
    {
        let mut entry = self
            .records
            .get_mut(backup_id)
            .ok_or_else(|| EngineError::BackupNotFound(backup_id.to_string()))?;

        let mut updated = entry.clone();
        f(&mut updated);
        self.persist(&updated)?;
        *entry = updated.clone();
        Ok(updated)
    }

    pub fn get(&self, backup_id: &str) -> Option<BackupRecord> {
        self.records.get(backup_id).map(|r| r.clone())
    }

    pub fn contains(&self, backup_id: &str) -> bool {
        self.records.contains_key(backup_id)
    }

    /// Remove a record from memory and disk. Returns the removed record.
    pub fn delete(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let removed = self.records.remove(backup_id).map(|(_, r)| r);
        match std::fs::remove_file(self.record_path(backup_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(removed)
    }

    /// Re-read one record from disk, replacing the cached copy.
    pub fn reload(&self, backup_id: &str) -> Result<BackupRecord> {
        let path = self.record_path(backup_id);
        if !path.exists() {
            return Err(EngineError::BackupNotFound(backup_id.to_string()));
        }
        let record = read_record(&path)?;
        self.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn by_type(&self, backup_type: BackupType) -> Vec<BackupRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.backup_type == backup_type)
            .collect()
    }

    pub fn latest(&self) -> Option<BackupRecord> {
        self.list().pop()
    }

    pub fn latest_full(&self) -> Option<BackupRecord> {
        self.by_type(BackupType::Full).pop()
    }

    /// Latest record taken at or before `target`, else the earliest record.
    pub fn closest_to(&self, target: DateTime<Utc>) -> Option<BackupRecord> {
        let records = self.list();
        records
            .iter()
            .rev()
            .find(|r| r.timestamp <= target)
            .or_else(|| records.first())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn persist(&self, record: &BackupRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        crate::fs::write_atomic(&self.record_path(&record.id), &json)?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<BackupRecord> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}
