//! Off-site replication of completed backups.
//!
//! A replicated backup has its tree under `<target>/<id>/`, its record under
//! `<target>/metadata/<id>.json` and every chunk it references under
//! `<target>/chunks/`. The local `.replicated` marker is written last, so a
//! backup without a marker is retried on the next sweep.

use crate::catalog::{BackupRecord, MetadataCatalog};
use crate::dedup::{ChunkManifest, DedupStore};
use crate::fs::copy_tree;
use crate::utils::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const MARKER_FILE: &str = ".replicated";
const REMOTE_METADATA_DIR: &str = "metadata";
const REMOTE_CHUNK_DIR: &str = "chunks";

pub struct ReplicationService {
    backup_root: PathBuf,
    target: Option<PathBuf>,
    catalog: Arc<MetadataCatalog>,
    dedup: Arc<DedupStore>,
}

impl ReplicationService {
    pub fn new(
        backup_root: impl Into<PathBuf>,
        target: Option<PathBuf>,
        catalog: Arc<MetadataCatalog>,
        dedup: Arc<DedupStore>,
    ) -> Self {
        Self {
            backup_root: backup_root.into(),
            target,
            catalog,
            dedup,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    fn require_target(&self) -> Result<&Path> {
        self.target.as_deref().ok_or(EngineError::ReplicationDisabled)
    }

    pub fn marker_path(&self, backup_id: &str) -> PathBuf {
        self.backup_root.join(backup_id).join(MARKER_FILE)
    }

    pub fn is_replicated(&self, backup_id: &str) -> bool {
        self.marker_path(backup_id).exists()
    }

    /// Replicate every backup that has no marker yet. Failures are logged and
    /// left for the next sweep. Returns the number replicated.
    pub fn check_pending_replications(&self) -> Result<usize> {
        self.require_target()?;

        let pending: Vec<BackupRecord> = self
            .catalog
            .list()
            .into_iter()
            .filter(|r| !self.is_replicated(&r.id))
            .collect();

        if pending.is_empty() {
            debug!("No pending replications");
            return Ok(0);
        }

        info!(pending = pending.len(), "Replicating pending backups");
        let mut replicated = 0;
        for record in &pending {
            match self.replicate_backup(record) {
                Ok(_) => replicated += 1,
                Err(e) => warn!(backup_id = %record.id, error = %e, "Replication failed, will retry"),
            }
        }
        Ok(replicated)
    }

    /// Mirror one backup to the target and mark it replicated.
    pub fn replicate_backup(&self, record: &BackupRecord) -> Result<BackupRecord> {
        let target = self.require_target()?;
        self.mirror(record, target)
            .map_err(|e| replication_error(&record.id, e))?;

        std::fs::write(self.marker_path(&record.id), b"")?;
        let updated = self.catalog.update(&record.id, |r| r.replicated = true)?;

        info!(backup_id = %record.id, target = %target.display(), "Backup replicated");
        Ok(updated)
    }

    fn mirror(&self, record: &BackupRecord, target: &Path) -> Result<()> {
        let source_dir = self.backup_root.join(&record.id);
        if !source_dir.is_dir() {
            return Err(EngineError::BackupNotFound(record.id.clone()));
        }

        let bytes = copy_tree(&source_dir, &target.join(&record.id), &[MARKER_FILE])?;

        let remote_chunks = target.join(REMOTE_CHUNK_DIR);
        let mut chunks = 0;
        for manifest in chunk_manifests(record, &source_dir)? {
            chunks += self.dedup.export_chunks(&manifest, &remote_chunks)?;
        }

        let mut mirrored = self.catalog.get(&record.id).unwrap_or_else(|| record.clone());
        mirrored.replicated = true;
        crate::fs::write_atomic(
            &target
                .join(REMOTE_METADATA_DIR)
                .join(format!("{}.json", record.id)),
            &serde_json::to_vec_pretty(&mirrored)?,
        )?;

        debug!(backup_id = %record.id, bytes, chunks, "Mirrored backup tree");
        Ok(())
    }

    /// Run [`replicate_backup`](Self::replicate_backup) off the caller's
    /// thread: on the tokio blocking pool inside a runtime, else a std thread.
    pub fn spawn_replication(self: &Arc<Self>, record: BackupRecord) {
        let service = Arc::clone(self);
        let job = move || {
            if let Err(e) = service.replicate_backup(&record) {
                error!(backup_id = %record.id, error = %e, "Background replication failed");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }

    /// Pull a replicated backup back from the target into the local roots.
    pub fn import_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let target = self.require_target()?;

        if let Some(existing) = self.catalog.get(backup_id) {
            info!(backup_id = %backup_id, "Backup already present locally, skipping import");
            return Ok(existing);
        }

        let remote_record = target
            .join(REMOTE_METADATA_DIR)
            .join(format!("{backup_id}.json"));
        if !remote_record.is_file() {
            return Err(EngineError::BackupNotFound(backup_id.to_string()));
        }
        let record: BackupRecord = serde_json::from_slice(&std::fs::read(&remote_record)?)?;

        let remote_dir = target.join(backup_id);
        let manifests = chunk_manifests(&record, &remote_dir).map_err(|e| replication_error(backup_id, e))?;
        let pulled = self
            .dedup
            .import_chunks(&manifests, &target.join(REMOTE_CHUNK_DIR))
            .map_err(|e| replication_error(backup_id, e))?;

        let local_dir = self.backup_root.join(backup_id);
        let imported = match self.install_import(backup_id, &remote_record, &remote_dir, &local_dir) {
            Ok(imported) => imported,
            Err(e) => {
                self.rollback_import(backup_id, &local_dir, &manifests);
                return Err(replication_error(backup_id, e));
            }
        };

        info!(backup_id = %backup_id, files = imported.file_count(), chunks = pulled, "Backup imported");
        Ok(imported)
    }

    fn install_import(
        &self,
        backup_id: &str,
        remote_record: &Path,
        remote_dir: &Path,
        local_dir: &Path,
    ) -> Result<BackupRecord> {
        copy_tree(remote_dir, local_dir, &[MARKER_FILE])?;
        std::fs::copy(remote_record, self.catalog.record_path(backup_id))?;
        self.catalog.reload(backup_id)?;
        std::fs::write(self.marker_path(backup_id), b"")?;
        self.catalog.update(backup_id, |r| r.replicated = true)
    }

    /// Undo a partial import: references, copied tree and record.
    fn rollback_import(&self, backup_id: &str, local_dir: &Path, manifests: &[ChunkManifest]) {
        if let Err(e) = self.dedup.remove_files(manifests) {
            error!(backup_id = %backup_id, error = %e, "Failed to release imported chunks");
        }
        if local_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(local_dir) {
                warn!(path = %local_dir.display(), error = %e, "Failed to remove partial import");
            }
        }
        if let Err(e) = self.catalog.delete(backup_id) {
            warn!(backup_id = %backup_id, error = %e, "Failed to drop partially imported record");
        }
    }
}

/// Chunk manifests of every pointer recorded for `record`, read from `backup_dir`.
pub(crate) fn chunk_manifests(record: &BackupRecord, backup_dir: &Path) -> Result<Vec<ChunkManifest>> {
    record
        .chunk_pointers()
        .map(|(provider, pointer)| ChunkManifest::read_from(&backup_dir.join(provider).join(pointer)))
        .collect()
}

fn replication_error(backup_id: &str, e: EngineError) -> EngineError {
    match e {
        EngineError::Replication { .. } => e,
        other => EngineError::Replication {
            backup_id: backup_id.to_string(),
            reason: other.to_string(),
        },
    }
}
