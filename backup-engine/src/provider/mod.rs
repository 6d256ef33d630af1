//! Resource providers: the pluggable units that capture and restore one
//! slice of server state.
//!
//! The engine only consumes the set of relative paths a provider reports;
//! how a provider detects changes is its own business. Providers report
//! failures as `anyhow::Error`, which the engine wraps as a provider failure.

pub mod directory;

pub use directory::DirectoryProvider;

use crate::catalog::BackupType;
use crate::dedup::manifest::pointer_path_for;
use crate::dedup::{ChunkManifest, DedupStore, RetrieveReport};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

/// Details of the backup being captured.
#[derive(Debug, Clone)]
pub struct BackupContext {
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Engine services handed to a provider for the duration of one call.
pub struct ProviderContext<'a> {
    backup_id: &'a str,
    backup_type: BackupType,
    dedup: &'a DedupStore,
    /// Pointers written through `store_chunked` during this call
    written: Mutex<BTreeSet<String>>,
    /// Pointers recorded for the backup being restored
    pointers: Option<&'a BTreeSet<String>>,
}

impl<'a> ProviderContext<'a> {
    pub(crate) fn new(backup_id: &'a str, backup_type: BackupType, dedup: &'a DedupStore) -> Self {
        Self {
            backup_id,
            backup_type,
            dedup,
            written: Mutex::new(BTreeSet::new()),
            pointers: None,
        }
    }

    pub(crate) fn with_pointers(mut self, pointers: Option<&'a BTreeSet<String>>) -> Self {
        self.pointers = pointers;
        self
    }

    /// Drain the pointers written so far.
    pub(crate) fn take_written(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.written.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn backup_id(&self) -> &str {
        self.backup_id
    }

    pub fn backup_type(&self) -> BackupType {
        self.backup_type
    }

    pub fn dedup(&self) -> &DedupStore {
        self.dedup
    }

    /// Store `source` in the dedup store and write its chunk pointer under
    /// `provider_dir`. Returns the pointer's relative path for the manifest.
    pub fn store_chunked(
        &self,
        source: &Path,
        provider_dir: &Path,
        relative_path: &str,
    ) -> anyhow::Result<String> {
        let manifest = self.dedup.store_file(source)?;
        let pointer = pointer_path_for(relative_path);
        if let Err(e) = manifest.write_to(&provider_dir.join(&pointer)) {
            // The pointer is the only record of these references
            self.dedup.remove_file(&manifest)?;
            return Err(e.into());
        }
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pointer.clone());
        Ok(pointer)
    }

    /// Whether `relative_path` in the backup being restored is a chunk
    /// pointer. Only pointers recorded at capture time count.
    pub fn is_chunk_pointer(&self, relative_path: &str) -> bool {
        self.pointers.is_some_and(|p| p.contains(relative_path))
    }

    /// Reassemble the file described by the pointer at `pointer_path` into `output`.
    pub fn restore_chunked(&self, pointer_path: &Path, output: &Path) -> anyhow::Result<RetrieveReport> {
        let manifest = ChunkManifest::read_from(pointer_path)?;
        Ok(self.dedup.retrieve_file(&manifest, output)?)
    }
}

pub trait ResourceProvider: Send + Sync {
    /// Stable identifier; also the provider's subdirectory name in every backup.
    fn id(&self) -> &str;

    fn display_name(&self) -> &str {
        self.id()
    }

    /// Full capture into `backup_dir`. Returns the relative paths written.
    fn perform_backup(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        context: &BackupContext,
    ) -> anyhow::Result<BTreeSet<String>>;

    /// Capture what changed since the capture in `previous_backup_dir`.
    /// Falls back to a full capture when that directory does not exist.
    fn perform_incremental_backup(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        previous_backup_dir: &Path,
    ) -> anyhow::Result<BTreeSet<String>>;

    /// Apply `files` from `backup_dir` back onto the live system.
    fn perform_restore(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        files: &BTreeSet<String>,
    ) -> anyhow::Result<()>;
}
