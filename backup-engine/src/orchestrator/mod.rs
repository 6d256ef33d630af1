//! The backup engine: drives providers, owns the catalog and chunk store,
//! and runs validation, replication and retention around every backup.
//!
//! All public operations are synchronous. They serialize on one operation
//! lock; manual calls wait for it, scheduled triggers skip when it is held.

pub mod chain;
pub mod retention;

pub use chain::ChainMode;
pub use retention::{pinned_incrementals, plan_retention, RetentionDecision, RetentionEntry};

use crate::catalog::{BackupRecord, BackupType, MetadataCatalog};
use crate::config::EngineConfig;
use crate::dedup::{ChunkManifest, DedupStore};
use crate::provider::{BackupContext, ProviderContext, ResourceProvider};
use crate::replication::ReplicationService;
use crate::utils::errors::{EngineError, Result};
use crate::validation::{ValidationOutcome, ValidationService};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Work the scheduler can ask the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    FullBackup,
    IncrementalBackup,
    Validation,
    Replication,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::FullBackup => "full-backup",
            Trigger::IncrementalBackup => "incremental-backup",
            Trigger::Validation => "validation",
            Trigger::Replication => "replication",
        };
        f.write_str(name)
    }
}

/// What a restore applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub target: String,
    /// Backup ids applied, oldest first
    pub chain: Vec<String>,
    pub providers_restored: Vec<String>,
    /// The chain did not reach a FULL backup
    pub truncated: bool,
}

pub struct BackupEngine {
    config: EngineConfig,
    backup_root: PathBuf,
    catalog: Arc<MetadataCatalog>,
    dedup: Arc<DedupStore>,
    validation: ValidationService,
    replication: Arc<ReplicationService>,
    providers: RwLock<Vec<Arc<dyn ResourceProvider>>>,
    op_lock: Mutex<()>,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl BackupEngine {
    /// Create the storage roots and load the catalog and chunk store.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let backup_root = config.storage.backup_root.clone();
        std::fs::create_dir_all(&backup_root)?;

        let catalog = Arc::new(MetadataCatalog::open(config.metadata_dir())?);
        let dedup = Arc::new(DedupStore::open(config.dedup_dir(), &config.dedup)?);

        let target = if config.replication.enabled {
            config.replication_target().map(Path::to_path_buf)
        } else {
            None
        };
        let replication = Arc::new(ReplicationService::new(
            &backup_root,
            target,
            catalog.clone(),
            dedup.clone(),
        ));

        let last_timestamp = catalog
            .latest()
            .map(|r| r.timestamp)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        info!(
            root = %backup_root.display(),
            backups = catalog.len(),
            replication = replication.is_enabled(),
            "Backup engine ready"
        );

        Ok(Self {
            config,
            backup_root,
            catalog,
            dedup,
            validation: ValidationService::new(),
            replication,
            providers: RwLock::new(Vec::new()),
            op_lock: Mutex::new(()),
            last_timestamp: Mutex::new(last_timestamp),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn catalog(&self) -> &MetadataCatalog {
        &self.catalog
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub fn validation(&self) -> &ValidationService {
        &self.validation
    }

    pub fn replication(&self) -> &Arc<ReplicationService> {
        &self.replication
    }

    // --- providers ---

    /// Register a provider. A provider with the same id is replaced.
    pub fn register_provider(&self, provider: Arc<dyn ResourceProvider>) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = providers.iter_mut().find(|p| p.id() == provider.id()) {
            warn!(provider = %provider.id(), "Replacing registered provider");
            *existing = provider;
        } else {
            info!(provider = %provider.id(), name = %provider.display_name(), "Registered provider");
            providers.push(provider);
        }
    }

    pub fn unregister_provider(&self, provider_id: &str) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let before = providers.len();
        providers.retain(|p| p.id() != provider_id);
        before != providers.len()
    }

    /// Registered providers in registration order.
    pub fn providers(&self) -> Vec<Arc<dyn ResourceProvider>> {
        self.providers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_provider_enabled(&self, provider_id: &str) -> bool {
        self.config.is_provider_enabled(provider_id)
    }

    fn enabled_providers(&self) -> Vec<Arc<dyn ResourceProvider>> {
        self.providers()
            .into_iter()
            .filter(|p| self.is_provider_enabled(p.id()))
            .collect()
    }

    // --- locking and clocks ---

    fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wall clock, bumped so that every backup gets a distinct, increasing timestamp.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }

    // --- backup ---

    pub fn create_full_backup(&self, description: &str) -> Result<BackupRecord> {
        let _guard = self.lock_ops();
        self.create_full_locked(description)
    }

    /// Incremental against the latest backup of any type; a full backup when
    /// the catalog is empty.
    pub fn create_incremental_backup(&self, description: &str) -> Result<BackupRecord> {
        let _guard = self.lock_ops();
        self.create_incremental_locked(description)
    }

    fn create_full_locked(&self, description: &str) -> Result<BackupRecord> {
        let id = Uuid::new_v4().to_string();
        let timestamp = self.next_timestamp();
        let backup_dir = self.backup_root.join(&id);
        std::fs::create_dir_all(&backup_dir)?;

        info!(backup_id = %id, description = %description, "Starting full backup");

        let context = BackupContext {
            description: description.to_string(),
            timestamp,
        };
        let mut record = BackupRecord::full(id.clone(), timestamp, description);

        for provider in self.enabled_providers() {
            let provider_dir = backup_dir.join(provider.id());
            let ctx = ProviderContext::new(&id, BackupType::Full, &self.dedup);
            let outcome = provider.perform_backup(&ctx, &provider_dir, &context);
            self.collect_output(&mut record, provider.id(), &provider_dir, ctx.take_written(), outcome);
        }

        self.finalize(record)
    }

    fn create_incremental_locked(&self, description: &str) -> Result<BackupRecord> {
        let Some(parent) = self.catalog.latest() else {
            info!("No previous backup, creating full backup instead");
            return self.create_full_locked(description);
        };

        let id = Uuid::new_v4().to_string();
        let timestamp = self.next_timestamp();
        let backup_dir = self.backup_root.join(&id);
        std::fs::create_dir_all(&backup_dir)?;
        let parent_dir = self.backup_root.join(&parent.id);

        info!(backup_id = %id, parent_id = %parent.id, description = %description, "Starting incremental backup");

        let mut record = BackupRecord::incremental(id.clone(), parent.id.clone(), timestamp, description);

        for provider in self.enabled_providers() {
            let provider_dir = backup_dir.join(provider.id());
            let previous_dir = parent_dir.join(provider.id());
            let ctx = ProviderContext::new(&id, BackupType::Incremental, &self.dedup);
            let outcome = provider.perform_incremental_backup(&ctx, &provider_dir, &previous_dir);
            self.collect_output(&mut record, provider.id(), &provider_dir, ctx.take_written(), outcome);
        }

        self.finalize(record)
    }

    /// Record a provider's files and the pointers among them that went
    /// through the chunk store. Pointers the provider wrote but did not
    /// report are released.
    fn collect_output(
        &self,
        record: &mut BackupRecord,
        provider_id: &str,
        provider_dir: &Path,
        written: BTreeSet<String>,
        outcome: anyhow::Result<BTreeSet<String>>,
    ) {
        let files = match outcome {
            Ok(files) => files,
            Err(e) => return self.discard_provider_output(&record.id, provider_id, provider_dir, &written, e),
        };

        let (chunked, stray): (BTreeSet<String>, BTreeSet<String>) =
            written.into_iter().partition(|p| files.contains(p));
        if !stray.is_empty() {
            warn!(backup_id = %record.id, provider = %provider_id, pointers = stray.len(), "Provider did not report chunk pointers it wrote, releasing them");
            self.release_pointers(provider_dir, &stray);
            for pointer in &stray {
                let _ = std::fs::remove_file(provider_dir.join(pointer));
            }
        }
        if !chunked.is_empty() {
            record.chunked.insert(provider_id.to_string(), chunked);
        }
        record.files.insert(provider_id.to_string(), files);
    }

    /// Log a provider failure and drop whatever it left behind, including
    /// the chunk references its pointers took.
    fn discard_provider_output(
        &self,
        backup_id: &str,
        provider_id: &str,
        provider_dir: &Path,
        written: &BTreeSet<String>,
        err: anyhow::Error,
    ) {
        let err = EngineError::provider(provider_id, err);
        error!(backup_id = %backup_id, provider = %provider_id, error = %err, "Provider backup failed, omitting from manifest");

        self.release_pointers(provider_dir, written);
        if provider_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(provider_dir) {
                warn!(path = %provider_dir.display(), error = %e, "Failed to remove partial provider output");
            }
        }
    }

    /// Best-effort release of `pointers` under `provider_dir`.
    fn release_pointers(&self, provider_dir: &Path, pointers: &BTreeSet<String>) {
        let manifests: Vec<ChunkManifest> = pointers
            .iter()
            .filter_map(|pointer| {
                let path = provider_dir.join(pointer);
                ChunkManifest::read_from(&path)
                    .map_err(|e| warn!(path = %path.display(), error = %e, "Unreadable chunk pointer, references leaked"))
                    .ok()
            })
            .collect();
        if let Err(e) = self.dedup.remove_files(&manifests) {
            warn!(path = %provider_dir.display(), error = %e, "Failed to release chunks");
        }
    }

    /// Persist, validate, replicate, then apply retention.
    fn finalize(&self, record: BackupRecord) -> Result<BackupRecord> {
        if record.files.is_empty() {
            warn!(backup_id = %record.id, "Backup captured no providers");
        }
        self.catalog.save(record.clone())?;

        let record = match self.validation.validate_backup(&record, &self.backup_root, &self.catalog, &self.dedup) {
            Ok(validated) => validated,
            Err(e) => {
                error!(backup_id = %record.id, error = %e, "Validation of new backup failed");
                record
            }
        };

        if self.replication.is_enabled() {
            self.replication.spawn_replication(record.clone());
        }

        if let Err(e) = self.cleanup_locked() {
            error!(error = %e, "Retention cleanup failed");
        }

        info!(
            backup_id = %record.id,
            backup_type = %record.backup_type,
            files = record.file_count(),
            valid = record.valid,
            "Backup completed"
        );
        Ok(record)
    }

    // --- restore ---

    pub fn restore_backup(&self, backup_id: &str) -> Result<RestoreSummary> {
        let _guard = self.lock_ops();
        self.restore_locked(backup_id)
    }

    /// Restore the latest backup taken at or before `instant` (the earliest
    /// backup when all are newer).
    pub fn restore_to_point_in_time(&self, instant: DateTime<Utc>) -> Result<RestoreSummary> {
        let _guard = self.lock_ops();
        let target = self.catalog.closest_to(instant).ok_or(EngineError::NoBackups)?;
        info!(backup_id = %target.id, requested = %instant, actual = %target.timestamp, "Point-in-time restore");
        self.restore_locked(&target.id)
    }

    fn restore_locked(&self, backup_id: &str) -> Result<RestoreSummary> {
        let target = self.get_backup(backup_id)?;
        let target = self.ensure_valid(target)?;
        let chain = self.resolve_with(target, ChainMode::Strict)?;

        info!(backup_id = %backup_id, links = chain.len(), "Restoring backup chain");

        let mut providers_restored = Vec::new();
        for provider in self.enabled_providers() {
            if self.apply_chain(provider.as_ref(), &chain)? {
                providers_restored.push(provider.id().to_string());
            }
        }

        info!(backup_id = %backup_id, providers = providers_restored.len(), "Restore completed");
        Ok(RestoreSummary {
            target: backup_id.to_string(),
            chain: chain.iter().map(|r| r.id.clone()).collect(),
            providers_restored,
            truncated: false,
        })
    }

    /// Restore only `provider_ids`, using whatever part of the chain resolves.
    /// Every named provider that is registered is attempted, enabled or not;
    /// failures are reported together.
    pub fn restore_components(&self, backup_id: &str, provider_ids: &[String]) -> Result<RestoreSummary> {
        let _guard = self.lock_ops();
        let target = self.get_backup(backup_id)?;
        let chain = self.resolve_with(target, ChainMode::Lenient)?;
        let truncated = chain.first().map_or(true, |r| !r.is_full());

        let registered = self.providers();
        let mut providers_restored = Vec::new();
        let mut failed = Vec::new();

        for provider_id in provider_ids {
            let Some(provider) = registered.iter().find(|p| p.id() == provider_id) else {
                warn!(provider = %provider_id, "Unknown provider, skipping");
                continue;
            };
            match self.apply_chain(provider.as_ref(), &chain) {
                Ok(true) => providers_restored.push(provider_id.clone()),
                Ok(false) => {}
                Err(_) => failed.push(provider_id.clone()),
            }
        }

        if !failed.is_empty() {
            return Err(EngineError::PartialRestore {
                backup_id: backup_id.to_string(),
                failed,
            });
        }

        info!(backup_id = %backup_id, providers = ?providers_restored, truncated, "Component restore completed");
        Ok(RestoreSummary {
            target: backup_id.to_string(),
            chain: chain.iter().map(|r| r.id.clone()).collect(),
            providers_restored,
            truncated,
        })
    }

    /// Apply each link's files for `provider`, oldest first. Returns whether
    /// any link had files for it.
    fn apply_chain(&self, provider: &dyn ResourceProvider, chain: &[BackupRecord]) -> Result<bool> {
        let mut applied = false;
        for link in chain {
            let Some(files) = link.files_for(provider.id()) else {
                continue;
            };
            let dir = self.backup_root.join(&link.id).join(provider.id());
            let ctx = ProviderContext::new(&link.id, link.backup_type, &self.dedup)
                .with_pointers(link.chunked.get(provider.id()));
            if let Err(e) = provider.perform_restore(&ctx, &dir, files) {
                let err = EngineError::provider(provider.id(), e);
                error!(backup_id = %link.id, provider = %provider.id(), error = %err, "Provider restore failed");
                return Err(err);
            }
            applied = true;
        }
        Ok(applied)
    }

    /// Re-validate a target that is not known good; refuse an invalid one.
    fn ensure_valid(&self, record: BackupRecord) -> Result<BackupRecord> {
        let record = if record.validated && record.valid {
            record
        } else {
            self.validation.validate_backup(&record, &self.backup_root, &self.catalog, &self.dedup)?
        };
        if !record.valid {
            return Err(EngineError::ValidationFailure {
                backup_id: record.id.clone(),
                message: record.validation_message.clone().unwrap_or_default(),
            });
        }
        Ok(record)
    }

    // --- catalog queries ---

    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.catalog.list()
    }

    pub fn get_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        self.catalog
            .get(backup_id)
            .ok_or_else(|| EngineError::BackupNotFound(backup_id.to_string()))
    }

    /// Strict chain ending at `backup_id`, oldest first.
    pub fn resolve_chain(&self, backup_id: &str) -> Result<Vec<BackupRecord>> {
        let target = self.get_backup(backup_id)?;
        self.resolve_with(target, ChainMode::Strict)
    }

    fn resolve_with(&self, target: BackupRecord, mode: ChainMode) -> Result<Vec<BackupRecord>> {
        chain::resolve_chain(target, |id| self.catalog.get(id), mode)
    }

    // --- retention and deletion ---

    /// Apply retention. Returns the ids deleted, oldest first.
    pub fn cleanup_old_backups(&self) -> Result<Vec<String>> {
        let _guard = self.lock_ops();
        self.cleanup_locked()
    }

    fn cleanup_locked(&self) -> Result<Vec<String>> {
        let plan = plan_retention(
            &self.catalog.list(),
            self.config.retention.full,
            self.config.retention.incremental,
        );
        let overflow = pinned_incrementals(&plan, self.config.retention.incremental);
        if overflow > 0 {
            warn!(
                overflow,
                limit = self.config.retention.incremental,
                "Keeping extra incremental backups that newer backups depend on"
            );
        }

        let mut deleted = Vec::new();
        for entry in plan.iter().filter(|e| e.is_pruned()) {
            match self.delete_locked(&entry.backup_id) {
                Ok(_) => deleted.push(entry.backup_id.clone()),
                Err(e) => warn!(backup_id = %entry.backup_id, error = %e, "Failed to delete expired backup"),
            }
        }

        if !deleted.is_empty() {
            info!(deleted = deleted.len(), "Retention cleanup removed backups");
        }
        Ok(deleted)
    }

    /// Delete one backup: chunk references, directory, record and memo entries.
    pub fn delete_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let _guard = self.lock_ops();
        let dependents: Vec<String> = self
            .catalog
            .list()
            .into_iter()
            .filter(|r| r.parent_id.as_deref() == Some(backup_id))
            .map(|r| r.id)
            .collect();
        if !dependents.is_empty() {
            warn!(backup_id = %backup_id, dependents = ?dependents, "Deleting a backup other backups depend on");
        }
        self.delete_locked(backup_id)
    }

    /// Release every chunk reference in one step, then drop the record and
    /// the directory. A failed release leaves the backup untouched so the
    /// delete can be retried.
    fn delete_locked(&self, backup_id: &str) -> Result<BackupRecord> {
        let record = self.get_backup(backup_id)?;
        let backup_dir = self.backup_root.join(backup_id);

        let mut manifests = Vec::new();
        for (provider, pointer) in record.chunk_pointers() {
            let path = backup_dir.join(provider).join(pointer);
            match ChunkManifest::read_from(&path) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "Unreadable chunk pointer, references leaked"),
            }
        }
        let released = self.dedup.remove_files(&manifests)?;

        self.catalog.delete(backup_id)?;
        self.validation.evict(backup_id, &self.backup_root);
        match std::fs::remove_dir_all(&backup_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %backup_dir.display(), error = %e, "Failed to remove backup directory"),
        }

        info!(backup_id = %backup_id, backup_type = %record.backup_type, chunks_freed = released, "Deleted backup");
        Ok(record)
    }

    // --- validation and replication ---

    /// Validate every record not yet validated.
    pub fn validate_backups(&self) -> Result<Vec<ValidationOutcome>> {
        let _guard = self.lock_ops();
        self.validate_pending_locked()
    }

    fn validate_pending_locked(&self) -> Result<Vec<ValidationOutcome>> {
        let mut outcomes = Vec::new();
        for record in self.catalog.list().into_iter().filter(|r| !r.validated) {
            match self.validation.validate_backup(&record, &self.backup_root, &self.catalog, &self.dedup) {
                Ok(updated) => outcomes.push(ValidationOutcome {
                    backup_id: updated.id,
                    valid: updated.valid,
                    message: updated.validation_message.unwrap_or_default(),
                }),
                Err(e) => error!(backup_id = %record.id, error = %e, "Validation failed to run"),
            }
        }
        Ok(outcomes)
    }

    /// Re-validate one backup regardless of its current state.
    pub fn validate_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let _guard = self.lock_ops();
        let record = self.get_backup(backup_id)?;
        self.validation.validate_backup(&record, &self.backup_root, &self.catalog, &self.dedup)
    }

    pub fn replicate_pending(&self) -> Result<usize> {
        let _guard = self.lock_ops();
        self.replication.check_pending_replications()
    }

    pub fn import_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let _guard = self.lock_ops();
        self.replication.import_backup(backup_id)
    }

    // --- scheduled entry point ---

    /// Run a scheduled trigger. Skipped (not queued) while another operation
    /// holds the engine.
    pub fn run_trigger(&self, trigger: Trigger) -> Result<()> {
        let _guard = match self.op_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!(trigger = %trigger, "Skipping scheduled run: another operation is running");
                return Ok(());
            }
        };

        info!(trigger = %trigger, "Running scheduled trigger");
        match trigger {
            Trigger::FullBackup => self.create_full_locked("Scheduled full backup").map(|_| ()),
            Trigger::IncrementalBackup => self
                .create_incremental_locked("Scheduled incremental backup")
                .map(|_| ()),
            Trigger::Validation => self.validate_pending_locked().map(|outcomes| {
                let invalid = outcomes.iter().filter(|o| !o.valid).count();
                info!(checked = outcomes.len(), invalid, "Validation sweep finished");
            }),
            Trigger::Replication => {
                if !self.replication.is_enabled() {
                    return Ok(());
                }
                self.replication.check_pending_replications().map(|count| {
                    info!(replicated = count, "Replication sweep finished");
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DirectoryProvider;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    /// Writes fixed files on capture and records every restore call.
    struct ScriptedProvider {
        id: String,
        files: BTreeMap<String, Vec<u8>>,
        fail_backup: bool,
        fail_restore: bool,
        restores: Mutex<Vec<(String, BTreeSet<String>)>>,
    }

    impl ScriptedProvider {
        fn new(id: &str, files: &[(&str, &[u8])]) -> Self {
            Self {
                id: id.to_string(),
                files: files.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect(),
                fail_backup: false,
                fail_restore: false,
                restores: Mutex::new(Vec::new()),
            }
        }

        fn failing_backup(id: &str) -> Self {
            Self {
                fail_backup: true,
                ..Self::new(id, &[])
            }
        }

        fn failing_restore(id: &str, files: &[(&str, &[u8])]) -> Self {
            Self {
                fail_restore: true,
                ..Self::new(id, files)
            }
        }

        fn restored_links(&self) -> Vec<String> {
            self.restores.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }

        fn write_all(&self, dir: &Path) -> anyhow::Result<BTreeSet<String>> {
            if self.fail_backup {
                std::fs::create_dir_all(dir)?;
                std::fs::write(dir.join("partial"), b"x")?;
                anyhow::bail!("capture exploded");
            }
            std::fs::create_dir_all(dir)?;
            for (name, body) in &self.files {
                std::fs::write(dir.join(name), body)?;
            }
            Ok(self.files.keys().cloned().collect())
        }
    }

    impl ResourceProvider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn perform_backup(&self, _ctx: &ProviderContext<'_>, dir: &Path, _context: &BackupContext) -> anyhow::Result<BTreeSet<String>> {
            self.write_all(dir)
        }

        fn perform_incremental_backup(&self, _ctx: &ProviderContext<'_>, dir: &Path, _previous: &Path) -> anyhow::Result<BTreeSet<String>> {
            self.write_all(dir)
        }

        fn perform_restore(&self, ctx: &ProviderContext<'_>, _dir: &Path, files: &BTreeSet<String>) -> anyhow::Result<()> {
            if self.fail_restore {
                anyhow::bail!("restore exploded");
            }
            self.restores
                .lock()
                .unwrap()
                .push((ctx.backup_id().to_string(), files.clone()));
            Ok(())
        }
    }

    fn engine(dir: &TempDir) -> BackupEngine {
        BackupEngine::open(EngineConfig::with_root(dir.path().join("backups"))).unwrap()
    }

    fn engine_with(dir: &TempDir, f: impl FnOnce(&mut EngineConfig)) -> BackupEngine {
        let mut config = EngineConfig::with_root(dir.path().join("backups"));
        f(&mut config);
        BackupEngine::open(config).unwrap()
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_full_backup_manifest_validates() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a.yml", b"a: 1")])));

        let record = engine.create_full_backup("d1")?;
        assert_eq!(record.backup_type, BackupType::Full);
        assert_eq!(record.files, BTreeMap::from([("cfg".to_string(), set(&["a.yml"]))]));
        assert!(record.validated && record.valid);

        let validated = engine.validate_backup(&record.id)?;
        assert!(validated.valid);
        Ok(())
    }

    #[test]
    fn test_unchanged_incremental_has_empty_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("config");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("a.yml"), b"a: 1")?;

        let engine = engine(&dir);
        engine.register_provider(Arc::new(DirectoryProvider::new("cfg", &source)));

        let full = engine.create_full_backup("base")?;
        let incr = engine.create_incremental_backup("nothing changed")?;

        assert_eq!(incr.parent_id.as_deref(), Some(full.id.as_str()));
        assert_eq!(incr.files.get("cfg"), Some(&BTreeSet::new()));
        let chain: Vec<_> = engine.resolve_chain(&incr.id)?.into_iter().map(|r| r.id).collect();
        assert_eq!(chain, vec![full.id, incr.id]);
        Ok(())
    }

    #[test]
    fn test_incremental_without_history_is_full() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a.yml", b"a")])));

        let record = engine.create_incremental_backup("first")?;
        assert!(record.is_full());
        assert!(record.parent_id.is_none());
        Ok(())
    }

    #[test]
    fn test_corruption_detected_by_validation() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a.yml", b"original")])));

        let record = engine.create_full_backup("d1")?;
        std::fs::write(engine.backup_root().join(&record.id).join("cfg/a.yml"), b"flipped bits!")?;

        let revalidated = engine.validate_backup(&record.id)?;
        assert!(!revalidated.valid);
        let message = revalidated.validation_message.unwrap();
        assert!(message.contains("cfg") && message.contains("a.yml"));

        let err = engine.restore_backup(&record.id).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationFailure);
        Ok(())
    }

    #[test]
    fn test_identical_large_files_dedup() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("world");
        std::fs::create_dir_all(&source)?;
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let body: Vec<u8> = (0..2 * 1024 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect();
        std::fs::write(source.join("one.dat"), &body)?;
        std::fs::write(source.join("two.dat"), &body)?;

        let engine = engine(&dir);
        engine.register_provider(Arc::new(DirectoryProvider::new("world", &source).chunked(true)));

        let record = engine.create_full_backup("dedup")?;
        assert_eq!(record.files["world"], set(&["one.dat.chunks", "two.dat.chunks"]));
        assert!(engine.dedup().unique_chunks()? <= 2);

        std::fs::remove_dir_all(&source)?;
        engine.restore_backup(&record.id)?;
        assert_eq!(std::fs::read(source.join("two.dat"))?, body);
        Ok(())
    }

    #[test]
    fn test_chain_restore_applies_oldest_first() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("config");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("a.yml"), b"v1")?;
        std::fs::write(source.join("b.yml"), b"stable")?;

        let engine = engine(&dir);
        engine.register_provider(Arc::new(DirectoryProvider::new("cfg", &source)));

        engine.create_full_backup("base")?;
        std::fs::write(source.join("a.yml"), b"version 2")?;
        let second = engine.create_incremental_backup("a changed")?;
        std::fs::write(source.join("a.yml"), b"three, much longer")?;
        engine.create_incremental_backup("a changed again")?;

        std::fs::remove_dir_all(&source)?;
        let summary = engine.restore_backup(&second.id)?;
        assert_eq!(summary.chain.len(), 2);
        assert_eq!(summary.providers_restored, vec!["cfg"]);
        assert_eq!(std::fs::read(source.join("a.yml"))?, b"version 2");
        assert_eq!(std::fs::read(source.join("b.yml"))?, b"stable");
        Ok(())
    }

    #[test]
    fn test_provider_failure_is_omitted_from_backup() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::failing_backup("db")));
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a.yml", b"a")])));

        let record = engine.create_full_backup("partial")?;
        assert_eq!(record.files.keys().collect::<Vec<_>>(), vec!["cfg"]);
        assert!(record.valid);
        assert!(!engine.backup_root().join(&record.id).join("db").exists());
        Ok(())
    }

    #[test]
    fn test_disabled_provider_is_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine_with(&dir, |c| {
            c.providers.insert("world".into(), false);
        });
        engine.register_provider(Arc::new(ScriptedProvider::new("world", &[("w", b"w")])));
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("c", b"c")])));

        let record = engine.create_full_backup("d")?;
        assert!(!record.files.contains_key("world"));
        assert!(record.files.contains_key("cfg"));
        Ok(())
    }

    #[test]
    fn test_restore_replays_each_link_per_provider() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        let provider = Arc::new(ScriptedProvider::new("cfg", &[("a.yml", b"a")]));
        engine.register_provider(provider.clone());

        let full = engine.create_full_backup("f")?;
        let i1 = engine.create_incremental_backup("i1")?;
        let i2 = engine.create_incremental_backup("i2")?;

        let summary = engine.restore_backup(&i2.id)?;
        assert_eq!(summary.chain, vec![full.id.clone(), i1.id.clone(), i2.id.clone()]);
        assert_eq!(provider.restored_links(), vec![full.id, i1.id, i2.id]);
        Ok(())
    }

    #[test]
    fn test_restore_failure_aborts() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::failing_restore("db", &[("d", b"d")])));
        let cfg = Arc::new(ScriptedProvider::new("cfg", &[("c", b"c")]));
        engine.register_provider(cfg.clone());

        let record = engine.create_full_backup("f")?;
        let err = engine.restore_backup(&record.id).unwrap_err();
        assert!(matches!(err, EngineError::ProviderFailure { ref provider, .. } if provider == "db"));
        assert!(cfg.restored_links().is_empty());
        Ok(())
    }

    #[test]
    fn test_restore_components_attempts_every_named_provider() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::failing_restore("db", &[("d", b"d")])));
        let cfg = Arc::new(ScriptedProvider::new("cfg", &[("c", b"c")]));
        engine.register_provider(cfg.clone());

        let record = engine.create_full_backup("f")?;
        let names = vec!["db".to_string(), "ghost".to_string(), "cfg".to_string()];
        let err = engine.restore_components(&record.id, &names).unwrap_err();
        assert!(matches!(err, EngineError::PartialRestore { ref failed, .. } if failed == &vec!["db".to_string()]));
        assert_eq!(cfg.restored_links(), vec![record.id.clone()]);

        let summary = engine.restore_components(&record.id, &["cfg".to_string()])?;
        assert_eq!(summary.providers_restored, vec!["cfg"]);
        assert!(!summary.truncated);
        Ok(())
    }

    #[test]
    fn test_restore_components_tolerates_broken_chain() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        let cfg = Arc::new(ScriptedProvider::new("cfg", &[("c", b"c")]));
        engine.register_provider(cfg.clone());

        let full = engine.create_full_backup("f")?;
        let incr = engine.create_incremental_backup("i")?;

        // Simulate a lost parent
        engine.catalog().delete(&full.id)?;

        assert_eq!(
            engine.restore_backup(&incr.id).unwrap_err().kind(),
            crate::ErrorKind::MissingParent
        );
        let summary = engine.restore_components(&incr.id, &["cfg".to_string()])?;
        assert!(summary.truncated);
        assert_eq!(summary.chain, vec![incr.id.clone()]);
        assert_eq!(cfg.restored_links(), vec![incr.id]);
        Ok(())
    }

    #[test]
    fn test_point_in_time_picks_latest_not_after() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        let provider = Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")]));
        engine.register_provider(provider.clone());

        let first = engine.create_full_backup("1")?;
        let second = engine.create_full_backup("2")?;

        let summary = engine.restore_to_point_in_time(second.timestamp - Duration::microseconds(1))?;
        assert_eq!(summary.target, first.id);

        let summary = engine.restore_to_point_in_time(first.timestamp - Duration::days(1))?;
        assert_eq!(summary.target, first.id);

        let summary = engine.restore_to_point_in_time(Utc::now() + Duration::days(1))?;
        assert_eq!(summary.target, second.id);
        Ok(())
    }

    #[test]
    fn test_point_in_time_without_backups() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let err = engine.restore_to_point_in_time(Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::NoBackups));
    }

    #[test]
    fn test_retention_removes_oldest_and_keeps_floor() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine_with(&dir, |c| c.retention.full = 2);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));

        let b1 = engine.create_full_backup("1")?;
        let b2 = engine.create_full_backup("2")?;
        let b3 = engine.create_full_backup("3")?;

        let ids: Vec<_> = engine.list_backups().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b2.id.clone(), b3.id.clone()]);
        assert!(!engine.backup_root().join(&b1.id).exists());
        assert!(engine.cleanup_old_backups()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_retention_pins_parents_of_kept_incrementals() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine_with(&dir, |c| {
            c.retention.full = 1;
            c.retention.incremental = 1;
        });
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));

        let full = engine.create_full_backup("f")?;
        let incr = engine.create_incremental_backup("i")?;

        assert!(engine.get_backup(&full.id).is_ok());
        assert_eq!(engine.resolve_chain(&incr.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_delete_releases_chunks() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("world");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("region.dat"), vec![7u8; 300_000])?;

        let engine = engine_with(&dir, |c| c.dedup.chunk_size = 100_000);
        engine.register_provider(Arc::new(DirectoryProvider::new("world", &source).chunked(true)));

        let a = engine.create_full_backup("a")?;
        let b = engine.create_full_backup("b")?;
        let digest = ChunkManifest::read_from(
            &engine.backup_root().join(&a.id).join("world/region.dat.chunks"),
        )?
        .chunks[0]
            .digest
            .clone();
        assert_eq!(engine.dedup().ref_count(&digest), 6);

        engine.delete_backup(&a.id)?;
        assert_eq!(engine.dedup().ref_count(&digest), 3);
        assert!(engine.get_backup(&a.id).is_err());

        engine.delete_backup(&b.id)?;
        assert_eq!(engine.dedup().unique_chunks()?, 0);
        Ok(())
    }

    #[test]
    fn test_deleting_plain_copy_of_pointer_keeps_chunks() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("world");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("region.dat"), vec![7u8; 300_000])?;

        let engine = engine_with(&dir, |c| c.dedup.chunk_size = 100_000);
        engine.register_provider(Arc::new(DirectoryProvider::new("world", &source).chunked(true)));
        let chunked = engine.create_full_backup("chunked")?;
        assert_eq!(chunked.chunked["world"], set(&["region.dat.chunks"]));

        // A provider that happens to store a byte-for-byte copy of the pointer
        let pointer_path = engine.backup_root().join(&chunked.id).join("world/region.dat.chunks");
        let pointer_bytes = std::fs::read(&pointer_path)?;
        let digest = ChunkManifest::read_from(&pointer_path)?.chunks[0].digest.clone();
        engine.unregister_provider("world");
        engine.register_provider(Arc::new(ScriptedProvider::new("notes", &[("region.dat.chunks", &pointer_bytes)])));
        let plain = engine.create_full_backup("plain")?;
        assert!(plain.chunked.is_empty());
        assert!(plain.valid);

        engine.delete_backup(&plain.id)?;
        assert_eq!(engine.dedup().ref_count(&digest), 3);

        engine.unregister_provider("notes");
        engine.register_provider(Arc::new(DirectoryProvider::new("world", &source).chunked(true)));
        std::fs::remove_dir_all(&source)?;
        engine.restore_backup(&chunked.id)?;
        assert_eq!(std::fs::read(source.join("region.dat"))?, vec![7u8; 300_000]);
        Ok(())
    }

    /// Chunks one file, then either fails or leaves the pointer unreported.
    struct ChunkThenBail {
        source: PathBuf,
        fail: bool,
    }

    impl ResourceProvider for ChunkThenBail {
        fn id(&self) -> &str {
            "bulk"
        }

        fn perform_backup(&self, ctx: &ProviderContext<'_>, dir: &Path, _context: &BackupContext) -> anyhow::Result<BTreeSet<String>> {
            std::fs::create_dir_all(dir)?;
            ctx.store_chunked(&self.source, dir, "blob.bin")?;
            if self.fail {
                anyhow::bail!("capture exploded after chunking");
            }
            Ok(BTreeSet::new())
        }

        fn perform_incremental_backup(&self, ctx: &ProviderContext<'_>, dir: &Path, _previous: &Path) -> anyhow::Result<BTreeSet<String>> {
            let context = BackupContext {
                description: String::new(),
                timestamp: Utc::now(),
            };
            self.perform_backup(ctx, dir, &context)
        }

        fn perform_restore(&self, _ctx: &ProviderContext<'_>, _dir: &Path, _files: &BTreeSet<String>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_pointers_of_failed_or_silent_providers_are_released() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("blob.bin");
        std::fs::write(&source, vec![5u8; 300_000])?;

        for fail in [true, false] {
            let root = TempDir::new()?;
            let engine = engine_with(&root, |c| c.dedup.chunk_size = 100_000);
            engine.register_provider(Arc::new(ChunkThenBail {
                source: source.clone(),
                fail,
            }));

            let record = engine.create_full_backup("bulk")?;
            assert!(record.chunked.is_empty());
            assert_eq!(engine.dedup().unique_chunks()?, 0);
            assert!(!engine.backup_root().join(&record.id).join("bulk/blob.bin.chunks").exists());
        }
        Ok(())
    }

    /// Two chunked backups of two files with distinct contents.
    fn two_chunked_backups(dir: &TempDir) -> Result<(BackupEngine, BackupRecord, BackupRecord, String, String)> {
        let source = dir.path().join("world");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("region.dat"), vec![7u8; 300_000])?;
        std::fs::write(source.join("other.dat"), vec![9u8; 300_000])?;

        let engine = engine_with(dir, |c| c.dedup.chunk_size = 100_000);
        engine.register_provider(Arc::new(DirectoryProvider::new("world", &source).chunked(true)));
        let a = engine.create_full_backup("a")?;
        let b = engine.create_full_backup("b")?;

        let first_digest = |name: &str| -> Result<String> {
            let path = engine.backup_root().join(&a.id).join("world").join(name);
            Ok(ChunkManifest::read_from(&path)?.chunks[0].digest.clone())
        };
        let region = first_digest("region.dat.chunks")?;
        let other = first_digest("other.dat.chunks")?;
        Ok((engine, a, b, region, other))
    }

    #[test]
    fn test_delete_with_unreadable_pointer_releases_the_rest() -> Result<()> {
        let dir = TempDir::new()?;
        let (engine, a, _b, region, other) = two_chunked_backups(&dir)?;
        assert_eq!(engine.dedup().ref_count(&region), 6);
        assert_eq!(engine.dedup().ref_count(&other), 6);

        std::fs::write(engine.backup_root().join(&a.id).join("world/other.dat.chunks"), b"garbage")?;
        engine.delete_backup(&a.id)?;

        assert!(engine.get_backup(&a.id).is_err());
        assert!(!engine.backup_root().join(&a.id).exists());
        assert_eq!(engine.dedup().ref_count(&region), 3);
        assert_eq!(engine.dedup().ref_count(&other), 6);
        Ok(())
    }

    #[test]
    fn test_delete_is_retryable_after_index_write_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let (engine, a, _b, region, other) = two_chunked_backups(&dir)?;

        let index = engine.dedup().root().join("refcount.index");
        std::fs::remove_file(&index)?;
        std::fs::create_dir_all(index.join("blocker"))?;

        assert!(engine.delete_backup(&a.id).is_err());
        assert!(engine.get_backup(&a.id).is_ok());
        assert!(engine.backup_root().join(&a.id).join("world/region.dat.chunks").exists());
        assert_eq!(engine.dedup().ref_count(&region), 6);
        assert_eq!(engine.dedup().ref_count(&other), 6);

        std::fs::remove_dir_all(&index)?;
        engine.delete_backup(&a.id)?;
        assert!(engine.get_backup(&a.id).is_err());
        assert_eq!(engine.dedup().ref_count(&region), 3);
        assert_eq!(engine.dedup().ref_count(&other), 3);
        Ok(())
    }

    #[test]
    fn test_restore_components_includes_disabled_providers() -> Result<()> {
        let dir = TempDir::new()?;
        let record = {
            let engine = engine(&dir);
            engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));
            engine.create_full_backup("while enabled")?
        };

        let engine = engine_with(&dir, |c| {
            c.providers.insert("cfg".into(), false);
        });
        let cfg = Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")]));
        engine.register_provider(cfg.clone());

        let summary = engine.restore_components(&record.id, &["cfg".to_string()])?;
        assert_eq!(summary.providers_restored, vec!["cfg"]);
        assert_eq!(cfg.restored_links(), vec![record.id.clone()]);

        let summary = engine.restore_backup(&record.id)?;
        assert!(summary.providers_restored.is_empty());
        Ok(())
    }

    #[test]
    fn test_validate_backups_only_touches_unvalidated() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));
        engine.create_full_backup("validated at creation")?;

        let mut pending = BackupRecord::full("manual", Utc::now(), "imported by hand");
        pending.files.insert("cfg".into(), set(&["a"]));
        engine.catalog().save(pending)?;

        let outcomes = engine.validate_backups()?;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].backup_id, "manual");
        assert!(!outcomes[0].valid);
        assert!(engine.validate_backups()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_scheduled_trigger_skips_while_busy() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));

        {
            let _busy = engine.lock_ops();
            engine.run_trigger(Trigger::FullBackup)?;
        }
        assert!(engine.list_backups().is_empty());

        engine.run_trigger(Trigger::FullBackup)?;
        engine.run_trigger(Trigger::IncrementalBackup)?;
        engine.run_trigger(Trigger::Validation)?;
        engine.run_trigger(Trigger::Replication)?;
        let types: Vec<_> = engine.list_backups().into_iter().map(|r| r.backup_type).collect();
        assert_eq!(types, vec![BackupType::Full, BackupType::Incremental]);
        Ok(())
    }

    #[test]
    fn test_replication_after_backup() -> Result<()> {
        let dir = TempDir::new()?;
        let remote = dir.path().join("remote");
        let engine = engine_with(&dir, |c| {
            c.replication.enabled = true;
            c.replication.target = Some(remote.clone());
        });
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));

        let record = engine.create_full_backup("offsite")?;
        for _ in 0..200 {
            if engine.get_backup(&record.id)?.replicated {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(engine.get_backup(&record.id)?.replicated);
        assert!(engine.replication().is_replicated(&record.id));
        assert!(remote.join(&record.id).join("cfg/a").exists());
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_timestamps_increasing() -> Result<()> {
        let dir = TempDir::new()?;
        let first = {
            let engine = engine(&dir);
            engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));
            engine.create_full_backup("before restart")?
        };

        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("cfg", &[("a", b"a")])));
        let second = engine.create_incremental_backup("after restart")?;
        assert!(second.timestamp > first.timestamp);
        assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));
        Ok(())
    }

    #[test]
    fn test_provider_registration() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.register_provider(Arc::new(ScriptedProvider::new("a", &[])));
        engine.register_provider(Arc::new(ScriptedProvider::new("b", &[])));
        engine.register_provider(Arc::new(ScriptedProvider::new("a", &[])));

        let ids: Vec<_> = engine.providers().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(engine.unregister_provider("a"));
        assert!(!engine.unregister_provider("a"));
        assert_eq!(engine.providers().len(), 1);
    }
}
