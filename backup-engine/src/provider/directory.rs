//! Provider that captures a live directory tree.
//!
//! Each capture writes an inventory (`.backup-manifest.json`) of every source
//! file's size and mtime. An incremental capture diffs the live tree against
//! the previous capture's inventory and copies only new or modified files.

use super::{BackupContext, ProviderContext, ResourceProvider};
use crate::dedup::manifest::file_path_for_pointer;
use crate::fs::{walk_directory, FileInfo, FileStamp, WalkOptions};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const INVENTORY_FILE: &str = ".backup-manifest.json";

/// Size and mtime of every source file at capture time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub version: u32,
    pub backup_id: String,
    pub files: BTreeMap<String, FileStamp>,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl Inventory {
    fn from_files(backup_id: &str, files: &[FileInfo]) -> Self {
        let entries: BTreeMap<String, FileStamp> = files
            .iter()
            .map(|f| (f.relative_path.clone(), f.stamp))
            .collect();
        Self {
            version: 1,
            backup_id: backup_id.to_string(),
            total_files: entries.len(),
            total_bytes: entries.values().map(|s| s.size).sum(),
            files: entries,
        }
    }

    fn load(capture_dir: &Path) -> Option<Self> {
        let path = capture_dir.join(INVENTORY_FILE);
        let content = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(inventory) => Some(inventory),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse inventory");
                None
            }
        }
    }

    fn store(&self, capture_dir: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        crate::fs::write_atomic(&capture_dir.join(INVENTORY_FILE), &json)?;
        Ok(())
    }
}

/// Result of diffing the live tree against an inventory
struct DiffResult {
    /// New or modified files
    changed_files: Vec<FileInfo>,
    unchanged_count: usize,
    /// In the inventory but no longer on disk
    deleted_count: usize,
}

/// Size + mtime change detection (same heuristic as rsync's default).
fn diff_against_inventory(all_files: &[FileInfo], inventory: &Inventory) -> DiffResult {
    let mut changed_files = Vec::new();
    let mut unchanged_count = 0;
    let mut seen_paths = HashSet::new();

    for file in all_files {
        seen_paths.insert(file.relative_path.as_str());
        match inventory.files.get(&file.relative_path) {
            Some(stamp) if *stamp == file.stamp => unchanged_count += 1,
            _ => changed_files.push(file.clone()),
        }
    }

    let deleted_count = inventory
        .files
        .keys()
        .filter(|k| !seen_paths.contains(k.as_str()))
        .count();

    DiffResult {
        changed_files,
        unchanged_count,
        deleted_count,
    }
}

pub struct DirectoryProvider {
    id: String,
    display_name: String,
    source_root: PathBuf,
    chunked: bool,
    walk_options: WalkOptions,
}

impl DirectoryProvider {
    pub fn new(id: impl Into<String>, source_root: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            source_root: source_root.into(),
            chunked: false,
            walk_options: WalkOptions::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Store file bodies in the dedup store instead of copying them.
    pub fn chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.walk_options
            .exclude_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    fn scan(&self) -> anyhow::Result<Vec<FileInfo>> {
        walk_directory(&self.source_root, &self.walk_options)
            .with_context(|| format!("failed to scan {}", self.source_root.display()))
    }

    /// Capture `files` into `backup_dir`, returning manifest paths.
    fn capture(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        files: &[FileInfo],
    ) -> anyhow::Result<BTreeSet<String>> {
        std::fs::create_dir_all(backup_dir)?;
        let mut written = BTreeSet::new();

        for file in files {
            if self.chunked {
                let pointer = ctx
                    .store_chunked(&file.path, backup_dir, &file.relative_path)
                    .with_context(|| format!("failed to chunk {}", file.relative_path))?;
                written.insert(pointer);
            } else {
                let target = backup_dir.join(&file.relative_path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&file.path, &target)
                    .with_context(|| format!("failed to copy {}", file.relative_path))?;
                written.insert(file.relative_path.clone());
            }
        }

        Ok(written)
    }
}

impl ResourceProvider for DirectoryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn perform_backup(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        context: &BackupContext,
    ) -> anyhow::Result<BTreeSet<String>> {
        let files = self.scan()?;
        let written = self.capture(ctx, backup_dir, &files)?;
        Inventory::from_files(ctx.backup_id(), &files).store(backup_dir)?;

        info!(
            provider = %self.id,
            backup_id = %ctx.backup_id(),
            description = %context.description,
            files = written.len(),
            "Directory captured"
        );
        Ok(written)
    }

    fn perform_incremental_backup(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        previous_backup_dir: &Path,
    ) -> anyhow::Result<BTreeSet<String>> {
        let files = self.scan()?;

        let Some(previous) = Inventory::load(previous_backup_dir) else {
            info!(
                provider = %self.id,
                previous = %previous_backup_dir.display(),
                "No previous inventory, capturing everything"
            );
            let written = self.capture(ctx, backup_dir, &files)?;
            Inventory::from_files(ctx.backup_id(), &files).store(backup_dir)?;
            return Ok(written);
        };

        let diff = diff_against_inventory(&files, &previous);
        let written = self.capture(ctx, backup_dir, &diff.changed_files)?;
        // Always the complete current listing, so the next diff sees every file
        Inventory::from_files(ctx.backup_id(), &files).store(backup_dir)?;

        info!(
            provider = %self.id,
            backup_id = %ctx.backup_id(),
            changed = diff.changed_files.len(),
            unchanged = diff.unchanged_count,
            deleted = diff.deleted_count,
            "Incremental directory capture"
        );
        Ok(written)
    }

    fn perform_restore(
        &self,
        ctx: &ProviderContext<'_>,
        backup_dir: &Path,
        files: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.source_root)?;

        for file in files {
            let stored = backup_dir.join(file);
            match file_path_for_pointer(file).filter(|_| ctx.is_chunk_pointer(file)) {
                Some(original) => {
                    let report = ctx
                        .restore_chunked(&stored, &self.source_root.join(original))
                        .with_context(|| format!("failed to reassemble {original}"))?;
                    if !report.missing.is_empty() {
                        warn!(
                            provider = %self.id,
                            file = %original,
                            missing = report.missing.len(),
                            "Restored file has gaps"
                        );
                    }
                }
                None => {
                    let target = self.source_root.join(file);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&stored, &target)
                        .with_context(|| format!("failed to restore {file}"))?;
                }
            }
        }

        debug!(provider = %self.id, files = files.len(), "Directory restore applied");
        Ok(())
    }
}
