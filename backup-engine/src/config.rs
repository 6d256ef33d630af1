//! Configuration for the backup engine.
//!
//! Loaded from a TOML file. Every field has a default so a partial file (or
//! no file at all) yields a usable configuration.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Per-provider enabled flags; providers not listed are enabled
    #[serde(default)]
    pub providers: HashMap<String, bool>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of all backup directories and the metadata catalog
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Chunk store directory (defaults to `<backup_root>/chunks`)
    #[serde(default)]
    pub dedup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Minutes between full backups (0 disables)
    #[serde(default = "default_full_interval")]
    pub full_interval_minutes: u64,

    /// Time of day (HH:MM, UTC) full backups are anchored to
    #[serde(default = "default_full_time")]
    pub full_time: String,

    /// Minutes between incremental backups (0 disables)
    #[serde(default = "default_incremental_interval")]
    pub incremental_interval_minutes: u64,

    #[serde(default = "default_incremental_time")]
    pub incremental_time: String,

    /// Minutes between validation sweeps (0 disables)
    #[serde(default = "default_validation_interval")]
    pub validation_interval_minutes: u64,

    /// Minutes between replication sweeps
    #[serde(default = "default_replication_interval")]
    pub replication_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_full_retention")]
    pub full: usize,

    #[serde(default = "default_incremental_retention")]
    pub incremental: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Secondary root backups are mirrored to
    #[serde(default)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Chunk size in bytes (default: 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunk payload compression (zstd, none)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Skip missing chunks on retrieval instead of failing
    #[serde(default)]
    pub best_effort_retrieval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/lib/server-backup/backups")
}

fn default_full_interval() -> u64 {
    24 * 60
}

fn default_full_time() -> String {
    "03:00".to_string()
}

fn default_incremental_interval() -> u64 {
    60
}

fn default_incremental_time() -> String {
    "00:00".to_string()
}

fn default_validation_interval() -> u64 {
    12 * 60
}

fn default_replication_interval() -> u64 {
    60
}

fn default_full_retention() -> usize {
    7
}

fn default_incremental_retention() -> usize {
    24
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            dedup_dir: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_interval_minutes: default_full_interval(),
            full_time: default_full_time(),
            incremental_interval_minutes: default_incremental_interval(),
            incremental_time: default_incremental_time(),
            validation_interval_minutes: default_validation_interval(),
            replication_interval_minutes: default_replication_interval(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            full: default_full_retention(),
            incremental: default_incremental_retention(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            compression: default_compression(),
            compression_level: default_compression_level(),
            best_effort_retrieval: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `backup_root` with every other value defaulted
    pub fn with_root(backup_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.backup_root = backup_root.into();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.dedup.chunk_size == 0 {
            return Err(EngineError::Config("dedup.chunk_size must be positive".into()));
        }
        match self.dedup.compression.as_str() {
            "zstd" | "none" => {}
            other => {
                return Err(EngineError::Config(format!(
                    "unknown dedup.compression '{other}' (expected zstd or none)"
                )))
            }
        }
        if self.replication.enabled && self.replication_target().is_none() {
            return Err(EngineError::Config(
                "replication.enabled requires replication.target".into(),
            ));
        }
        Ok(())
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.storage.backup_root.join("metadata")
    }

    pub fn dedup_dir(&self) -> PathBuf {
        self.storage
            .dedup_dir
            .clone()
            .unwrap_or_else(|| self.storage.backup_root.join("chunks"))
    }

    /// Replication target, ignoring an empty path
    pub fn replication_target(&self) -> Option<&Path> {
        self.replication
            .target
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn is_provider_enabled(&self, provider_id: &str) -> bool {
        self.providers.get(provider_id).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.schedule.full_interval_minutes, 1440);
        assert_eq!(config.schedule.full_time, "03:00");
        assert_eq!(config.schedule.incremental_interval_minutes, 60);
        assert_eq!(config.retention.full, 7);
        assert_eq!(config.retention.incremental, 24);
        assert_eq!(config.dedup.chunk_size, 1024 * 1024);
        assert!(!config.dedup.best_effort_retrieval);
        assert!(!config.replication.enabled);
    }

    #[test]
    fn test_partial_file() {
        let config = EngineConfig::from_toml(
            r#"
            [storage]
            backup_root = "/srv/backups"

            [retention]
            full = 2

            [providers]
            world = false
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.dedup_dir(), PathBuf::from("/srv/backups/chunks"));
        assert_eq!(config.metadata_dir(), PathBuf::from("/srv/backups/metadata"));
        assert_eq!(config.retention.full, 2);
        assert_eq!(config.retention.incremental, 24);
        assert!(!config.is_provider_enabled("world"));
        assert!(config.is_provider_enabled("config"));
    }

    #[test]
    fn test_replication_requires_target() {
        let err = EngineConfig::from_toml("[replication]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = EngineConfig::from_toml("[replication]\nenabled = true\ntarget = \"\"\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_compression() {
        let err = EngineConfig::from_toml("[dedup]\ncompression = \"lz4\"\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
