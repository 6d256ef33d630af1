use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "FULL"),
            BackupType::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

/// Provider id → relative paths captured by that provider.
pub type Manifest = BTreeMap<String, BTreeSet<String>>;

/// Provider id → relative path → hex SHA-256.
pub type Checksums = BTreeMap<String, BTreeMap<String, String>>;

/// Catalog entry for one completed backup.
///
/// `parent_id` is set exactly when `backup_type` is [`BackupType::Incremental`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub files: Manifest,
    /// Subset of `files` that are chunk pointers written through the dedup store
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chunked: Manifest,
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub validation_message: Option<String>,
    #[serde(default)]
    pub replicated: bool,
    /// Last-known-good checksums, captured at first validation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: Checksums,
}

impl BackupRecord {
    pub fn full(id: impl Into<String>, timestamp: DateTime<Utc>, description: impl Into<String>) -> Self {
        Self::new(id.into(), BackupType::Full, timestamp, description.into(), None)
    }

    pub fn incremental(
        id: impl Into<String>,
        parent_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(
            id.into(),
            BackupType::Incremental,
            timestamp,
            description.into(),
            Some(parent_id.into()),
        )
    }

    fn new(
        id: String,
        backup_type: BackupType,
        timestamp: DateTime<Utc>,
        description: String,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id,
            backup_type,
            timestamp,
            description,
            parent_id,
            files: Manifest::new(),
            chunked: Manifest::new(),
            validated: false,
            valid: false,
            validation_message: None,
            replicated: false,
            checksums: Checksums::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    /// Files captured by `provider_id`; empty when the provider contributed nothing.
    pub fn files_for(&self, provider_id: &str) -> Option<&BTreeSet<String>> {
        self.files.get(provider_id).filter(|files| !files.is_empty())
    }

    pub fn file_count(&self) -> usize {
        self.files.values().map(BTreeSet::len).sum()
    }

    /// Whether `file` of `provider_id` is a chunk pointer rather than a plain copy.
    pub fn is_chunk_pointer(&self, provider_id: &str, file: &str) -> bool {
        self.chunked
            .get(provider_id)
            .is_some_and(|pointers| pointers.contains(file))
    }

    /// Every `(provider, pointer path)` pair of this backup.
    pub fn chunk_pointers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.chunked
            .iter()
            .flat_map(|(provider, files)| files.iter().map(move |f| (provider.as_str(), f.as_str())))
    }
}
