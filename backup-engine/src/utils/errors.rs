//! Error types for the backup engine.
//!
//! Every top-level engine operation returns [`Result`]; callers that need to
//! branch on the failure use [`EngineError::kind`] instead of matching on
//! message text.

use thiserror::Error;

/// Machine-readable classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Io,
    Serialization,
    NotFound,
    MissingParent,
    ChainCycle,
    ProviderFailure,
    ValidationFailure,
    ReplicationFailure,
    ChunkMissing,
    ChunkCorrupt,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("No backups available")]
    NoBackups,

    #[error("Parent backup {parent_id} of {backup_id} not found")]
    MissingParent { backup_id: String, parent_id: String },

    #[error("Incremental backup {0} has no parent")]
    OrphanIncremental(String),

    #[error("Backup chain through {0} contains a cycle")]
    ChainCycle(String),

    #[error("Provider {provider} failed: {reason:#}")]
    ProviderFailure {
        provider: String,
        reason: anyhow::Error,
    },

    #[error("Restore of {backup_id} failed for providers: {}", failed.join(", "))]
    PartialRestore {
        backup_id: String,
        failed: Vec<String>,
    },

    #[error("Backup {backup_id} failed validation: {message}")]
    ValidationFailure { backup_id: String, message: String },

    #[error("Replication is not configured")]
    ReplicationDisabled,

    #[error("Replication of {backup_id} failed: {reason}")]
    Replication { backup_id: String, reason: String },

    #[error("Chunk {digest} missing from store")]
    ChunkMissing { digest: String },

    #[error("Chunk {digest} is corrupt")]
    ChunkCorrupt { digest: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) | EngineError::ConfigParse(_) => ErrorKind::Config,
            EngineError::Io(_) | EngineError::Walk(_) => ErrorKind::Io,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::BackupNotFound(_) | EngineError::NoBackups => ErrorKind::NotFound,
            EngineError::MissingParent { .. } | EngineError::OrphanIncremental(_) => {
                ErrorKind::MissingParent
            }
            EngineError::ChainCycle(_) => ErrorKind::ChainCycle,
            EngineError::ProviderFailure { .. } | EngineError::PartialRestore { .. } => {
                ErrorKind::ProviderFailure
            }
            EngineError::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            EngineError::ReplicationDisabled | EngineError::Replication { .. } => {
                ErrorKind::ReplicationFailure
            }
            EngineError::ChunkMissing { .. } => ErrorKind::ChunkMissing,
            EngineError::ChunkCorrupt { .. } => ErrorKind::ChunkCorrupt,
        }
    }

    pub(crate) fn provider(provider: &str, reason: anyhow::Error) -> Self {
        EngineError::ProviderFailure {
            provider: provider.to_string(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
