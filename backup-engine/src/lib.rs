//! Backup Engine Library
//!
//! Orchestrates full and incremental backups across pluggable resource
//! providers, with a durable metadata catalog, chunk-level deduplication,
//! integrity validation and off-site replication.

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod fs;
pub mod orchestrator;
pub mod provider;
pub mod replication;
pub mod schedule;
pub mod utils;
pub mod validation;

// Re-export commonly used types
pub use catalog::{BackupRecord, BackupType, MetadataCatalog};
pub use config::EngineConfig;
pub use dedup::DedupStore;
pub use orchestrator::{BackupEngine, RestoreSummary, Trigger};
pub use provider::{BackupContext, DirectoryProvider, ProviderContext, ResourceProvider};
pub use schedule::EngineScheduler;
pub use utils::errors::{EngineError, ErrorKind, Result};
