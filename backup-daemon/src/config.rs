use backup_engine::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration: the engine's TOML tables plus `[[sources]]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// A directory registered as a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Store files through the chunk store
    #[serde(default)]
    pub chunked: bool,
    /// Skip entries whose file name contains one of these substrings.
    /// Globs are not expanded.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DaemonConfig {
    /// Load `path` if it exists, then apply `.env` / environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `BACKUP_ROOT`, `REPLICATION_TARGET` (also enables replication) and `LOG_LEVEL`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("BACKUP_ROOT").filter(|v| !v.is_empty()) {
            self.engine.storage.backup_root = PathBuf::from(root);
        }
        if let Some(target) = lookup("REPLICATION_TARGET").filter(|v| !v.is_empty()) {
            self.engine.replication.target = Some(PathBuf::from(target));
            self.engine.replication.enabled = true;
        }
        if let Some(level) = lookup("LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.engine.log.level = level;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                anyhow::bail!("source with path {} has an empty id", source.path.display());
            }
            if !seen.insert(source.id.as_str()) {
                anyhow::bail!("duplicate source id '{}'", source.id);
            }
        }
        Ok(())
    }
}
