//! Engine configuration, read from an optional JSON file and then overridden
//! from the command line.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime libraries that are always linked and never need declaring.
pub const DEFAULT_INHERENT_DEPENDENCIES: &[&str] = &["libSystem.B.tbd", "libobjc.A.tbd"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tasks running at once.
    pub parallelism: usize,
    /// Keep building unrelated work after a failure.
    pub keep_going: bool,
    /// Maximum number of concurrently planned targets.
    pub producer_parallelism: usize,
    /// Build descriptions kept in memory.
    pub description_cache_capacity: usize,
    /// Persisted task state, relative to the working directory.
    pub db_path: String,
    /// Dependency scanner command line, run once per scanned module.
    pub scanner: Vec<String>,
    pub cache: CacheConfig,
    pub verification: VerificationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        EngineConfig {
            parallelism: cpus,
            keep_going: false,
            producer_parallelism: cpus.min(8),
            description_cache_capacity: 4,
            db_path: ".dynbuild_db".to_string(),
            scanner: Vec::new(),
            cache: CacheConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Local content store directory.
    pub path: Option<String>,
    /// Shared directory acting as the remote cache.
    pub remote: Option<String>,
    /// Local store budget; None means never prune.
    pub budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Library names excluded from dependency verification.
    pub inherent_dependencies: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            inherent_dependencies: DEFAULT_INHERENT_DEPENDENCIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<EngineConfig> {
        let bytes = std::fs::read(path)
            .map_err(|err| anyhow::anyhow!("read {}: {}", path.display(), err))?;
        let config = serde_json::from_slice(&bytes)
            .map_err(|err| anyhow::anyhow!("parse {}: {}", path.display(), err))?;
        Ok(config)
    }

    /// Loads `path` if given, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(EngineConfig::default()),
        }
    }
}
