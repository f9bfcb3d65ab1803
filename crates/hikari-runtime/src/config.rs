//! Configuration – reads/writes `~/.hikari/config.toml`.
//!
//! ```toml
//! [memory]
//! short_term_floor = 5
//! consolidation_threshold = 8
//!
//! [cache]
//! dimension = 256
//! similarity_threshold = 0.7
//!
//! [storage]
//! facts_db = "/home/me/.hikari/facts.db"
//! stickers_db = "/home/me/.hikari/stickers.db"
//! ```
//!
//! Every key is optional. A missing `[storage]` path means that store lives
//! in memory for the life of the process.

use std::fs;
use std::path::{Path, PathBuf};

use hikari_memory::MemoryConfig;
use hikari_memory::embedding::DEFAULT_DIMENSION;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Fingerprint width for sticker descriptors.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// A cached sticker is reused only when its similarity is strictly above
    /// this value.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}
fn default_similarity_threshold() -> f32 {
    0.7
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facts_db: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickers_db: Option<PathBuf>,
}

/// Persisted configuration stored in `~/.hikari/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HikariConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl HikariConfig {
    /// Load from the default location, falling back to defaults (with env
    /// overrides) when no file exists.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match load()? {
            Some(cfg) => Ok(cfg),
            None => {
                let mut cfg = Self::default();
                apply_env_overrides(&mut cfg);
                Ok(cfg)
            }
        }
    }
}

/// Return the path to `~/.hikari/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".hikari").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<HikariConfig>, ConfigError> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub fn load_from(path: &Path) -> Result<Option<HikariConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: HikariConfig = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `HIKARI_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HIKARI_FACTS_DB` | `storage.facts_db` |
/// | `HIKARI_STICKERS_DB` | `storage.stickers_db` |
/// | `HIKARI_SIMILARITY_THRESHOLD` | `cache.similarity_threshold` |
/// | `HIKARI_EMBEDDING_DIM` | `cache.dimension` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut HikariConfig) {
    if let Ok(v) = std::env::var("HIKARI_FACTS_DB") {
        cfg.storage.facts_db = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("HIKARI_STICKERS_DB") {
        cfg.storage.stickers_db = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("HIKARI_SIMILARITY_THRESHOLD")
        && let Ok(t) = v.trim().parse::<f32>()
        && t.is_finite()
    {
        cfg.cache.similarity_threshold = t;
    }
    if let Ok(v) = std::env::var("HIKARI_EMBEDDING_DIM")
        && let Ok(d) = v.trim().parse::<usize>()
        && d > 0
    {
        cfg.cache.dimension = d;
    }
}

/// Save the config to the default location, creating `~/.hikari/`.
pub fn save(cfg: &HikariConfig) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path, owner-only on Unix.
pub fn save_to(cfg: &HikariConfig, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(io_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(io_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(io_err)?;
    Ok(())
}
