//! `MemoryRuntime` – opens both stores from configuration and hands out the
//! lifecycle manager and the sticker cache.
//!
//! The runtime is constructed explicitly and owned by the caller; there is no
//! process-wide handle. Stores are opened once in [`MemoryRuntime::open`] and
//! released in [`MemoryRuntime::close`] (or on drop).
//!
//! Sticker lookups follow a miss → generate → save loop:
//!
//! ```text
//! fetch_sticker ──► find_similar ──hit──► Cached
//!                        │
//!                       miss
//!                        ▼
//!              StickerGenerator::generate ──► save ──► Generated
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use hikari_memory::{
    CacheStats, FactStats, FactStore, FactStoreError, MemoryManager, Oracle, StickerCache,
    StickerCacheError, StickerMatch,
};
use hikari_types::{CachedArtifact, HikariError, StickerCategory};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{CacheConfig, ConfigError, HikariConfig};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Fact store error: {0}")]
    Facts(#[from] FactStoreError),
    #[error("Sticker cache error: {0}")]
    Stickers(#[from] StickerCacheError),
    #[error("Sticker generation failed: {0}")]
    Generation(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RuntimeError> for HikariError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Facts(_) | RuntimeError::Stickers(_) => {
                HikariError::Storage(e.to_string())
            }
            RuntimeError::Generation(_) => HikariError::Oracle(e.to_string()),
            RuntimeError::Config(_) => HikariError::Config(e.to_string()),
        }
    }
}

/// Produces sticker payloads on a cache miss.
#[async_trait]
pub trait StickerGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt_text: &str,
        category: StickerCategory,
        descriptor: &str,
    ) -> Result<Vec<u8>, RuntimeError>;
}

/// Where a fetched sticker came from.
#[derive(Debug, Clone, PartialEq)]
pub enum StickerFetch {
    Cached(StickerMatch),
    Generated(CachedArtifact),
}

impl StickerFetch {
    pub fn artifact(&self) -> &CachedArtifact {
        match self {
            StickerFetch::Cached(m) => &m.artifact,
            StickerFetch::Generated(a) => a,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, StickerFetch::Cached(_))
    }
}

/// Combined counters from both stores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub facts: FactStats,
    pub stickers: CacheStats,
}

pub struct MemoryRuntime {
    manager: MemoryManager,
    stickers: Arc<Mutex<StickerCache>>,
    cache: CacheConfig,
}

impl MemoryRuntime {
    /// Open the fact store and sticker cache named by `config.storage`
    /// (in-memory when a path is unset) and wire them to `oracle`.
    pub fn open(config: &HikariConfig, oracle: Arc<dyn Oracle>) -> Result<Self, RuntimeError> {
        let facts = match &config.storage.facts_db {
            Some(path) => FactStore::open(path)?,
            None => FactStore::open_in_memory()?,
        };
        let stickers = match &config.storage.stickers_db {
            Some(path) => StickerCache::open(path, config.cache.dimension)?,
            None => StickerCache::open_in_memory(config.cache.dimension)?,
        };
        info!(
            facts_db = ?config.storage.facts_db,
            stickers_db = ?config.storage.stickers_db,
            dimension = config.cache.dimension,
            "memory runtime opened"
        );
        Ok(Self {
            manager: MemoryManager::new(
                Arc::new(Mutex::new(facts)),
                oracle,
                config.memory.clone(),
            ),
            stickers: Arc::new(Mutex::new(stickers)),
            cache: config.cache.clone(),
        })
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.manager
    }

    pub fn stickers(&self) -> Arc<Mutex<StickerCache>> {
        Arc::clone(&self.stickers)
    }

    /// Return a cached sticker similar to `descriptor`, or generate, store
    /// and return a new one.
    ///
    /// The cache lock is not held while the generator runs, so two misses for
    /// the same descriptor may both generate.
    #[tracing::instrument(
        skip(self, generator, prompt_text, category),
        fields(category = category.as_str())
    )]
    pub async fn fetch_sticker(
        &self,
        generator: &dyn StickerGenerator,
        prompt_text: &str,
        category: StickerCategory,
        descriptor: &str,
    ) -> Result<StickerFetch, RuntimeError> {
        let hit = self
            .stickers
            .lock()
            .await
            .find_similar(category, descriptor, self.cache.similarity_threshold)?;
        if let Some(m) = hit {
            return Ok(StickerFetch::Cached(m));
        }

        debug!("generating sticker");
        let payload = generator.generate(prompt_text, category, descriptor).await?;
        let artifact = self
            .stickers
            .lock()
            .await
            .save(prompt_text, category, descriptor, payload)?;
        Ok(StickerFetch::Generated(artifact))
    }

    pub async fn stats(&self) -> Result<RuntimeStats, RuntimeError> {
        let facts = self.manager.store().lock().await.stats()?;
        let stickers = self.stickers.lock().await.stats()?;
        Ok(RuntimeStats { facts, stickers })
    }

    /// Release both stores.
    pub fn close(self) {
        info!("memory runtime closed");
    }
}
