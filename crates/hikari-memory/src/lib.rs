//! `hikari-memory` – The Companion's Memory.
//!
//! Remembers what matters about the user across sessions and avoids paying
//! twice for the same generated sticker. Everything persists to local SQLite.
//!
//! # Modules
//!
//! - [`fact_store`] – [`FactStore`][fact_store::FactStore]: durable store of
//!   memory facts (short-term and long-term tiers) and the entity relation
//!   graph.
//! - [`lifecycle`] – [`MemoryManager`][lifecycle::MemoryManager]: decides what
//!   to record, deduplicates, promotes short-term facts and consolidates the
//!   long-term tier into summaries.
//! - [`oracle`] – the [`Oracle`][oracle::Oracle] trait through which all text
//!   understanding is delegated to an external model, and
//!   [`PromptedOracle`][oracle::PromptedOracle] which drives a chat model.
//! - [`embedding`] – hashed character-bigram fingerprints and cosine similarity.
//! - [`sticker_cache`] – [`StickerCache`][sticker_cache::StickerCache]:
//!   category-partitioned similarity cache for generated sticker payloads.

pub mod embedding;
pub mod fact_store;
pub mod lifecycle;
pub mod oracle;
pub mod sticker_cache;

pub use fact_store::{
    FactStats, FactStore, FactStoreError, GraphEdge, GraphNode, RelationGraph,
};
pub use lifecycle::{
    ConsolidationReport, MemoryConfig, MemoryManager, PromotionReport, RecordOutcome,
};
pub use oracle::{CompletionBackend, Oracle, OracleError, PromptedOracle};
pub use sticker_cache::{CacheStats, StickerCache, StickerCacheError, StickerMatch};
