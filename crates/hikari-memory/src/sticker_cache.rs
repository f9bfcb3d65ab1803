//! Sticker Similarity Cache.
//!
//! Keeps generated stickers in a local SQLite database together with a
//! hashed-bigram fingerprint of the text they were generated from, so a later
//! request with a similar descriptor can reuse an existing sticker instead of
//! generating a new one.
//!
//! # Storage layout
//!
//! A single table `sticker_cache` is created (if it does not already exist):
//!
//! | column      | type    | description                                    |
//! |-------------|---------|------------------------------------------------|
//! | id          | TEXT    | UUID v4 primary key                            |
//! | category    | TEXT    | Sticker kind (e.g. `hikari_emotion`)           |
//! | descriptor  | TEXT    | Detail text the sticker was requested with     |
//! | payload     | BLOB    | Opaque image bytes / reference                 |
//! | embedding   | BLOB    | Little-endian f32 vector (4 × D bytes)         |
//! | descriptor_embedding | BLOB | Fingerprint of `descriptor` alone         |
//! | created_at  | TEXT    | RFC-3339 creation time (UTC)                   |
//! | usage_count | INTEGER | Number of times the sticker was served         |
//!
//! Indexed by category, descriptor, creation time and usage count.
//!
//! # Matching
//!
//! The stored fingerprint covers `prompt_text + descriptor`, the lookup
//! fingerprint covers the requested descriptor alone. A stored sticker scores
//! the better of its stored fingerprint and the fingerprint of its own
//! descriptor (computed once at save time), so an identical descriptor is
//! always a perfect match while prompts that differ only in wording still land
//! close together.
//!
//! # Example
//!
//! ```rust
//! use hikari_memory::sticker_cache::StickerCache;
//! use hikari_types::StickerCategory;
//!
//! let cache = StickerCache::open_in_memory(256).unwrap();
//! cache
//!     .save("red heart sticker", StickerCategory::HikariEmotion, "happy", b"png".to_vec())
//!     .unwrap();
//!
//! let hit = cache
//!     .find_similar(StickerCategory::HikariEmotion, "happy", 0.7)
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(hit.artifact.usage_count, 2);
//! ```

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use hikari_types::{CachedArtifact, StickerCategory};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::{cosine_similarity, text_embedding};

/// Version written to `PRAGMA user_version` for this store.
///
/// Version 2 added the `descriptor_embedding` column.
pub const CACHE_SCHEMA_VERSION: i32 = 2;

/// Size multiplier applied to raw payload bytes when estimating storage,
/// matching base64 transport encoding.
pub const PAYLOAD_ENCODING_EXPANSION: f64 = 4.0 / 3.0;

/// Length of the "most used" ranking in [`CacheStats`].
pub const MOST_USED_LIMIT: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from sticker cache operations.
#[derive(Error, Debug)]
pub enum StickerCacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Embedding dimension must be non-zero (got {0})")]
    InvalidDimension(usize),
}

// ─────────────────────────────────────────────────────────────────────────────
// Result types
// ─────────────────────────────────────────────────────────────────────────────

/// A cache hit together with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerMatch {
    pub artifact: CachedArtifact,
    pub similarity: f32,
}

/// One row of the "most used" ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: Uuid,
    pub category: StickerCategory,
    pub descriptor: String,
    pub usage_count: u64,
}

/// Aggregate statistics. Hit rate is not tracked here; callers measure it
/// from lookup outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: usize,
    /// Estimated bytes: encoded payload size plus embedding storage.
    pub approx_total_bytes: u64,
    pub most_used: Vec<UsageEntry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// StickerCache
// ─────────────────────────────────────────────────────────────────────────────

const ARTIFACT_COLUMNS: &str =
    "id, category, descriptor, payload, embedding, created_at, usage_count";

/// SQLite-backed approximate-match cache for generated stickers.
pub struct StickerCache {
    conn: Connection,
    dimension: usize,
}

impl StickerCache {
    /// Open (or create) a persistent cache at `path` using `dimension`-wide
    /// fingerprints.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, StickerCacheError> {
        if dimension == 0 {
            return Err(StickerCacheError::InvalidDimension(dimension));
        }
        let conn = Connection::open(path)?;
        let cache = Self { conn, dimension };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Open a temporary in-memory cache (useful for testing).
    pub fn open_in_memory(dimension: usize) -> Result<Self, StickerCacheError> {
        if dimension == 0 {
            return Err(StickerCacheError::InvalidDimension(dimension));
        }
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn, dimension };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<(), StickerCacheError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sticker_cache (
                id          TEXT NOT NULL PRIMARY KEY,
                category    TEXT NOT NULL,
                descriptor  TEXT NOT NULL,
                payload     BLOB NOT NULL,
                embedding   BLOB NOT NULL,
                created_at  TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                descriptor_embedding BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_stickers_category    ON sticker_cache (category);
            CREATE INDEX IF NOT EXISTS idx_stickers_descriptor  ON sticker_cache (descriptor);
            CREATE INDEX IF NOT EXISTS idx_stickers_created_at  ON sticker_cache (created_at);
            CREATE INDEX IF NOT EXISTS idx_stickers_usage_count ON sticker_cache (usage_count);",
        )?;
        let has_descriptor_embedding = self
            .conn
            .prepare(
                "SELECT 1 FROM pragma_table_info('sticker_cache')
                 WHERE name = 'descriptor_embedding'",
            )?
            .exists([])?;
        if !has_descriptor_embedding {
            // Rows cached before version 2 keep a NULL and are fingerprinted on lookup.
            self.conn.execute_batch(
                "ALTER TABLE sticker_cache ADD COLUMN descriptor_embedding BLOB;",
            )?;
        }
        self.conn.pragma_update(None, "user_version", CACHE_SCHEMA_VERSION)?;
        Ok(())
    }

    /// The schema version recorded in the database file.
    pub fn schema_version(&self) -> Result<i32, StickerCacheError> {
        let v = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(v)
    }

    /// Fingerprint width used by this cache.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Store a freshly generated sticker.
    ///
    /// The fingerprint is computed over `prompt_text` followed by
    /// `descriptor`, and a second one over `descriptor` alone is stored for
    /// matching. The new row starts with a usage count of 1.
    pub fn save(
        &self,
        prompt_text: &str,
        category: StickerCategory,
        descriptor: &str,
        payload: Vec<u8>,
    ) -> Result<CachedArtifact, StickerCacheError> {
        let embedding = text_embedding(&format!("{prompt_text}{descriptor}"), self.dimension);
        let descriptor_embedding = text_embedding(descriptor, self.dimension);
        let artifact = CachedArtifact {
            id: Uuid::new_v4(),
            category,
            descriptor: descriptor.to_string(),
            payload,
            embedding,
            created_at: Utc::now(),
            usage_count: 1,
        };
        self.conn.execute(
            "INSERT INTO sticker_cache
                 (id, category, descriptor, payload, embedding, created_at, usage_count,
                  descriptor_embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                artifact.id.to_string(),
                artifact.category.as_str(),
                artifact.descriptor,
                artifact.payload,
                embedding_to_bytes(&artifact.embedding),
                artifact.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                artifact.usage_count as i64,
                embedding_to_bytes(&descriptor_embedding),
            ],
        )?;
        debug!(id = %artifact.id, category = category.as_str(), "sticker cached");
        Ok(artifact)
    }

    /// Return the best sticker of `category` whose similarity to
    /// `descriptor` is strictly above `threshold`.
    ///
    /// Only stickers of the requested category are considered. On a hit the
    /// usage count is incremented before returning; if that write fails the
    /// failure is logged and the match is still returned with its previous
    /// count.
    pub fn find_similar(
        &self,
        category: StickerCategory,
        descriptor: &str,
        threshold: f32,
    ) -> Result<Option<StickerMatch>, StickerCacheError> {
        let query = text_embedding(descriptor, self.dimension);

        let mut stmt = self.conn.prepare(
            "SELECT id, descriptor, embedding, descriptor_embedding
             FROM sticker_cache WHERE category = ?1",
        )?;
        let rows = stmt.query_map(params![category.as_str()], |row| {
            let id: String = row.get(0)?;
            let stored_descriptor: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let own_blob: Option<Vec<u8>> = row.get(3)?;
            Ok((id, stored_descriptor, blob, own_blob))
        })?;

        let mut best: Option<(String, f32)> = None;
        for row in rows {
            let (id, stored_descriptor, blob, own_blob) = row?;
            let stored = bytes_to_embedding(&blob);
            if stored.len() != query.len() {
                continue;
            }
            let own = match own_blob.map(|b| bytes_to_embedding(&b)) {
                Some(own) if own.len() == query.len() => own,
                _ => text_embedding(&stored_descriptor, self.dimension),
            };
            let similarity =
                cosine_similarity(&query, &stored).max(cosine_similarity(&query, &own));
            let best_so_far = best.as_ref().map_or(f32::NEG_INFINITY, |(_, s)| *s);
            if similarity > threshold && similarity > best_so_far {
                best = Some((id, similarity));
            }
        }
        drop(stmt);

        let Some((id, similarity)) = best else {
            debug!(category = category.as_str(), descriptor, "sticker cache miss");
            return Ok(None);
        };

        let id = Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
        })?;
        let Some(mut artifact) = self.get(id)? else {
            return Ok(None);
        };
        match self.increment_usage(id) {
            Ok(true) => artifact.usage_count += 1,
            Ok(false) => warn!(%id, "sticker vanished before usage count update"),
            Err(e) => warn!(%id, error = %e, "failed to record sticker usage"),
        }
        debug!(%id, similarity, "sticker cache hit");
        Ok(Some(StickerMatch {
            artifact,
            similarity,
        }))
    }

    /// Bump the usage count of a sticker. Returns `false` for unknown ids.
    pub fn increment_usage(&self, id: Uuid) -> Result<bool, StickerCacheError> {
        let changed = self.conn.execute(
            "UPDATE sticker_cache SET usage_count = usage_count + 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Fetch a single sticker by id.
    pub fn get(&self, id: Uuid) -> Result<Option<CachedArtifact>, StickerCacheError> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM sticker_cache WHERE id = ?1");
        let artifact = self
            .conn
            .query_row(&sql, params![id.to_string()], row_to_artifact)
            .optional()?;
        Ok(artifact)
    }

    /// All stickers of `category`, newest first.
    pub fn list_by_category(
        &self,
        category: StickerCategory,
    ) -> Result<Vec<CachedArtifact>, StickerCacheError> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM sticker_cache WHERE category = ?1
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![category.as_str()], row_to_artifact)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StickerCacheError::Sqlite)
    }

    /// Remove a sticker. Returns whether a row was deleted.
    pub fn delete(&self, id: Uuid) -> Result<bool, StickerCacheError> {
        let changed = self.conn.execute(
            "DELETE FROM sticker_cache WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Drop every cached sticker.
    pub fn clear(&self) -> Result<(), StickerCacheError> {
        self.conn.execute("DELETE FROM sticker_cache", [])?;
        Ok(())
    }

    /// Count, estimated size and the top [`MOST_USED_LIMIT`] stickers by
    /// usage count.
    pub fn stats(&self) -> Result<CacheStats, StickerCacheError> {
        let (total, payload_bytes, embedding_bytes): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(LENGTH(payload)), 0),
                    COALESCE(SUM(LENGTH(embedding)), 0)
             FROM sticker_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let encoded = (payload_bytes as f64 * PAYLOAD_ENCODING_EXPANSION).round() as u64;

        let mut stmt = self.conn.prepare(
            "SELECT id, category, descriptor, usage_count FROM sticker_cache
             ORDER BY usage_count DESC, created_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![MOST_USED_LIMIT as i64], |row| {
            let category_str: String = row.get(1)?;
            let category = StickerCategory::parse(&category_str).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(1, category_str, rusqlite::types::Type::Text)
            })?;
            let usage: i64 = row.get(3)?;
            Ok(UsageEntry {
                id: parse_id(row.get(0)?)?,
                category,
                descriptor: row.get(2)?,
                usage_count: usage.max(0) as u64,
            })
        })?;
        let most_used = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(CacheStats {
            total: total as usize,
            approx_total_bytes: encoded + embedding_bytes as u64,
            most_used,
        })
    }
}

fn parse_id(raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw)
        .map_err(|_| rusqlite::Error::InvalidColumnType(0, raw, rusqlite::types::Type::Text))
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedArtifact> {
    let id = parse_id(row.get(0)?)?;
    let category_str: String = row.get(1)?;
    let descriptor: String = row.get(2)?;
    let payload: Vec<u8> = row.get(3)?;
    let blob: Vec<u8> = row.get(4)?;
    let created_str: String = row.get(5)?;
    let usage: i64 = row.get(6)?;

    let category = StickerCategory::parse(&category_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(1, category_str, rusqlite::types::Type::Text)
    })?;
    let created_at = created_str.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(5, e.to_string(), rusqlite::types::Type::Text)
    })?;

    Ok(CachedArtifact {
        id,
        category,
        descriptor,
        payload,
        embedding: bytes_to_embedding(&blob),
        created_at,
        usage_count: usage.max(0) as u64,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
