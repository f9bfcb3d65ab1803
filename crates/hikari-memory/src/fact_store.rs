//! Fact Store.
//!
//! Durable keyed storage for [`MemoryFact`] records and free-standing
//! [`Relation`] edges, backed by a local SQLite database.
//!
//! # Storage layout
//!
//! Two tables are created (if they do not already exist):
//!
//! `memory_facts`
//!
//! | column         | type | description                                      |
//! |----------------|------|--------------------------------------------------|
//! | id             | TEXT | UUID v4 primary key                              |
//! | fact           | TEXT | The remembered statement                         |
//! | category       | TEXT | `user_info`, `agent_info` or `shared_event`      |
//! | lifecycle_type | TEXT | `short_term` or `long_term`                      |
//! | importance     | REAL | Score in `[0, 1]`                                |
//! | timestamp      | TEXT | RFC-3339 creation time (UTC, nanosecond width)   |
//! | source         | TEXT | `conversation`, `offline_event` or `system`      |
//!
//! `memory_relations`
//!
//! | column    | type | description                  |
//! |-----------|------|------------------------------|
//! | id        | TEXT | UUID v4 primary key          |
//! | source    | TEXT | Source entity name           |
//! | predicate | TEXT | Relation label               |
//! | target    | TEXT | Target entity name           |
//! | timestamp | TEXT | RFC-3339 creation time (UTC) |
//!
//! Facts are indexed by lifecycle type, category, timestamp and importance;
//! relations by source, target and timestamp, and `(source, predicate,
//! target)` is unique so a repeated edge is stored once. The schema version
//! is kept in `PRAGMA user_version`.
//!
//! Every method is its own unit of work. The only multi-statement write,
//! [`FactStore::replace_facts`], runs inside a single transaction.
//!
//! # Example
//!
//! ```rust
//! use hikari_memory::fact_store::FactStore;
//! use hikari_types::{FactCategory, LifecycleType, NewFact};
//!
//! let store = FactStore::open_in_memory().unwrap();
//! let fact = store
//!     .add_fact(NewFact::short_term("Likes rainy days", FactCategory::UserInfo, 0.6))
//!     .unwrap();
//!
//! assert!(store.promote(fact.id).unwrap());
//! let long_term = store.list_by_lifecycle_type(LifecycleType::LongTerm).unwrap();
//! assert_eq!(long_term[0].id, fact.id);
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use hikari_types::{
    FactCategory, FactSource, FactUpdate, LifecycleType, MemoryFact, NewFact, Relation,
    clamp_importance,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Version written to `PRAGMA user_version` for this store.
///
/// Version 2 added the unique `(source, predicate, target)` relation index.
pub const FACT_SCHEMA_VERSION: i32 = 2;

/// Predicate marking an entity's preferences.
pub const PREFERENCE_PREDICATE: &str = "LIKES";

/// Maximum number of edges returned by [`FactStore::graph`].
pub const GRAPH_EDGE_LIMIT: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from fact store operations.
#[derive(Error, Debug)]
pub enum FactStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Row counts reported by [`FactStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactStats {
    pub short_term: usize,
    pub long_term: usize,
    pub total: usize,
    pub relations: usize,
    /// Relation count per predicate.
    pub relations_by_predicate: BTreeMap<String, usize>,
}

/// An entity appearing in the exported graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// Number of exported edges touching this entity.
    pub degree: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub predicate: String,
}

/// Node and edge lists for visualising the relation graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

// ─────────────────────────────────────────────────────────────────────────────
// FactStore
// ─────────────────────────────────────────────────────────────────────────────

const FACT_COLUMNS: &str = "id, fact, category, lifecycle_type, importance, timestamp, source";
const RELATION_COLUMNS: &str = "id, source, predicate, target, timestamp";

/// SQLite-backed store for memory facts and relations.
pub struct FactStore {
    conn: Connection,
}

impl FactStore {
    /// Open (or create) a persistent fact database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FactStoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, FactStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), FactStoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_facts (
                id             TEXT NOT NULL PRIMARY KEY,
                fact           TEXT NOT NULL,
                category       TEXT NOT NULL,
                lifecycle_type TEXT NOT NULL,
                importance     REAL NOT NULL,
                timestamp      TEXT NOT NULL,
                source         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_facts_lifecycle  ON memory_facts (lifecycle_type);
            CREATE INDEX IF NOT EXISTS idx_facts_category   ON memory_facts (category);
            CREATE INDEX IF NOT EXISTS idx_facts_timestamp  ON memory_facts (timestamp);
            CREATE INDEX IF NOT EXISTS idx_facts_importance ON memory_facts (importance);

            CREATE TABLE IF NOT EXISTS memory_relations (
                id        TEXT NOT NULL PRIMARY KEY,
                source    TEXT NOT NULL,
                predicate TEXT NOT NULL,
                target    TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_relations_source    ON memory_relations (source);
            CREATE INDEX IF NOT EXISTS idx_relations_target    ON memory_relations (target);
            CREATE INDEX IF NOT EXISTS idx_relations_timestamp ON memory_relations (timestamp);",
        )?;

        if self.schema_version()? < 2 {
            // Keep the oldest copy of each edge before the unique index goes on.
            self.conn.execute(
                "DELETE FROM memory_relations WHERE rowid NOT IN (
                    SELECT MIN(rowid) FROM memory_relations GROUP BY source, predicate, target
                 )",
                [],
            )?;
        }
        self.conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_relations_edge
                 ON memory_relations (source, predicate, target);",
        )?;
        self.conn.pragma_update(None, "user_version", FACT_SCHEMA_VERSION)?;
        Ok(())
    }

    /// The schema version recorded in the database file.
    pub fn schema_version(&self) -> Result<i32, FactStoreError> {
        let v = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(v)
    }

    // ── facts ────────────────────────────────────────────────────────────────

    /// Persist a new fact, assigning a fresh UUID and the current timestamp.
    ///
    /// The importance score is clamped into `[0, 1]`.
    pub fn add_fact(&self, new: NewFact) -> Result<MemoryFact, FactStoreError> {
        let fact = MemoryFact {
            id: Uuid::new_v4(),
            fact: new.fact,
            category: new.category,
            lifecycle_type: new.lifecycle_type,
            importance: clamp_importance(new.importance),
            timestamp: Utc::now(),
            source: new.source,
        };
        insert_fact(&self.conn, &fact)?;
        Ok(fact)
    }

    /// Fetch a single fact by id.
    pub fn get(&self, id: Uuid) -> Result<Option<MemoryFact>, FactStoreError> {
        let sql = format!("SELECT {FACT_COLUMNS} FROM memory_facts WHERE id = ?1");
        let fact = self
            .conn
            .query_row(&sql, params![id.to_string()], row_to_fact)
            .optional()?;
        Ok(fact)
    }

    /// All facts of the given lifecycle type, newest first.
    pub fn list_by_lifecycle_type(
        &self,
        lifecycle_type: LifecycleType,
    ) -> Result<Vec<MemoryFact>, FactStoreError> {
        self.query_facts(
            "WHERE lifecycle_type = ?1 ORDER BY timestamp DESC, rowid DESC",
            lifecycle_type.as_str(),
        )
    }

    /// All facts of the given lifecycle type in the order they were inserted.
    ///
    /// Unlike the timestamp ordering this is unaffected by clock adjustments.
    pub fn list_in_insertion_order(
        &self,
        lifecycle_type: LifecycleType,
    ) -> Result<Vec<MemoryFact>, FactStoreError> {
        self.query_facts(
            "WHERE lifecycle_type = ?1 ORDER BY rowid ASC",
            lifecycle_type.as_str(),
        )
    }

    /// All facts of the given category, newest first.
    pub fn list_by_category(
        &self,
        category: FactCategory,
    ) -> Result<Vec<MemoryFact>, FactStoreError> {
        self.query_facts(
            "WHERE category = ?1 ORDER BY timestamp DESC, rowid DESC",
            category.as_str(),
        )
    }

    /// Every fact regardless of tier, newest first.
    pub fn list_all(&self) -> Result<Vec<MemoryFact>, FactStoreError> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM memory_facts ORDER BY timestamp DESC, rowid DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_fact)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(FactStoreError::Sqlite)
    }

    fn query_facts(&self, clause: &str, value: &str) -> Result<Vec<MemoryFact>, FactStoreError> {
        let sql = format!("SELECT {FACT_COLUMNS} FROM memory_facts {clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], row_to_fact)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(FactStoreError::Sqlite)
    }

    /// Apply a user edit. Returns `false` when no fact has this id.
    ///
    /// The lifecycle type can never be changed here.
    pub fn update(&self, id: Uuid, changes: FactUpdate) -> Result<bool, FactStoreError> {
        let Some(mut fact) = self.get(id)? else {
            return Ok(false);
        };
        if let Some(text) = changes.fact {
            fact.fact = text;
        }
        if let Some(category) = changes.category {
            fact.category = category;
        }
        if let Some(importance) = changes.importance {
            fact.importance = clamp_importance(importance);
        }
        let changed = self.conn.execute(
            "UPDATE memory_facts SET fact = ?1, category = ?2, importance = ?3 WHERE id = ?4",
            params![
                fact.fact,
                fact.category.as_str(),
                f64::from(fact.importance),
                id.to_string()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Flip a short-term fact to long-term.
    ///
    /// Returns `true` only if a short-term fact with this id existed; long-term
    /// and unknown ids are left untouched.
    pub fn promote(&self, id: Uuid) -> Result<bool, FactStoreError> {
        let changed = self.conn.execute(
            "UPDATE memory_facts SET lifecycle_type = ?1 WHERE id = ?2 AND lifecycle_type = ?3",
            params![
                LifecycleType::LongTerm.as_str(),
                id.to_string(),
                LifecycleType::ShortTerm.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Remove a fact. Returns whether a row was deleted.
    pub fn delete(&self, id: Uuid) -> Result<bool, FactStoreError> {
        let changed = self.conn.execute(
            "DELETE FROM memory_facts WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Atomically delete `remove` and insert `insert` in one transaction.
    ///
    /// Either every listed fact is replaced or, on error, nothing changes.
    pub fn replace_facts(
        &self,
        remove: &[Uuid],
        insert: Vec<NewFact>,
    ) -> Result<Vec<MemoryFact>, FactStoreError> {
        let tx = self.conn.unchecked_transaction()?;
        for id in remove {
            tx.execute(
                "DELETE FROM memory_facts WHERE id = ?1",
                params![id.to_string()],
            )?;
        }
        let mut written = Vec::with_capacity(insert.len());
        for new in insert {
            let fact = MemoryFact {
                id: Uuid::new_v4(),
                fact: new.fact,
                category: new.category,
                lifecycle_type: new.lifecycle_type,
                importance: clamp_importance(new.importance),
                timestamp: Utc::now(),
                source: new.source,
            };
            insert_fact(&tx, &fact)?;
            written.push(fact);
        }
        tx.commit()?;
        Ok(written)
    }

    // ── relations ────────────────────────────────────────────────────────────

    /// Persist a relation edge.
    ///
    /// Returns `None` when the same `(source, predicate, target)` edge is
    /// already stored; the existing row is left as it was.
    pub fn add_relation(
        &self,
        source: &str,
        predicate: &str,
        target: &str,
    ) -> Result<Option<Relation>, FactStoreError> {
        let relation = Relation {
            id: Uuid::new_v4(),
            source: source.to_string(),
            predicate: predicate.to_string(),
            target: target.to_string(),
            timestamp: Utc::now(),
        };
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO memory_relations (id, source, predicate, target, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                relation.id.to_string(),
                relation.source,
                relation.predicate,
                relation.target,
                format_timestamp(&relation.timestamp),
            ],
        )?;
        Ok((inserted > 0).then_some(relation))
    }

    /// Every relation, newest first.
    pub fn list_relations(&self) -> Result<Vec<Relation>, FactStoreError> {
        self.query_relations("ORDER BY timestamp DESC, rowid DESC", params![])
    }

    /// Relations where `entity` is either the source or the target, newest first.
    pub fn relations_for_entity(&self, entity: &str) -> Result<Vec<Relation>, FactStoreError> {
        self.query_relations(
            "WHERE source = ?1 OR target = ?1 ORDER BY timestamp DESC, rowid DESC",
            params![entity],
        )
    }

    /// Relations whose source or target contains `query`, newest first, at
    /// most `limit` of them.
    ///
    /// Matching is a substring match, case-insensitive for ASCII letters.
    pub fn search_relations(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Relation>, FactStoreError> {
        self.query_relations(
            "WHERE source LIKE ?1 ESCAPE '\\' OR target LIKE ?1 ESCAPE '\\'
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2",
            params![like_pattern(query), sql_limit(limit)],
        )
    }

    /// Things `entity` likes ([`PREFERENCE_PREDICATE`] edges), newest first.
    pub fn preferences(&self, entity: &str, limit: usize) -> Result<Vec<Relation>, FactStoreError> {
        self.query_relations(
            "WHERE source = ?1 AND UPPER(predicate) = ?2
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?3",
            params![entity, PREFERENCE_PREDICATE, sql_limit(limit)],
        )
    }

    /// Export the newest [`GRAPH_EDGE_LIMIT`] edges and the entities they
    /// touch. Nodes are listed in order of first appearance.
    pub fn graph(&self) -> Result<RelationGraph, FactStoreError> {
        let relations = self.query_relations(
            "ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
            params![sql_limit(GRAPH_EDGE_LIMIT)],
        )?;

        let mut graph = RelationGraph::default();
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();
        for relation in relations {
            for entity in [&relation.source, &relation.target] {
                match positions.get(entity) {
                    Some(&i) => graph.nodes[i].degree += 1,
                    None => {
                        positions.insert(entity.clone(), graph.nodes.len());
                        graph.nodes.push(GraphNode {
                            id: entity.clone(),
                            degree: 1,
                        });
                    }
                }
            }
            graph.edges.push(GraphEdge {
                source: relation.source,
                target: relation.target,
                predicate: relation.predicate,
            });
        }
        Ok(graph)
    }

    /// Remove a relation. Returns whether a row was deleted.
    pub fn delete_relation(&self, id: Uuid) -> Result<bool, FactStoreError> {
        let changed = self.conn.execute(
            "DELETE FROM memory_relations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn query_relations(
        &self,
        clause: &str,
        values: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Relation>, FactStoreError> {
        let sql = format!("SELECT {RELATION_COLUMNS} FROM memory_relations {clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(values, row_to_relation)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(FactStoreError::Sqlite)
    }

    // ── housekeeping ─────────────────────────────────────────────────────────

    /// Count facts per tier, and relations in total and per predicate.
    pub fn stats(&self) -> Result<FactStats, FactStoreError> {
        let count_tier = |t: LifecycleType| -> Result<usize, rusqlite::Error> {
            self.conn
                .query_row(
                    "SELECT COUNT(*) FROM memory_facts WHERE lifecycle_type = ?1",
                    params![t.as_str()],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as usize)
        };
        let short_term = count_tier(LifecycleType::ShortTerm)?;
        let long_term = count_tier(LifecycleType::LongTerm)?;

        let mut stmt = self.conn.prepare(
            "SELECT predicate, COUNT(*) FROM memory_relations GROUP BY predicate",
        )?;
        let rows = stmt.query_map([], |row| {
            let predicate: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((predicate, count as usize))
        })?;
        let relations_by_predicate = rows.collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(FactStats {
            short_term,
            long_term,
            total: short_term + long_term,
            relations: relations_by_predicate.values().sum(),
            relations_by_predicate,
        })
    }

    /// Delete every fact and relation.
    pub fn clear(&self) -> Result<(), FactStoreError> {
        self.conn.execute_batch("DELETE FROM memory_facts; DELETE FROM memory_relations;")?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-width RFC-3339 so lexical order equals chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// `%query%` with LIKE wildcards in `query` escaped by `\`.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn insert_fact(conn: &Connection, fact: &MemoryFact) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO memory_facts
             (id, fact, category, lifecycle_type, importance, timestamp, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            fact.id.to_string(),
            fact.fact,
            fact.category.as_str(),
            fact.lifecycle_type.as_str(),
            f64::from(fact.importance),
            format_timestamp(&fact.timestamp),
            fact.source.as_str(),
        ],
    )?;
    Ok(())
}

fn invalid_text(col: usize, value: String) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(col, value, rusqlite::types::Type::Text)
}

fn parse_id(col: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|_| invalid_text(col, raw))
}

fn parse_timestamp(col: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|_| invalid_text(col, raw))
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryFact> {
    let id = parse_id(0, row.get(0)?)?;
    let fact: String = row.get(1)?;
    let category_str: String = row.get(2)?;
    let lifecycle_str: String = row.get(3)?;
    let importance: f64 = row.get(4)?;
    let timestamp = parse_timestamp(5, row.get(5)?)?;
    let source_str: String = row.get(6)?;

    let category =
        FactCategory::parse(&category_str).ok_or_else(|| invalid_text(2, category_str))?;
    let lifecycle_type =
        LifecycleType::parse(&lifecycle_str).ok_or_else(|| invalid_text(3, lifecycle_str))?;
    let source = FactSource::parse(&source_str).ok_or_else(|| invalid_text(6, source_str))?;

    Ok(MemoryFact {
        id,
        fact,
        category,
        lifecycle_type,
        importance: importance as f32,
        timestamp,
        source,
    })
}

fn row_to_relation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        id: parse_id(0, row.get(0)?)?,
        source: row.get(1)?,
        predicate: row.get(2)?,
        target: row.get(3)?,
        timestamp: parse_timestamp(4, row.get(4)?)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
