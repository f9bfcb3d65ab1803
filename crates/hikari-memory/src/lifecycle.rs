//! Memory Lifecycle Manager.
//!
//! Sits on top of the [`FactStore`] and decides what gets remembered, when
//! short-term facts are promoted, and when the long-term tier is compressed.
//!
//! ## Lifecycle
//!
//! ```text
//!   record_turn ──► short_term ──(organize_short_term)──► long_term
//!                                                            │
//!                       organize_memories (≥ threshold) ◄────┘
//!                       replaces the whole tier with summaries
//! ```
//!
//! A fact only ever moves `short_term -> long_term`; it leaves the long-term
//! tier only by deletion or consolidation.
//!
//! ## Single writer
//!
//! The store sits behind an async [`Mutex`]. Every check-then-write sequence
//! (duplicate check + insert, promotion, consolidation replacement) runs while
//! holding it, so two concurrent recordings of the same text cannot both pass
//! the duplicate check. Oracle calls are made with the lock released.
//!
//! ## Oracle failures
//!
//! Every oracle-dependent step has a deterministic local fallback:
//!
//! | step             | fallback                                          |
//! |------------------|---------------------------------------------------|
//! | single-turn fact | nothing recorded                                  |
//! | relations        | nothing recorded                                  |
//! | keep-selection   | promote the oldest ⌊ratio × N⌋ short-term facts   |
//! | summarisation    | long-term tier left untouched                     |
//! | batch extraction | nothing recorded                                  |

use std::sync::Arc;

use hikari_types::{
    ConversationTurn, Exchange, FactCandidate, FactCategory, FactSource, FactUpdate,
    LifecycleType, MemoryFact, NewFact, NumberedFact, TurnRole, clamp_importance,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fact_store::{FactStore, FactStoreError};
use crate::oracle::Oracle;

/// Maximum character-length difference for the containment duplicate rule.
pub const CONTAINMENT_MAX_LEN_DIFF: usize = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Thresholds that drive promotion and consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Short-term count at which promotion runs.
    #[serde(default = "default_short_term_floor")]
    pub short_term_floor: usize,
    /// Long-term count at which consolidation runs.
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: usize,
    /// Share of short-term facts promoted when keep-selection fails.
    #[serde(default = "default_promotion_fallback_ratio")]
    pub promotion_fallback_ratio: f64,
    /// Maximum facts written per history batch.
    #[serde(default = "default_batch_extraction_limit")]
    pub batch_extraction_limit: usize,
    /// Importance given to consolidated summaries.
    #[serde(default = "default_summary_importance")]
    pub summary_importance: f32,
    /// Maximum summaries kept from one consolidation.
    #[serde(default = "default_max_summaries")]
    pub max_summaries: usize,
}

fn default_short_term_floor() -> usize {
    5
}
fn default_consolidation_threshold() -> usize {
    8
}
fn default_promotion_fallback_ratio() -> f64 {
    0.4
}
fn default_batch_extraction_limit() -> usize {
    5
}
fn default_summary_importance() -> f32 {
    0.8
}
fn default_max_summaries() -> usize {
    5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_floor: default_short_term_floor(),
            consolidation_threshold: default_consolidation_threshold(),
            promotion_fallback_ratio: default_promotion_fallback_ratio(),
            batch_extraction_limit: default_batch_extraction_limit(),
            summary_importance: default_summary_importance(),
            max_summaries: default_max_summaries(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a single-turn recording attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The recording policy chose not to record this turn.
    Skipped,
    /// The oracle found nothing worth remembering.
    NothingExtracted,
    /// The candidate matched an existing fact.
    Duplicate,
    /// The oracle call failed; nothing was written.
    OracleFailed,
    Recorded(MemoryFact),
}

/// Result of [`MemoryManager::organize_short_term`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionReport {
    /// Short-term facts present when the pass started.
    pub considered: usize,
    pub promoted: usize,
    /// Whether the deterministic fallback was used.
    pub used_fallback: bool,
}

/// Result of [`MemoryManager::organize_memories`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub promotion: PromotionReport,
    pub summaries_written: usize,
    pub long_term_removed: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Duplicate rule
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `candidate` duplicates `existing`.
///
/// True when the texts are identical, or when one contains the other and
/// their lengths (in characters) differ by at most
/// [`CONTAINMENT_MAX_LEN_DIFF`].
pub fn is_near_duplicate(candidate: &str, existing: &str) -> bool {
    if candidate == existing {
        return true;
    }
    let contains = candidate.contains(existing) || existing.contains(candidate);
    if !contains {
        return false;
    }
    let a = candidate.chars().count();
    let b = existing.chars().count();
    a.abs_diff(b) <= CONTAINMENT_MAX_LEN_DIFF
}

fn is_duplicate_in(store: &FactStore, candidate: &str) -> Result<bool, FactStoreError> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return Ok(false);
    }
    Ok(store
        .list_all()?
        .iter()
        .any(|f| is_near_duplicate(candidate, f.fact.trim())))
}

/// Pair each user message with the next assistant message that carries text.
///
/// Assistant messages holding only a sticker are skipped over.
pub fn pair_exchanges(turns: &[ConversationTurn]) -> Vec<Exchange> {
    let mut pairs = Vec::new();
    for (i, turn) in turns.iter().enumerate() {
        if turn.role != TurnRole::User {
            continue;
        }
        let Some(user_text) = turn.non_empty_text() else {
            continue;
        };
        let reply = turns[i + 1..]
            .iter()
            .filter(|t| t.role == TurnRole::Assistant)
            .find_map(|t| t.non_empty_text());
        if let Some(agent_text) = reply {
            pairs.push(Exchange {
                user_text: user_text.to_string(),
                agent_text: agent_text.to_string(),
                time_context: None,
            });
        }
    }
    pairs
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryManager
// ─────────────────────────────────────────────────────────────────────────────

/// Applies the recording, promotion and consolidation policies.
pub struct MemoryManager {
    store: Arc<Mutex<FactStore>>,
    oracle: Arc<dyn Oracle>,
    config: MemoryConfig,
    rng: std::sync::Mutex<fastrand::Rng>,
}

impl MemoryManager {
    pub fn new(
        store: Arc<Mutex<FactStore>>,
        oracle: Arc<dyn Oracle>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            config,
            rng: std::sync::Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Replace the random source used by [`Self::should_record`].
    pub fn with_rng(mut self, rng: fastrand::Rng) -> Self {
        self.rng = std::sync::Mutex::new(rng);
        self
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> Arc<Mutex<FactStore>> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ── recording ────────────────────────────────────────────────────────────

    /// Recording decision for a turn: always on even turns, a coin flip on
    /// odd ones. At least one of any two consecutive turns is recorded.
    pub fn should_record(&self, turn_count: u64) -> bool {
        if turn_count % 2 == 0 {
            return true;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.bool()
    }

    /// Whether `candidate` duplicates any short-term or long-term fact.
    ///
    /// A blank candidate never counts as a duplicate.
    pub async fn is_duplicate(&self, candidate: &str) -> Result<bool, FactStoreError> {
        let store = self.store.lock().await;
        is_duplicate_in(&store, candidate)
    }

    /// Ask the oracle for a fact from this exchange and record it as
    /// short-term if the policy allows and it is not a duplicate.
    #[tracing::instrument(skip(self, exchange), fields(turn = turn_count))]
    pub async fn record_turn(
        &self,
        turn_count: u64,
        exchange: &Exchange,
    ) -> Result<RecordOutcome, FactStoreError> {
        if !self.should_record(turn_count) {
            debug!("recording skipped for this turn");
            return Ok(RecordOutcome::Skipped);
        }
        let candidate = match self.oracle.extract_fact(exchange).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "fact extraction failed; nothing recorded");
                return Ok(RecordOutcome::OracleFailed);
            }
        };
        self.record_candidate(candidate, FactSource::Conversation).await
    }

    /// Dedup-and-insert path for a candidate the caller already holds.
    pub async fn record_candidate(
        &self,
        candidate: FactCandidate,
        source: FactSource,
    ) -> Result<RecordOutcome, FactStoreError> {
        let Some(text) = candidate
            .fact
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return Ok(RecordOutcome::NothingExtracted);
        };

        let store = self.store.lock().await;
        if is_duplicate_in(&store, text)? {
            debug!(fact = text, "duplicate fact dropped");
            return Ok(RecordOutcome::Duplicate);
        }
        let fact = store.add_fact(NewFact {
            fact: text.to_string(),
            category: candidate.category,
            lifecycle_type: LifecycleType::ShortTerm,
            importance: clamp_importance(candidate.importance),
            source,
        })?;
        info!(id = %fact.id, category = fact.category.as_str(), "short-term fact recorded");
        Ok(RecordOutcome::Recorded(fact))
    }

    /// Extract entity relationships from an exchange and store them.
    /// Returns the number of new edges; edges already stored are not counted.
    pub async fn record_relations(&self, exchange: &Exchange) -> Result<usize, FactStoreError> {
        let extraction = match self.oracle.extract_relations(exchange).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "relation extraction failed; nothing recorded");
                return Ok(0);
            }
        };
        let store = self.store.lock().await;
        let mut written = 0;
        for rel in extraction.relationships {
            let (source, kind, target) = (rel.source.trim(), rel.kind.trim(), rel.target.trim());
            if source.is_empty() || kind.is_empty() || target.is_empty() {
                continue;
            }
            if store.add_relation(source, kind, target)?.is_some() {
                written += 1;
            }
        }
        debug!(written, "relations recorded");
        Ok(written)
    }

    // ── manual edits ─────────────────────────────────────────────────────────

    /// Insert a fact exactly as given, bypassing the recording policy.
    pub async fn add_manual_fact(&self, new: NewFact) -> Result<MemoryFact, FactStoreError> {
        self.store.lock().await.add_fact(new)
    }

    /// Rewrite a fact's text, category or importance. Unknown ids are a no-op.
    pub async fn edit_fact(&self, id: Uuid, changes: FactUpdate) -> Result<bool, FactStoreError> {
        self.store.lock().await.update(id, changes)
    }

    pub async fn remove_fact(&self, id: Uuid) -> Result<bool, FactStoreError> {
        self.store.lock().await.delete(id)
    }

    // ── promotion ────────────────────────────────────────────────────────────

    /// Promote the short-term facts the oracle wants to keep.
    ///
    /// Runs only once the short-term tier holds at least
    /// `short_term_floor` facts. Facts that are not selected stay short-term.
    #[tracing::instrument(skip(self))]
    pub async fn organize_short_term(&self) -> Result<PromotionReport, FactStoreError> {
        let short_term = self
            .store
            .lock()
            .await
            .list_in_insertion_order(LifecycleType::ShortTerm)?;

        let considered = short_term.len();
        if considered < self.config.short_term_floor {
            return Ok(PromotionReport {
                considered,
                ..Default::default()
            });
        }

        let numbered: Vec<NumberedFact> = short_term
            .iter()
            .enumerate()
            .map(|(i, f)| NumberedFact {
                index: i + 1,
                fact: f.fact.clone(),
                importance: f.importance,
            })
            .collect();

        let (selected, used_fallback) = match self.oracle.select_keep(&numbered).await {
            Ok(indices) => {
                let mut ids: Vec<Uuid> = indices
                    .into_iter()
                    .filter(|i| (1..=considered).contains(i))
                    .map(|i| short_term[i - 1].id)
                    .collect();
                ids.dedup();
                (ids, false)
            }
            Err(e) => {
                let count =
                    (considered as f64 * self.config.promotion_fallback_ratio).floor() as usize;
                warn!(error = %e, count, "keep-selection failed; promoting oldest facts");
                (short_term.iter().take(count).map(|f| f.id).collect(), true)
            }
        };

        let store = self.store.lock().await;
        let mut promoted = 0;
        for id in selected {
            if store.promote(id)? {
                promoted += 1;
            }
        }
        info!(considered, promoted, used_fallback, "short-term facts organised");
        Ok(PromotionReport {
            considered,
            promoted,
            used_fallback,
        })
    }

    // ── consolidation ────────────────────────────────────────────────────────

    /// Promote, then compress the long-term tier into a few summaries once it
    /// reaches `consolidation_threshold`.
    ///
    /// The summarised facts are replaced in one transaction only when at
    /// least one non-empty summary came back; otherwise the tier is untouched.
    #[tracing::instrument(skip(self))]
    pub async fn organize_memories(&self) -> Result<ConsolidationReport, FactStoreError> {
        let promotion = self.organize_short_term().await?;
        let mut report = ConsolidationReport {
            promotion,
            ..Default::default()
        };

        let long_term = self
            .store
            .lock()
            .await
            .list_by_lifecycle_type(LifecycleType::LongTerm)?;
        if long_term.len() < self.config.consolidation_threshold {
            return Ok(report);
        }

        let summaries = match self.oracle.summarize(&long_term).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "summarisation failed; long-term facts kept");
                return Ok(report);
            }
        };
        let replacements: Vec<NewFact> = summaries
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .take(self.config.max_summaries)
            .map(|s| {
                NewFact::long_term_system(
                    s,
                    FactCategory::SharedEvent,
                    self.config.summary_importance,
                )
            })
            .collect();
        if replacements.is_empty() {
            warn!("summarisation returned nothing; long-term facts kept");
            return Ok(report);
        }

        let remove: Vec<Uuid> = long_term.iter().map(|f| f.id).collect();
        let written = self.store.lock().await.replace_facts(&remove, replacements)?;
        report.summaries_written = written.len();
        report.long_term_removed = remove.len();
        info!(
            removed = report.long_term_removed,
            written = report.summaries_written,
            "long-term memories consolidated"
        );
        Ok(report)
    }

    // ── batch extraction ─────────────────────────────────────────────────────

    /// Extract facts from a stored chat history and write them as long-term.
    ///
    /// Unlike [`Self::record_turn`] this path does not run the duplicate
    /// check, so it can re-record facts already captured turn by turn.
    #[tracing::instrument(skip(self, turns), fields(messages = turns.len()))]
    pub async fn extract_from_history(
        &self,
        turns: &[ConversationTurn],
    ) -> Result<usize, FactStoreError> {
        let pairs = pair_exchanges(turns);
        if pairs.is_empty() {
            return Ok(0);
        }
        let candidates = match self.oracle.extract_batch(&pairs).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "history extraction failed; nothing recorded");
                return Ok(0);
            }
        };

        let store = self.store.lock().await;
        let mut written = 0;
        for candidate in candidates
            .into_iter()
            .filter(|c| c.fact.as_deref().is_some_and(|t| !t.trim().is_empty()))
            .take(self.config.batch_extraction_limit)
        {
            let text = candidate.fact.as_deref().unwrap_or_default().trim();
            store.add_fact(NewFact::long_term_system(
                text,
                candidate.category,
                candidate.importance,
            ))?;
            written += 1;
        }
        info!(pairs = pairs.len(), written, "history facts extracted");
        Ok(written)
    }
}


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use hikari_types::{EntityExtraction, ExtractedRelationship};

    /// Oracle with canned replies; every call fails unless scripted.
    struct ScriptedOracle {
        fact: Result<FactCandidate, OracleError>,
        relations: Result<EntityExtraction, OracleError>,
        batch: Result<Vec<FactCandidate>, OracleError>,
        keep: Result<Vec<usize>, OracleError>,
        summaries: Result<Vec<String>, OracleError>,
        seen_batch: std::sync::Mutex<Vec<Exchange>>,
        seen_keep: std::sync::Mutex<Vec<NumberedFact>>,
    }

    fn down() -> OracleError {
        OracleError::Unavailable("offline".to_string())
    }

    impl Default for ScriptedOracle {
        fn default() -> Self {
            Self {
                fact: Err(down()),
                relations: Err(down()),
                batch: Err(down()),
                keep: Err(down()),
                summaries: Err(down()),
                seen_batch: std::sync::Mutex::new(Vec::new()),
                seen_keep: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn extract_fact(&self, _exchange: &Exchange) -> Result<FactCandidate, OracleError> {
            self.fact.clone()
        }
        async fn extract_relations(
            &self,
            _exchange: &Exchange,
        ) -> Result<EntityExtraction, OracleError> {
            self.relations.clone()
        }
        async fn extract_batch(
            &self,
            exchanges: &[Exchange],
        ) -> Result<Vec<FactCandidate>, OracleError> {
            self.seen_batch.lock().unwrap().extend_from_slice(exchanges);
            self.batch.clone()
        }
        async fn select_keep(&self, facts: &[NumberedFact]) -> Result<Vec<usize>, OracleError> {
            self.seen_keep.lock().unwrap().extend_from_slice(facts);
            self.keep.clone()
        }
        async fn summarize(&self, _facts: &[MemoryFact]) -> Result<Vec<String>, OracleError> {
            self.summaries.clone()
        }
    }

    fn candidate(text: &str) -> FactCandidate {
        FactCandidate {
            fact: Some(text.to_string()),
            category: FactCategory::UserInfo,
            importance: 0.6,
        }
    }

    fn exchange() -> Exchange {
        Exchange {
            user_text: "I really can't stand cilantro".to_string(),
            agent_text: "Noted, no cilantro for you!".to_string(),
            time_context: None,
        }
    }

    fn manager_over(
        store: FactStore,
        oracle: ScriptedOracle,
    ) -> (MemoryManager, Arc<ScriptedOracle>) {
        let oracle = Arc::new(oracle);
        let manager = MemoryManager::new(
            Arc::new(Mutex::new(store)),
            oracle.clone(),
            MemoryConfig::default(),
        )
        .with_rng(fastrand::Rng::with_seed(7));
        (manager, oracle)
    }

    fn manager_with(oracle: ScriptedOracle) -> (MemoryManager, Arc<ScriptedOracle>) {
        manager_over(FactStore::open_in_memory().unwrap(), oracle)
    }

    async fn seed(manager: &MemoryManager, tier: LifecycleType, n: usize) -> Vec<MemoryFact> {
        let mut out = Vec::new();
        for i in 0..n {
            let new = NewFact {
                fact: format!("fact number {i}"),
                category: FactCategory::UserInfo,
                lifecycle_type: tier,
                importance: 0.5,
                source: FactSource::Conversation,
            };
            out.push(manager.add_manual_fact(new).await.unwrap());
        }
        out
    }

    async fn count(manager: &MemoryManager, tier: LifecycleType) -> usize {
        manager
            .store()
            .lock()
            .await
            .list_by_lifecycle_type(tier)
            .unwrap()
            .len()
    }

    async fn tier_of(manager: &MemoryManager, fact: &MemoryFact) -> LifecycleType {
        manager
            .store()
            .lock()
            .await
            .get(fact.id)
            .unwrap()
            .unwrap()
            .lifecycle_type
    }

    fn rel(source: &str, kind: &str, target: &str) -> ExtractedRelationship {
        ExtractedRelationship {
            source: source.to_string(),
            kind: kind.to_string(),
            target: target.to_string(),
        }
    }

    // ── duplicate rule ───────────────────────────────────────────────────────

    #[test]
    fn identical_text_is_duplicate() {
        assert!(is_near_duplicate("Likes jazz", "Likes jazz"));
    }

    #[test]
    fn short_containment_is_duplicate() {
        assert!(is_near_duplicate("香菜", "讨厌香菜"));
        assert!(is_near_duplicate("讨厌香菜", "香菜"));
        assert!(is_near_duplicate("Likes jazz", "Likes jazz!!"));
    }

    #[test]
    fn long_containment_is_not_duplicate() {
        assert!(!is_near_duplicate("不喜欢吃韭菜和香菜这类蔬菜", "香菜"));
        assert!(!is_near_duplicate("jazz", "Likes jazz"));
    }

    #[test]
    fn unrelated_text_is_not_duplicate() {
        assert!(!is_near_duplicate("Likes jazz", "Owns a bike"));
    }

    #[tokio::test]
    async fn dedup_scenario_with_store() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let first = manager
            .record_candidate(candidate("讨厌香菜"), FactSource::Conversation)
            .await
            .unwrap();
        assert!(matches!(first, RecordOutcome::Recorded(_)));

        let second = manager
            .record_candidate(candidate("香菜"), FactSource::Conversation)
            .await
            .unwrap();
        assert_eq!(second, RecordOutcome::Duplicate);

        let third = manager
            .record_candidate(
                candidate("不喜欢吃韭菜和香菜这类蔬菜"),
                FactSource::Conversation,
            )
            .await
            .unwrap();
        assert!(matches!(third, RecordOutcome::Recorded(_)));
        assert_eq!(count(&manager, LifecycleType::ShortTerm).await, 2);
    }

    #[tokio::test]
    async fn duplicate_check_covers_long_term() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        manager
            .add_manual_fact(NewFact::long_term_system(
                "Plays violin",
                FactCategory::UserInfo,
                0.5,
            ))
            .await
            .unwrap();
        assert!(manager.is_duplicate("Plays violin").await.unwrap());
        assert!(!manager.is_duplicate("Plays the cello at weekends").await.unwrap());
    }

    #[tokio::test]
    async fn blank_candidate_is_never_duplicate() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        manager
            .add_manual_fact(NewFact::short_term("猫", FactCategory::UserInfo, 0.5))
            .await
            .unwrap();
        assert!(!manager.is_duplicate("").await.unwrap());
        assert!(!manager.is_duplicate("   ").await.unwrap());
        assert!(manager.is_duplicate("猫").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_recordings_cannot_both_insert() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let c = candidate("Collects vinyl records");
                m.record_candidate(c, FactSource::Conversation)
                    .await
                    .unwrap()
            }));
        }
        let mut recorded = 0;
        for h in handles {
            if matches!(h.await.unwrap(), RecordOutcome::Recorded(_)) {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(count(&manager, LifecycleType::ShortTerm).await, 1);
    }

    // ── recording policy ─────────────────────────────────────────────────────

    #[test]
    fn even_turns_always_record() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        for turn in (0..200).step_by(2) {
            assert!(manager.should_record(turn));
        }
    }

    #[test]
    fn odd_turns_record_sometimes() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let hits = (0..400u64)
            .map(|i| i * 2 + 1)
            .filter(|t| manager.should_record(*t))
            .count();
        assert!((101..300).contains(&hits), "expected about half, got {hits}");
    }

    #[tokio::test]
    async fn record_turn_writes_short_term_conversation_fact() {
        let (manager, _) = manager_with(ScriptedOracle {
            fact: Ok(FactCandidate {
                fact: Some("  Hates cilantro ".to_string()),
                category: FactCategory::UserInfo,
                importance: 1.4,
            }),
            ..Default::default()
        });
        let outcome = manager.record_turn(2, &exchange()).await.unwrap();
        let RecordOutcome::Recorded(fact) = outcome else {
            panic!("expected a recorded fact, got {outcome:?}");
        };
        assert_eq!(fact.fact, "Hates cilantro");
        assert_eq!(fact.lifecycle_type, LifecycleType::ShortTerm);
        assert_eq!(fact.source, FactSource::Conversation);
        assert_eq!(fact.importance, 1.0);
    }

    #[tokio::test]
    async fn record_turn_null_fact_records_nothing() {
        let (manager, _) = manager_with(ScriptedOracle {
            fact: Ok(FactCandidate {
                fact: None,
                category: FactCategory::UserInfo,
                importance: 0.1,
            }),
            ..Default::default()
        });
        let outcome = manager.record_turn(4, &exchange()).await.unwrap();
        assert_eq!(outcome, RecordOutcome::NothingExtracted);
        assert_eq!(count(&manager, LifecycleType::ShortTerm).await, 0);
    }

    #[tokio::test]
    async fn record_turn_oracle_failure_is_skipped() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let outcome = manager.record_turn(0, &exchange()).await.unwrap();
        assert_eq!(outcome, RecordOutcome::OracleFailed);
        assert_eq!(count(&manager, LifecycleType::ShortTerm).await, 0);
    }

    #[tokio::test]
    async fn offline_event_candidates_keep_their_source() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let outcome = manager
            .record_candidate(
                candidate("Went to the aquarium alone"),
                FactSource::OfflineEvent,
            )
            .await
            .unwrap();
        let RecordOutcome::Recorded(fact) = outcome else {
            panic!("expected a recorded fact");
        };
        assert_eq!(fact.source, FactSource::OfflineEvent);
    }

    // ── relations ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn relations_are_stored_and_blank_ones_dropped() {
        let (manager, _) = manager_with(ScriptedOracle {
            relations: Ok(EntityExtraction {
                entities: vec!["User".to_string(), "cilantro".to_string()],
                relationships: vec![rel("User", "DISLIKES", "cilantro"), rel("User", "", "x")],
            }),
            ..Default::default()
        });
        assert_eq!(manager.record_relations(&exchange()).await.unwrap(), 1);
        let stored = manager
            .store()
            .lock()
            .await
            .relations_for_entity("cilantro")
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].predicate, "DISLIKES");
    }

    #[tokio::test]
    async fn repeated_extraction_does_not_duplicate_edges() {
        let (manager, _) = manager_with(ScriptedOracle {
            relations: Ok(EntityExtraction {
                entities: vec!["User".to_string(), "cilantro".to_string()],
                relationships: vec![
                    rel("User", "DISLIKES", "cilantro"),
                    rel(" User ", "DISLIKES", "cilantro"),
                ],
            }),
            ..Default::default()
        });
        assert_eq!(manager.record_relations(&exchange()).await.unwrap(), 1);
        assert_eq!(manager.record_relations(&exchange()).await.unwrap(), 0);
        assert_eq!(manager.record_relations(&exchange()).await.unwrap(), 0);

        let stats = manager.store().lock().await.stats().unwrap();
        assert_eq!(stats.relations, 1);
    }

    #[tokio::test]
    async fn relation_oracle_failure_writes_nothing() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        assert_eq!(manager.record_relations(&exchange()).await.unwrap(), 0);
    }

    // ── promotion ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn promotion_below_floor_is_noop() {
        let (manager, oracle) = manager_with(ScriptedOracle {
            keep: Ok(vec![1]),
            ..Default::default()
        });
        seed(&manager, LifecycleType::ShortTerm, 4).await;
        let report = manager.organize_short_term().await.unwrap();
        assert_eq!(
            report,
            PromotionReport {
                considered: 4,
                promoted: 0,
                used_fallback: false,
            }
        );
        assert!(oracle.seen_keep.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn promotion_follows_oracle_selection() {
        let (manager, oracle) = manager_with(ScriptedOracle {
            keep: Ok(vec![1, 3, 3, 42, 0]),
            ..Default::default()
        });
        let seeded = seed(&manager, LifecycleType::ShortTerm, 5).await;
        let report = manager.organize_short_term().await.unwrap();
        assert_eq!(report.promoted, 2);
        assert!(!report.used_fallback);

        let numbered = oracle.seen_keep.lock().unwrap().clone();
        assert_eq!(numbered[0].index, 1);
        assert_eq!(numbered[0].fact, "fact number 0");

        assert_eq!(tier_of(&manager, &seeded[0]).await, LifecycleType::LongTerm);
        assert_eq!(tier_of(&manager, &seeded[2]).await, LifecycleType::LongTerm);
        assert_eq!(
            tier_of(&manager, &seeded[1]).await,
            LifecycleType::ShortTerm
        );
    }

    #[tokio::test]
    async fn failing_oracle_promotes_oldest_forty_percent() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let seeded = seed(&manager, LifecycleType::ShortTerm, 9).await;
        let report = manager.organize_memories().await.unwrap();
        assert_eq!(report.promotion.promoted, 3);
        assert!(report.promotion.used_fallback);
        assert_eq!(count(&manager, LifecycleType::ShortTerm).await, 6);

        for fact in &seeded[..3] {
            assert_eq!(tier_of(&manager, fact).await, LifecycleType::LongTerm);
        }
        for fact in &seeded[3..] {
            assert_eq!(tier_of(&manager, fact).await, LifecycleType::ShortTerm);
        }
    }

    #[tokio::test]
    async fn fallback_promotes_by_insertion_order_not_timestamp() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("facts.db");
        let (manager, _) = manager_over(FactStore::open(&path).unwrap(), ScriptedOracle::default());
        let seeded = seed(&manager, LifecycleType::ShortTerm, 5).await;

        // Make the first two inserts look newest, as after a clock step back.
        let conn = rusqlite::Connection::open(&path).unwrap();
        for fact in &seeded[..2] {
            conn.execute(
                "UPDATE memory_facts SET timestamp = '2999-01-01T00:00:00.000000000Z'
                 WHERE id = ?1",
                rusqlite::params![fact.id.to_string()],
            )
            .unwrap();
        }

        let report = manager.organize_short_term().await.unwrap();
        assert!(report.used_fallback);
        assert_eq!(report.promoted, 2);
        assert_eq!(tier_of(&manager, &seeded[0]).await, LifecycleType::LongTerm);
        assert_eq!(tier_of(&manager, &seeded[1]).await, LifecycleType::LongTerm);
        for fact in &seeded[2..] {
            assert_eq!(tier_of(&manager, fact).await, LifecycleType::ShortTerm);
        }
    }

    #[tokio::test]
    async fn long_term_never_reverts() {
        let (manager, _) = manager_with(ScriptedOracle {
            keep: Ok(vec![]),
            ..Default::default()
        });
        let long = seed(&manager, LifecycleType::LongTerm, 2).await;
        seed(&manager, LifecycleType::ShortTerm, 5).await;
        manager.organize_memories().await.unwrap();
        let edit = FactUpdate {
            fact: Some("edited".to_string()),
            ..Default::default()
        };
        manager.edit_fact(long[0].id, edit).await.unwrap();
        for fact in &long {
            assert_eq!(tier_of(&manager, fact).await, LifecycleType::LongTerm);
        }
    }

    // ── consolidation ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn consolidation_replaces_whole_long_term_tier() {
        let summaries = vec![
            "Hates cilantro".to_string(),
            "Loves rainy walks".to_string(),
            "Has a cat named Mochi".to_string(),
            "Studies architecture".to_string(),
        ];
        let (manager, _) = manager_with(ScriptedOracle {
            summaries: Ok(summaries.clone()),
            ..Default::default()
        });
        let originals = seed(&manager, LifecycleType::LongTerm, 10).await;

        let report = manager.organize_memories().await.unwrap();
        assert_eq!(report.summaries_written, 4);
        assert_eq!(report.long_term_removed, 10);

        let long = manager
            .store()
            .lock()
            .await
            .list_by_lifecycle_type(LifecycleType::LongTerm)
            .unwrap();
        assert_eq!(long.len(), 4);
        for fact in &long {
            assert!(summaries.contains(&fact.fact));
            assert!(!originals.iter().any(|o| o.fact == fact.fact));
            assert_eq!(fact.category, FactCategory::SharedEvent);
            assert_eq!(fact.source, FactSource::System);
            assert!((fact.importance - 0.8).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn consolidation_with_empty_summaries_keeps_tier() {
        let (manager, _) = manager_with(ScriptedOracle {
            summaries: Ok(vec!["  ".to_string()]),
            ..Default::default()
        });
        seed(&manager, LifecycleType::LongTerm, 9).await;
        let report = manager.organize_memories().await.unwrap();
        assert_eq!(report.summaries_written, 0);
        assert_eq!(count(&manager, LifecycleType::LongTerm).await, 9);
    }

    #[tokio::test]
    async fn consolidation_with_failing_oracle_keeps_tier() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        seed(&manager, LifecycleType::LongTerm, 12).await;
        let report = manager.organize_memories().await.unwrap();
        assert_eq!(report.long_term_removed, 0);
        assert_eq!(count(&manager, LifecycleType::LongTerm).await, 12);
    }

    #[tokio::test]
    async fn consolidation_below_threshold_is_noop() {
        let (manager, _) = manager_with(ScriptedOracle {
            summaries: Ok(vec!["summary".to_string()]),
            ..Default::default()
        });
        seed(&manager, LifecycleType::LongTerm, 7).await;
        let report = manager.organize_memories().await.unwrap();
        assert_eq!(report.summaries_written, 0);
        assert_eq!(count(&manager, LifecycleType::LongTerm).await, 7);
    }

    #[tokio::test]
    async fn consolidation_caps_summary_count() {
        let many: Vec<String> = (0..9).map(|i| format!("summary {i}")).collect();
        let (manager, _) = manager_with(ScriptedOracle {
            summaries: Ok(many),
            ..Default::default()
        });
        seed(&manager, LifecycleType::LongTerm, 8).await;
        let report = manager.organize_memories().await.unwrap();
        assert_eq!(report.summaries_written, 5);
        assert_eq!(count(&manager, LifecycleType::LongTerm).await, 5);
    }

    // ── batch extraction ─────────────────────────────────────────────────────

    #[test]
    fn pairing_skips_sticker_only_replies() {
        let turns = vec![
            ConversationTurn::user("I got a puppy!"),
            ConversationTurn::assistant_sticker("sticker://happy"),
            ConversationTurn::assistant("Congratulations! What's its name?"),
            ConversationTurn::user("Bean"),
            ConversationTurn::assistant("Cute name."),
            ConversationTurn::user("no reply to this one"),
        ];
        let pairs = pair_exchanges(&turns);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].user_text, "I got a puppy!");
        assert_eq!(pairs[0].agent_text, "Congratulations! What's its name?");
        assert_eq!(pairs[1].agent_text, "Cute name.");
    }

    #[tokio::test]
    async fn empty_history_is_noop() {
        let (manager, oracle) = manager_with(ScriptedOracle {
            batch: Ok(vec![candidate("never used")]),
            ..Default::default()
        });
        let turns = vec![ConversationTurn::assistant("hello?")];
        assert_eq!(manager.extract_from_history(&turns).await.unwrap(), 0);
        assert!(oracle.seen_batch.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_extraction_writes_long_term_system_facts_without_dedup() {
        let batch: Vec<FactCandidate> = (0..7)
            .map(|i| candidate(&format!("history fact {i}")))
            .collect();
        let (manager, _) = manager_with(ScriptedOracle {
            batch: Ok(batch),
            ..Default::default()
        });
        manager
            .add_manual_fact(NewFact::short_term("history fact 0", FactCategory::UserInfo, 0.5))
            .await
            .unwrap();

        let turns = vec![
            ConversationTurn::user("hi"),
            ConversationTurn::assistant("hello"),
        ];
        let written = manager.extract_from_history(&turns).await.unwrap();
        assert_eq!(written, 5);

        let long = manager
            .store()
            .lock()
            .await
            .list_by_lifecycle_type(LifecycleType::LongTerm)
            .unwrap();
        assert_eq!(long.len(), 5);
        assert!(long.iter().all(|f| f.source == FactSource::System));
        // "history fact 0" now exists in both tiers.
        assert!(long.iter().any(|f| f.fact == "history fact 0"));
    }

    #[tokio::test]
    async fn history_extraction_oracle_failure_returns_zero() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let turns = vec![
            ConversationTurn::user("hi"),
            ConversationTurn::assistant("hello"),
        ];
        assert_eq!(manager.extract_from_history(&turns).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_edit_and_remove() {
        let (manager, _) = manager_with(ScriptedOracle::default());
        let fact = manager
            .add_manual_fact(NewFact::short_term("Lives in Osaka", FactCategory::UserInfo, 0.7))
            .await
            .unwrap();
        let edit = FactUpdate {
            fact: Some("Lives in Kyoto".to_string()),
            ..Default::default()
        };
        assert!(manager.edit_fact(fact.id, edit).await.unwrap());
        assert!(!manager.edit_fact(Uuid::new_v4(), FactUpdate::default()).await.unwrap());
        assert!(manager.remove_fact(fact.id).await.unwrap());
        assert!(!manager.remove_fact(fact.id).await.unwrap());
    }
}
