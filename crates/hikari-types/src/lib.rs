use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Who or what a remembered fact is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    /// Something about the user (preferences, biography, habits).
    UserInfo,
    /// Something the agent said about itself.
    AgentInfo,
    /// Something the user and the agent experienced together.
    SharedEvent,
}

impl FactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactCategory::UserInfo => "user_info",
            FactCategory::AgentInfo => "agent_info",
            FactCategory::SharedEvent => "shared_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_info" => Some(FactCategory::UserInfo),
            "agent_info" => Some(FactCategory::AgentInfo),
            "shared_event" => Some(FactCategory::SharedEvent),
            _ => None,
        }
    }
}

/// Retention tier of a fact. Only `ShortTerm -> LongTerm` is ever allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleType {
    ShortTerm,
    LongTerm,
}

impl LifecycleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleType::ShortTerm => "short_term",
            LifecycleType::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short_term" => Some(LifecycleType::ShortTerm),
            "long_term" => Some(LifecycleType::LongTerm),
            _ => None,
        }
    }
}

/// Where a fact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    Conversation,
    OfflineEvent,
    System,
}

impl FactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactSource::Conversation => "conversation",
            FactSource::OfflineEvent => "offline_event",
            FactSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conversation" => Some(FactSource::Conversation),
            "offline_event" => Some(FactSource::OfflineEvent),
            "system" => Some(FactSource::System),
            _ => None,
        }
    }
}

/// Clamp an importance score into `[0.0, 1.0]`. NaN maps to `0.0`.
pub fn clamp_importance(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// A short persisted statement about the user or the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub id: Uuid,
    pub fact: String,
    pub category: FactCategory,
    pub lifecycle_type: LifecycleType,
    /// Always within `[0.0, 1.0]`.
    pub importance: f32,
    pub timestamp: DateTime<Utc>,
    pub source: FactSource,
}

/// The caller-supplied part of a [`MemoryFact`]; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFact {
    pub fact: String,
    pub category: FactCategory,
    pub lifecycle_type: LifecycleType,
    pub importance: f32,
    pub source: FactSource,
}

impl NewFact {
    /// A short-term fact recorded from live conversation.
    pub fn short_term(fact: impl Into<String>, category: FactCategory, importance: f32) -> Self {
        Self {
            fact: fact.into(),
            category,
            lifecycle_type: LifecycleType::ShortTerm,
            importance: clamp_importance(importance),
            source: FactSource::Conversation,
        }
    }

    /// A long-term fact written by the system itself (summaries, bulk import).
    pub fn long_term_system(
        fact: impl Into<String>,
        category: FactCategory,
        importance: f32,
    ) -> Self {
        Self {
            fact: fact.into(),
            category,
            lifecycle_type: LifecycleType::LongTerm,
            importance: clamp_importance(importance),
            source: FactSource::System,
        }
    }
}

/// Partial update applied by a user edit. `None` fields are left untouched.
///
/// There is deliberately no lifecycle field: tier changes only happen
/// through promotion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactUpdate {
    pub fact: Option<String>,
    pub category: Option<FactCategory>,
    pub importance: Option<f32>,
}

/// A directed labelled edge between two free-text entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: Uuid,
    pub source: String,
    pub predicate: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

/// Closed set of sticker kinds the cache knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickerCategory {
    HikariEmotion,
    HikariAction,
    UserPortrait,
    Scene,
    Gift,
    Meme,
}

impl StickerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StickerCategory::HikariEmotion => "hikari_emotion",
            StickerCategory::HikariAction => "hikari_action",
            StickerCategory::UserPortrait => "user_portrait",
            StickerCategory::Scene => "scene",
            StickerCategory::Gift => "gift",
            StickerCategory::Meme => "meme",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hikari_emotion" => Some(StickerCategory::HikariEmotion),
            "hikari_action" => Some(StickerCategory::HikariAction),
            "user_portrait" => Some(StickerCategory::UserPortrait),
            "scene" => Some(StickerCategory::Scene),
            "gift" => Some(StickerCategory::Gift),
            "meme" => Some(StickerCategory::Meme),
            _ => None,
        }
    }
}

/// A generated sticker kept for reuse by descriptor similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub id: Uuid,
    pub category: StickerCategory,
    pub descriptor: String,
    /// Opaque image bytes or an encoded reference.
    pub payload: Vec<u8>,
    /// L2-normalised hashed-bigram fingerprint.
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    /// Never decreases.
    pub usage_count: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Oracle wire shapes
// ─────────────────────────────────────────────────────────────────────────────

/// One `(user, agent)` exchange handed to the oracle for extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub user_text: String,
    pub agent_text: String,
    /// Free-form time hint such as "Saturday evening".
    pub time_context: Option<String>,
}

/// A single candidate fact proposed by the oracle. `fact: null` means
/// nothing worth remembering was said.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FactCandidate {
    pub fact: Option<String>,
    pub category: FactCategory,
    pub importance: f32,
}

/// Directed relationship proposed by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedRelationship {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
}

/// Entity/relationship extraction result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EntityExtraction {
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

/// Batch-extraction reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchExtraction {
    #[serde(default)]
    pub facts: Vec<FactCandidate>,
}

/// Entry of the numbered list sent for keep-selection. `index` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberedFact {
    pub index: usize,
    pub fact: String,
    pub importance: f32,
}

/// Keep-selection reply: 1-based indices into the numbered list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeepSelection {
    pub keep: Vec<usize>,
}

/// Summarisation reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SummaryReply {
    pub summaries: Vec<String>,
}

/// Speaker of a stored chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One message of a chat history as fed to batch extraction.
///
/// Assistant messages may carry only a sticker reference and no text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: Option<String>,
    pub sticker: Option<String>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: Some(text.into()),
            sticker: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: Some(text.into()),
            sticker: None,
        }
    }

    pub fn assistant_sticker(reference: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: None,
            sticker: Some(reference.into()),
        }
    }

    /// The message text, if it carries any non-blank text.
    pub fn non_empty_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Cross-crate error used by the runtime facade.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum HikariError {
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Oracle failure: {0}")]
    Oracle(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
