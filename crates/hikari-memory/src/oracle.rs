//! The generation-oracle seam.
//!
//! The memory core never talks to a language model itself. Everything that
//! needs text understanding goes through the [`Oracle`] trait: candidate fact
//! extraction, entity/relationship extraction, keep-selection for promotion
//! and long-term summarisation.
//!
//! [`PromptedOracle`] is the stock implementation for chat-style models. It
//! owns the prompts, requests structured output with [`response_schema`] and
//! parses whatever comes back with [`parse_reply`]. The transport is a
//! [`CompletionBackend`] supplied by the caller.

use async_trait::async_trait;
use hikari_types::{
    BatchExtraction, EntityExtraction, Exchange, FactCandidate, KeepSelection, MemoryFact,
    NumberedFact, SummaryReply,
};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Errors an oracle call can produce.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The call could not be made or did not complete.
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
    /// The call completed but the reply could not be understood.
    #[error("Malformed oracle reply: {0}")]
    Malformed(String),
}

/// The external text-understanding collaborator.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Propose at most one fact worth remembering from a single exchange.
    async fn extract_fact(&self, exchange: &Exchange) -> Result<FactCandidate, OracleError>;

    /// Extract entities and directed relationships from a single exchange.
    async fn extract_relations(
        &self,
        exchange: &Exchange,
    ) -> Result<EntityExtraction, OracleError>;

    /// Extract candidate facts from a batch of past exchanges.
    async fn extract_batch(
        &self,
        exchanges: &[Exchange],
    ) -> Result<Vec<FactCandidate>, OracleError>;

    /// Choose which numbered short-term facts are worth keeping.
    /// Returns 1-based indices into `facts`.
    async fn select_keep(&self, facts: &[NumberedFact]) -> Result<Vec<usize>, OracleError>;

    /// Compress the given long-term facts into a handful of short summaries.
    async fn summarize(&self, facts: &[MemoryFact]) -> Result<Vec<String>, OracleError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a raw model reply into `T`.
///
/// Accepts bare JSON or JSON wrapped in a Markdown code fence, with any prose
/// before the first `{` / `[` ignored.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T, OracleError> {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }
    let start = body
        .find(['{', '['])
        .ok_or_else(|| OracleError::Malformed(preview(raw)))?;
    serde_json::from_str(&body[start..])
        .map_err(|e| OracleError::Malformed(format!("{e}: {}", preview(raw))))
}

/// JSON Schema of `T`, for backends that can request structured output.
pub fn response_schema<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(serde_json::Value::Null)
}

fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

const FACT_EXTRACTION_PROMPT: &str = "\
You maintain the long-term memory of a companion character. Read one exchange \
between the user and the character and decide whether it reveals one durable \
fact worth remembering (a preference, a personal detail, a shared plan or \
event). Reply with JSON: {\"fact\": string or null, \"category\": \
\"user_info\" | \"agent_info\" | \"shared_event\", \"importance\": 0.0 to 1.0}. \
Use null when nothing is worth remembering.";

const ENTITY_EXTRACTION_PROMPT: &str = "\
Extract the named entities mentioned in the exchange and the directed \
relationships between them. Use short UPPER_SNAKE_CASE relationship types such \
as LIKES, DISLIKES, OWNS or FRIEND_OF, and refer to the user as \"User\". \
Reply with JSON: {\"entities\": [string], \"relationships\": [{\"source\": \
string, \"type\": string, \"target\": string}]}.";

const BATCH_EXTRACTION_PROMPT: &str = "\
Below is a past conversation split into numbered exchanges. List the durable \
facts it reveals about the user, the character or their shared history, most \
important first. Reply with JSON: {\"facts\": [{\"fact\": string, \
\"category\": \"user_info\" | \"agent_info\" | \"shared_event\", \
\"importance\": 0.0 to 1.0}]}.";

const KEEP_SELECTION_PROMPT: &str = "\
Below is a numbered list of recently remembered facts with their importance. \
Pick the ones worth keeping permanently and drop trivia and repeats. Reply \
with JSON: {\"keep\": [numbers of the facts to keep]}.";

const SUMMARY_PROMPT: &str = "\
Below are long-term memories about the user and the character. Merge them into \
at most five short, self-contained summaries that keep every important detail. \
Reply with JSON: {\"summaries\": [string]}.";

fn render_exchange(exchange: &Exchange) -> String {
    let mut out = String::new();
    if let Some(when) = &exchange.time_context {
        out.push_str(&format!("[{when}]\n"));
    }
    out.push_str(&format!(
        "User: {}\nCharacter: {}",
        exchange.user_text, exchange.agent_text
    ));
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// PromptedOracle
// ─────────────────────────────────────────────────────────────────────────────

/// Sends one chat completion and returns the raw reply text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// `schema` is the JSON Schema the reply should follow; backends without
    /// structured output may ignore it.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        schema: &serde_json::Value,
    ) -> Result<String, OracleError>;
}

/// [`Oracle`] that prompts a chat model through a [`CompletionBackend`].
pub struct PromptedOracle<B> {
    backend: B,
}

impl<B: CompletionBackend> PromptedOracle<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    async fn ask<T: DeserializeOwned + JsonSchema>(
        &self,
        system: &str,
        user: String,
    ) -> Result<T, OracleError> {
        let schema = response_schema::<T>();
        let raw = self.backend.complete(system, &user, &schema).await?;
        debug!(reply_len = raw.len(), "oracle reply received");
        parse_reply(&raw)
    }
}

#[async_trait]
impl<B: CompletionBackend> Oracle for PromptedOracle<B> {
    async fn extract_fact(&self, exchange: &Exchange) -> Result<FactCandidate, OracleError> {
        self.ask(FACT_EXTRACTION_PROMPT, render_exchange(exchange)).await
    }

    async fn extract_relations(
        &self,
        exchange: &Exchange,
    ) -> Result<EntityExtraction, OracleError> {
        self.ask(ENTITY_EXTRACTION_PROMPT, render_exchange(exchange)).await
    }

    async fn extract_batch(
        &self,
        exchanges: &[Exchange],
    ) -> Result<Vec<FactCandidate>, OracleError> {
        let body = exchanges
            .iter()
            .enumerate()
            .map(|(i, e)| format!("#{}\n{}", i + 1, render_exchange(e)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let reply: BatchExtraction = self.ask(BATCH_EXTRACTION_PROMPT, body).await?;
        Ok(reply.facts)
    }

    async fn select_keep(&self, facts: &[NumberedFact]) -> Result<Vec<usize>, OracleError> {
        let body = facts
            .iter()
            .map(|f| format!("{}. {} (importance {:.2})", f.index, f.fact, f.importance))
            .collect::<Vec<_>>()
            .join("\n");
        let reply: KeepSelection = self.ask(KEEP_SELECTION_PROMPT, body).await?;
        Ok(reply.keep)
    }

    async fn summarize(&self, facts: &[MemoryFact]) -> Result<Vec<String>, OracleError> {
        let body = facts
            .iter()
            .map(|f| format!("- {}", f.fact))
            .collect::<Vec<_>>()
            .join("\n");
        let reply: SummaryReply = self.ask(SUMMARY_PROMPT, body).await?;
        Ok(reply.summaries)
    }
}
