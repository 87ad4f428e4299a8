//! Context-triggered prospective memory: "when I next see X, do Y" — not
//! cron-scheduled, activated by matching live context against a stored
//! trigger embedding (spec.md §4.8).

use crate::embedder::{cosine_similarity, Embedder};
use crate::llm::LlmClient;
use crate::memory::{MemoryKind, MemoryUnit};
use crate::storage::{QueryFilter, Store, StorageError};

/// Cosine similarity above which a context is considered to match a
/// trigger (spec.md §4.8).
const TRIGGER_THRESHOLD: f32 = 0.7;
/// Below this similarity, an LLM double-check is skipped and the match
/// simply stands — high-confidence matches don't need adjudication.
const LLM_VERIFY_CEILING: f32 = 0.85;

pub struct Prospective<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    llm: &'a dyn LlmClient,
}

impl<'a> Prospective<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder, llm: &'a dyn LlmClient) -> Self {
        Self { store, embedder, llm }
    }

    /// Create a new prospective memory. `content` defaults to a
    /// `WHEN:...THEN:...` rendering of the trigger and action if not given.
    pub fn create(
        &self,
        trigger_condition: &str,
        action: serde_json::Value,
        content: Option<String>,
        salience: f32,
    ) -> std::result::Result<MemoryUnit, StorageError> {
        let content = content.unwrap_or_else(|| {
            let action_desc = action
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| action.to_string());
            format!("WHEN: {trigger_condition} -> THEN: {action_desc}")
        });

        let embedding = self.embedder.embed(trigger_condition);
        let prev_hash = self.store.get_last_hash()?;
        let mut unit = MemoryUnit::new(content, MemoryKind::Prospective, prev_hash);
        unit.embedding = embedding;
        unit.salience = salience;
        unit.trigger_condition = Some(trigger_condition.to_string());
        unit.action = Some(action);
        unit.tags = ["prospective", "active"].into_iter().map(String::from).collect();

        self.store.put(&unit)?;
        tracing::info!(trigger = %trigger_condition, "prospective memory created");
        Ok(unit)
    }

    /// Active prospective memories whose trigger embedding matches the
    /// current context, with similarity `>= TRIGGER_THRESHOLD`. Matches in
    /// the ambiguous band below [`LLM_VERIFY_CEILING`] get an LLM
    /// yes/no double-check when a backend is available; matches above it
    /// are trusted outright.
    pub fn check_triggers(
        &self,
        current_context: &str,
    ) -> std::result::Result<Vec<(MemoryUnit, f32)>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Prospective);
        filter.limit = 100;
        let prospectives = self.store.query(&filter)?;
        if prospectives.is_empty() {
            return Ok(Vec::new());
        }

        let context_embedding = self.embedder.embed(current_context);
        let mut triggered = Vec::new();

        for p in prospectives {
            let Some(trigger) = &p.trigger_condition else {
                continue;
            };

            let trigger_embedding = if !p.embedding.is_empty() {
                p.embedding.clone()
            } else {
                self.embedder.embed(trigger)
            };
            let similarity = cosine_similarity(&context_embedding, &trigger_embedding);

            if similarity < TRIGGER_THRESHOLD {
                continue;
            }

            if similarity < LLM_VERIFY_CEILING {
                if let Some(verdict) = self.llm.complete(
                    &format!(
                        "Does this context match this trigger?\nContext: {current_context}\nTrigger: {trigger}\nAnswer YES or NO only:"
                    ),
                    0.0,
                ) {
                    if !verdict.to_uppercase().contains("YES") {
                        continue;
                    }
                }
            }

            triggered.push((p, similarity));
        }

        Ok(triggered)
    }

    /// Fire a prospective memory: deactivate it and return its action
    /// payload for the caller to execute.
    pub fn fire(&self, unit: &MemoryUnit) -> std::result::Result<Option<serde_json::Value>, StorageError> {
        self.store.deactivate(&unit.id)?;
        tracing::info!(trigger = ?unit.trigger_condition, "prospective memory fired");
        Ok(unit.action.clone())
    }

    pub fn list_active(&self) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Prospective);
        filter.limit = 100;
        self.store.query(&filter)
    }
}
