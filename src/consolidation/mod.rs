//! Episodic→semantic consolidation: batch distillation on wakeup, and
//! micro-consolidation during a session, with contradiction handling
//! (spec.md §4.4).

use std::sync::Mutex;

use serde::Deserialize;

use crate::embedder::Embedder;
use crate::llm::{extract_json_array, LlmClient};
use crate::memory::{MemoryKind, MemoryUnit, RelationKind};
use crate::storage::{QueryFilter, Store, StorageError};

/// Micro-consolidation fires after this many new episodic memories land in
/// a session (spec.md §4.4).
const DEFAULT_MICRO_THRESHOLD: u32 = 8;

/// Cosine similarity above which a candidate is considered the same belief
/// as a stated contradiction, and soft-deactivated (spec.md §4.4).
const CONTRADICTION_MATCH_THRESHOLD: f32 = 0.75;

#[derive(Debug, Deserialize)]
struct DistilledFact {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    salience: Option<f32>,
    #[serde(default)]
    source_episodes: Vec<String>,
    #[serde(default)]
    contradicts: Option<String>,
}

pub struct Consolidator<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    llm: &'a dyn LlmClient,
    micro_threshold: u32,
    /// Owned by the caller (typically [`crate::orchestrator::Orchestrator`])
    /// so the micro-consolidation counter survives across the short-lived
    /// `Consolidator` values constructed per call.
    new_count: &'a Mutex<u32>,
}

impl<'a> Consolidator<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder, llm: &'a dyn LlmClient, new_count: &'a Mutex<u32>) -> Self {
        Self {
            store,
            embedder,
            llm,
            micro_threshold: DEFAULT_MICRO_THRESHOLD,
            new_count,
        }
    }

    pub fn with_micro_threshold(mut self, threshold: u32) -> Self {
        self.micro_threshold = threshold;
        self
    }

    /// Episodic memories never consolidated, up to 200 — the wakeup scan
    /// (spec.md §4.4).
    pub fn check_wakeup(&self) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Episodic);
        filter.unconsolidated_only = true;
        filter.limit = 200;
        self.store.query(&filter)
    }

    /// Distill `episodes` into semantic memory via the LLM. Empty input or
    /// no LLM backend yields an empty result, never an error — a
    /// `ParseFailure` from the backend degrades the same way.
    pub fn consolidate_batch(
        &self,
        episodes: &[MemoryUnit],
    ) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        if episodes.is_empty() {
            return Ok(Vec::new());
        }

        let replay: Vec<_> = episodes
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "content": e.content,
                    "timestamp": e.timestamp.to_rfc3339(),
                    "tags": e.tags,
                    "salience": e.salience,
                })
            })
            .collect();

        let prompt = format!(
            "You are a memory consolidation system. Given these episodic memories (raw experiences),\n\
             distill them into semantic knowledge (facts, rules, lessons learned).\n\n\
             Rules:\n\
             - Extract durable facts, not transient details\n\
             - Identify contradictions with existing knowledge\n\
             - Merge related facts into single statements\n\
             - Preserve important context and decisions\n\
             - Output as JSON array\n\n\
             Episodic memories:\n{}\n\n\
             Output format:\n\
             [{{\"content\": \"distilled fact or rule\", \"tags\": [\"relevant\", \"tags\"], \
             \"salience\": 0.0, \"source_episodes\": [\"episode_id1\"], \"contradicts\": null}}]\n\n\
             Output ONLY valid JSON array:",
            serde_json::to_string_pretty(&replay).unwrap_or_default()
        );

        let Some(response) = self.llm.complete(&prompt, 0.2) else {
            return Ok(Vec::new());
        };
        let Some(facts_json) = extract_json_array(&response) else {
            tracing::warn!("consolidation response was not parseable JSON, skipping batch");
            return Ok(Vec::new());
        };
        let facts: Vec<DistilledFact> = match serde_json::from_value(facts_json) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("consolidation facts did not match expected shape: {e}");
                return Ok(Vec::new());
            }
        };

        let mut created = Vec::new();
        let mut prev_hash = self.store.get_last_hash()?;

        for fact in facts {
            if fact.content.is_empty() {
                continue;
            }

            if let Some(contradiction) = &fact.contradicts {
                self.handle_contradiction(contradiction)?;
            }

            let embedding = self.embedder.embed(&fact.content);
            let mut unit = MemoryUnit::new(fact.content, MemoryKind::Semantic, prev_hash.clone());
            unit.embedding = embedding;
            unit.salience = fact.salience.unwrap_or(0.6);
            unit.tags = fact.tags.into_iter().collect();
            for episode_id in fact.source_episodes {
                unit.add_relation(episode_id, RelationKind::DistilledFrom, 0.9);
            }

            prev_hash = unit.content_hash();
            self.store.put(&unit)?;
            created.push(unit);
        }

        for episode in episodes {
            self.store.mark_consolidated(&episode.id)?;
        }

        Ok(created)
    }

    /// Call after storing a new episodic memory. Once `micro_threshold`
    /// episodes have accumulated in this session, runs a consolidation
    /// batch over the most recent unconsolidated ones.
    pub fn on_new_memory(
        &self,
        unit: &MemoryUnit,
    ) -> std::result::Result<Option<Vec<MemoryUnit>>, StorageError> {
        if unit.kind != MemoryKind::Episodic {
            return Ok(None);
        }

        let mut count = self.new_count.lock().unwrap();
        *count += 1;
        if *count < self.micro_threshold {
            return Ok(None);
        }
        *count = 0;
        drop(count);

        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Episodic);
        filter.unconsolidated_only = true;
        filter.limit = 20;
        let recent = self.store.query(&filter)?;
        if recent.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.consolidate_batch(&recent)?))
    }

    fn handle_contradiction(&self, contradiction_desc: &str) -> std::result::Result<(), StorageError> {
        let embedding = self.embedder.embed(contradiction_desc);
        let candidates = self.store.vector_search(&embedding, 5, None, 0.0)?;
        for (id, score) in candidates {
            if score <= CONTRADICTION_MATCH_THRESHOLD {
                continue;
            }
            if let Some(old) = self.store.get(&id)? {
                if old.kind == MemoryKind::Semantic && old.active {
                    self.store.deactivate(&id)?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Full wakeup sequence: find unconsolidated episodes, distill them.
    pub fn wakeup_consolidate(&self) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let unconsolidated = self.check_wakeup()?;
        if unconsolidated.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = unconsolidated.len(), "wakeup consolidation starting");
        self.consolidate_batch(&unconsolidated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::NoLlm;

    struct StubEmbedder;
    impl Embedder for StubEmbedder {
        fn embed(&self, _text: &str) -> Vec<f32> {
            vec![0.1, 0.2]
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    struct StubLlm(String);
    impl LlmClient for StubLlm {
        fn complete(&self, _prompt: &str, _temperature: f32) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn no_llm_backend_yields_no_facts() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = NoLlm;
        let new_count = Mutex::new(0);
        let consolidator = Consolidator::new(&store, &embedder, &llm, &new_count);
        let episode = MemoryUnit::new("did a thing", MemoryKind::Episodic, String::new());
        let result = consolidator.consolidate_batch(&[episode]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn distills_episodes_into_semantic_units() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = StubLlm(
            r#"[{"content": "the sky is blue", "tags": ["weather"], "salience": 0.7, "source_episodes": []}]"#
                .to_string(),
        );
        let new_count = Mutex::new(0);
        let consolidator = Consolidator::new(&store, &embedder, &llm, &new_count);
        let episode = MemoryUnit::new("looked outside", MemoryKind::Episodic, String::new());
        store.put(&episode).unwrap();

        let created = consolidator.consolidate_batch(&[episode.clone()]).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, MemoryKind::Semantic);

        let refetched = store.get(&episode.id).unwrap().unwrap();
        assert!(refetched.consolidated_ts.is_some());
    }

    #[test]
    fn garbage_llm_output_yields_empty_result() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = StubLlm("not json at all".to_string());
        let new_count = Mutex::new(0);
        let consolidator = Consolidator::new(&store, &embedder, &llm, &new_count);
        let episode = MemoryUnit::new("x", MemoryKind::Episodic, String::new());
        let result = consolidator.consolidate_batch(&[episode]).unwrap();
        assert!(result.is_empty());
    }
}
