//! Hybrid retrieval: semantic + recency + salience + graph, modulated by
//! emotional resonance (spec.md §4.2).

use chrono::Utc;

use crate::embedder::Embedder;
use crate::memory::{EmotionVector, MemoryKind, MemoryUnit};
use crate::storage::{QueryFilter, Store, StorageError};

const WEIGHT_SEMANTIC: f32 = 0.6;
const WEIGHT_RECENCY: f32 = 0.2;
const WEIGHT_SALIENCE: f32 = 0.15;
const WEIGHT_GRAPH: f32 = 0.05;

/// Recency half-life, in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;

/// Resonance above which a query's emotional coloring boosts a candidate.
const RESONANCE_BOOST_THRESHOLD: f32 = 0.6;
const RESONANCE_BOOST_FACTOR: f32 = 1.4;
/// Resonance below which a candidate is actively dampened (affect clash).
const RESONANCE_DAMPEN_THRESHOLD: f32 = -0.3;
const RESONANCE_DAMPEN_FACTOR: f32 = 0.6;

/// Below this decayed salience a unit is treated as forgotten and excluded
/// from results, matching [`MemoryUnit::decayed_salience`]'s threshold.
const FORGOTTEN_THRESHOLD: f32 = 0.01;

/// Cosine similarity above which a context embedding is considered to match
/// a prospective memory's trigger condition (spec.md §4.8).
const TRIGGER_MATCH_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub kind_filter: Option<MemoryKind>,
    pub min_salience: f32,
    pub emotion_query: Option<EmotionVector>,
    pub days_window: Option<f64>,
    /// Whether a match's `retrieval_count`/`last_accessed` are bumped.
    /// Defaults to `true`; set `false` for a read that must stay
    /// non-destructive (spec.md §4.2).
    pub update_access: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 0,
            kind_filter: None,
            min_salience: 0.0,
            emotion_query: None,
            days_window: None,
            update_access: true,
        }
    }
}

impl RetrieveOptions {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }
}

pub struct Retriever<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder) -> Self {
        Self { store, embedder }
    }

    /// Hybrid-score a text query against active memories. Falls back to a
    /// recency-ordered query when vector search yields no candidates (e.g.
    /// an empty store, or an embedder not yet backed by any vectors).
    pub fn retrieve(
        &self,
        query: &str,
        opts: &RetrieveOptions,
    ) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let query_embedding = self.embedder.embed(query);
        let candidates = self.store.vector_search(
            &query_embedding,
            opts.top_k.saturating_mul(3).max(1),
            opts.kind_filter,
            opts.min_salience,
        )?;

        if candidates.is_empty() {
            let mut filter = QueryFilter::new();
            filter.kind = opts.kind_filter;
            filter.min_salience = opts.min_salience;
            filter.limit = opts.top_k;
            let fallback = self.store.query(&filter)?;
            if opts.update_access {
                for unit in &fallback {
                    self.store.update_access(&unit.id)?;
                }
            }
            return Ok(fallback);
        }

        let now = Utc::now();
        let mut scored: Vec<(MemoryUnit, f32)> = Vec::new();

        for (id, semantic_score) in candidates {
            let Some(unit) = self.store.get(&id)? else {
                continue;
            };
            if !unit.active {
                continue;
            }

            let age_days = (now - unit.timestamp).num_seconds() as f64 / 86_400.0;
            if let Some(window) = opts.days_window {
                if age_days > window {
                    continue;
                }
            }

            let decayed = unit.decayed_salience(age_days);
            if decayed < FORGOTTEN_THRESHOLD {
                continue;
            }

            let recency = (-age_days / RECENCY_HALF_LIFE_DAYS).exp() as f32;
            let graph_score = (unit.relations.len() as f32 / 10.0).min(1.0);

            let mut score = WEIGHT_SEMANTIC * semantic_score.max(0.0)
                + WEIGHT_RECENCY * recency
                + WEIGHT_SALIENCE * unit.salience
                + WEIGHT_GRAPH * graph_score;

            if let Some(query_emotion) = &opts.emotion_query {
                let resonance = query_emotion.dot(&unit.emotion_vector);
                if resonance > RESONANCE_BOOST_THRESHOLD {
                    score *= RESONANCE_BOOST_FACTOR;
                } else if resonance < RESONANCE_DAMPEN_THRESHOLD {
                    score *= RESONANCE_DAMPEN_FACTOR;
                }
            }

            scored.push((unit, score));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(opts.top_k);

        let mut results = Vec::with_capacity(scored.len());
        for (unit, _score) in scored {
            if opts.update_access {
                self.store.update_access(&unit.id)?;
            }
            results.push(unit);
        }
        Ok(results)
    }

    /// Active prospective memories whose `trigger_condition` embedding
    /// matches `current_context` above [`TRIGGER_MATCH_THRESHOLD`]
    /// (spec.md §4.8).
    pub fn retrieve_prospective(
        &self,
        current_context: &str,
    ) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Prospective);
        filter.limit = 50;
        let prospectives = self.store.query(&filter)?;
        if prospectives.is_empty() {
            return Ok(Vec::new());
        }

        let context_embedding = self.embedder.embed(current_context);
        let mut matches = Vec::new();
        for p in prospectives {
            let Some(trigger) = &p.trigger_condition else {
                continue;
            };
            let trigger_embedding = self.embedder.embed(trigger);
            let sim = crate::embedder::cosine_similarity(&context_embedding, &trigger_embedding);
            if sim > TRIGGER_MATCH_THRESHOLD {
                matches.push(p);
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;

    struct StubEmbedder;
    impl Embedder for StubEmbedder {
        fn embed(&self, text: &str) -> Vec<f32> {
            if text.contains("match") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            }
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    #[test]
    fn retrieve_falls_back_to_recency_when_store_empty() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let retriever = Retriever::new(&store, &embedder);
        let results = retriever.retrieve("match this", &RetrieveOptions::new(5)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn retrieve_prefers_semantically_close_candidate() {
        let store = Store::open_in_memory(2).unwrap();
        let mut close = MemoryUnit::new("matching content", MemoryKind::Semantic, String::new());
        close.embedding = vec![1.0, 0.0];
        let mut far = MemoryUnit::new("unrelated content", MemoryKind::Semantic, String::new());
        far.embedding = vec![0.0, 1.0];
        store.put(&close).unwrap();
        store.put(&far).unwrap();

        let embedder = StubEmbedder;
        let retriever = Retriever::new(&store, &embedder);
        let results = retriever.retrieve("match", &RetrieveOptions::new(1)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, close.id);
    }

    #[test]
    fn retrieve_prospective_requires_high_similarity() {
        let store = Store::open_in_memory(2).unwrap();
        let mut p = MemoryUnit::new("reminder", MemoryKind::Prospective, String::new());
        p.trigger_condition = Some("match this trigger".to_string());
        store.put(&p).unwrap();

        let embedder = StubEmbedder;
        let retriever = Retriever::new(&store, &embedder);
        let matches = retriever.retrieve_prospective("match this context").unwrap();
        assert_eq!(matches.len(), 1);

        let no_matches = retriever.retrieve_prospective("totally different").unwrap();
        assert!(no_matches.is_empty());
    }
}
