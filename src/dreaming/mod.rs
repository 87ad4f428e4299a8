//! The dream cycle: diverse sampling over semantic memory, LLM-proposed
//! cross-domain connections, filtered for novelty, stored as `insight`
//! memories (spec.md §4.5).

use serde::Deserialize;

use crate::embedder::Embedder;
use crate::llm::{extract_json_array, LlmClient};
use crate::memory::{MemoryKind, MemoryUnit, RelationKind};
use crate::storage::{QueryFilter, Store, StorageError};

/// Cosine similarity to an existing memory above which a proposed insight
/// is rejected as a near-duplicate, not a novel connection (spec.md §4.5).
const NOVELTY_THRESHOLD: f32 = 0.75;
/// LLM-assigned novelty score below which a proposed insight is discarded
/// outright (spec.md §4.5).
const MIN_NOVELTY_SCORE: f32 = 0.55;
/// Insights start at this salience — they're the product of active
/// synthesis, not passive recording (spec.md §4.5).
const INSIGHT_SALIENCE: f32 = 0.92;

const MIN_SEMANTIC_FOR_DREAMING: i64 = 10;

#[derive(Debug, Deserialize)]
struct ProposedInsight {
    insight: String,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    novelty_score: f32,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct Dreamer<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    llm: &'a dyn LlmClient,
}

impl<'a> Dreamer<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder, llm: &'a dyn LlmClient) -> Self {
        Self { store, embedder, llm }
    }

    /// Run one dream cycle: sample `n_samples` semantic memories, propose
    /// up to `max_insights` connections, keep the ones that pass the
    /// novelty gate. Returns the created insight memories.
    pub fn dream(
        &self,
        n_samples: usize,
        max_insights: usize,
    ) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Semantic);
        filter.limit = 500;
        let all_semantic = self.store.query(&filter)?;
        if all_semantic.len() < n_samples {
            return Ok(Vec::new());
        }

        let selected = diverse_sample(&all_semantic, n_samples);
        if selected.len() < 3 {
            return Ok(Vec::new());
        }

        let memories_json: Vec<_> = selected
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "content": m.content.chars().take(400).collect::<String>(),
                    "tags": m.tags,
                })
            })
            .collect();

        let prompt = format!(
            "Given these {} semantic memories, generate 1-{} COUNTER-INTUITIVE, \
             paradoxical, or previously unseen connections.\n\n\
             Memories:\n{}\n\n\
             Rules:\n\
             - Must feel like original insight, not obvious pattern matching\n\
             - Look for hidden contradictions, unexpected parallels across domains, or emergent principles\n\
             - Each insight should link at least 2 memories\n\
             - Rate novelty 0-1 (be harsh - only genuinely surprising gets >0.8)\n\n\
             Output ONLY JSON array:\n\
             [{{\"insight\": \"exact surprising statement\", \"links\": [\"id1\", \"id2\"], \
             \"novelty_score\": 0.82, \"tags\": [\"tag1\"]}}]",
            selected.len(),
            max_insights,
            serde_json::to_string_pretty(&memories_json).unwrap_or_default()
        );

        let Some(response) = self.llm.complete(&prompt, 0.4) else {
            return Ok(Vec::new());
        };
        let Some(insights_json) = extract_json_array(&response) else {
            tracing::warn!("dream response was not parseable JSON, skipping cycle");
            return Ok(Vec::new());
        };
        let proposals: Vec<ProposedInsight> = match serde_json::from_value(insights_json) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("dream insights did not match expected shape: {e}");
                return Ok(Vec::new());
            }
        };

        let mut created = Vec::new();
        let mut prev_hash = self.store.get_last_hash()?;

        for proposal in proposals {
            if proposal.insight.is_empty() || proposal.novelty_score < MIN_NOVELTY_SCORE {
                continue;
            }

            let embedding = self.embedder.embed(&proposal.insight);
            let nearest = self.store.vector_search(&embedding, 3, None, 0.0)?;
            let max_similarity = nearest.first().map(|(_, s)| *s).unwrap_or(0.0);
            if max_similarity > NOVELTY_THRESHOLD {
                continue;
            }

            let mut unit = MemoryUnit::new(proposal.insight, MemoryKind::Insight, prev_hash.clone());
            unit.embedding = embedding;
            unit.salience = INSIGHT_SALIENCE;
            unit.tags = proposal.tags.into_iter().chain(std::iter::once("dream".to_string())).collect();
            for link in proposal.links {
                unit.add_relation(link, RelationKind::InspiredBy, 0.9);
            }

            prev_hash = unit.content_hash();
            self.store.put(&unit)?;
            created.push(unit);
        }

        if !created.is_empty() {
            tracing::info!(count = created.len(), "dream cycle created new insights");
        }
        Ok(created)
    }

    /// Whether dream conditions are met: enough total semantic memory, and
    /// enough new semantic growth since the last cycle (spec.md §4.5).
    pub fn should_dream(&self, new_semantic_count: i64) -> std::result::Result<bool, StorageError> {
        let total = self.store.count(Some(MemoryKind::Semantic), true)?;
        Ok(total >= MIN_SEMANTIC_FOR_DREAMING && new_semantic_count >= 50)
    }
}

/// 60% least-connected (underexplored) + 40% highest-salience memories,
/// shuffled afterward so prompt position carries no signal (spec.md §4.5).
fn diverse_sample(memories: &[MemoryUnit], k: usize) -> Vec<MemoryUnit> {
    if memories.len() <= k {
        return memories.to_vec();
    }

    let mut by_degree: Vec<&MemoryUnit> = memories.iter().collect();
    by_degree.sort_by_key(|m| m.relations.len());

    let mut by_salience: Vec<&MemoryUnit> = memories.iter().collect();
    by_salience.sort_by(|a, b| b.salience.partial_cmp(&a.salience).unwrap_or(std::cmp::Ordering::Equal));

    let n_low_degree = (k as f64 * 0.6) as usize;

    let mut selected_ids = std::collections::BTreeSet::new();
    let mut selected = Vec::new();

    for m in by_degree {
        if selected.len() >= n_low_degree {
            break;
        }
        if selected_ids.insert(m.id.clone()) {
            selected.push(m.clone());
        }
    }
    for m in by_salience {
        if selected.len() >= k {
            break;
        }
        if selected_ids.insert(m.id.clone()) {
            selected.push(m.clone());
        }
    }

    use rand::seq::SliceRandom;
    selected.shuffle(&mut rand::rng());
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::NoLlm;

    struct StubEmbedder;
    impl Embedder for StubEmbedder {
        fn embed(&self, _text: &str) -> Vec<f32> {
            vec![0.3, 0.4]
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    fn make_semantic(n: usize) -> Vec<MemoryUnit> {
        (0..n)
            .map(|i| {
                let mut u = MemoryUnit::new(format!("fact {i}"), MemoryKind::Semantic, String::new());
                u.salience = (i as f32) / n as f32;
                u
            })
            .collect()
    }

    #[test]
    fn too_few_candidates_skips_dreaming() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = NoLlm;
        let dreamer = Dreamer::new(&store, &embedder, &llm);
        let result = dreamer.dream(6, 3).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn diverse_sample_respects_k() {
        let memories = make_semantic(20);
        let sampled = diverse_sample(&memories, 6);
        assert_eq!(sampled.len(), 6);
    }

    #[test]
    fn should_dream_requires_minimum_semantic_count() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = NoLlm;
        let dreamer = Dreamer::new(&store, &embedder, &llm);
        assert!(!dreamer.should_dream(100).unwrap());

        for unit in make_semantic(12) {
            store.put(&unit).unwrap();
        }
        assert!(dreamer.should_dream(60).unwrap());
        assert!(!dreamer.should_dream(10).unwrap());
    }
}
