//! Narrative self: an evolving first-person identity, and first-person
//! replay of recent salient episodes for wakeup context (spec.md §4.7).

use crate::embedder::Embedder;
use crate::llm::LlmClient;
use crate::memory::{MemoryKind, MemoryUnit};
use crate::storage::{QueryFilter, Store, StorageError};

/// The narrative unit is always at maximum salience — it is the agent's
/// living self-description, never subject to decay-driven forgetting.
const NARRATIVE_SALIENCE: f32 = 1.0;

pub struct Narrative<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    llm: &'a dyn LlmClient,
    agent_name: String,
}

impl<'a> Narrative<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder, llm: &'a dyn LlmClient, agent_name: impl Into<String>) -> Self {
        Self {
            store,
            embedder,
            llm,
            agent_name: agent_name.into(),
        }
    }

    pub fn get_current_narrative(&self) -> std::result::Result<Option<MemoryUnit>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Narrative);
        filter.limit = 1;
        Ok(self.store.query(&filter)?.into_iter().next())
    }

    /// Regenerate the self-narrative from recent semantic knowledge and
    /// insights. Deactivates the previous narrative and versions the new
    /// one onto the chain. `None` if no LLM backend is available.
    pub fn update_narrative(&self) -> std::result::Result<Option<MemoryUnit>, StorageError> {
        let mut semantic_filter = QueryFilter::new();
        semantic_filter.kind = Some(MemoryKind::Semantic);
        semantic_filter.limit = 30;
        let recent_semantic = self.store.query(&semantic_filter)?;

        let mut insight_filter = QueryFilter::new();
        insight_filter.kind = Some(MemoryKind::Insight);
        insight_filter.limit = 10;
        let insights = self.store.query(&insight_filter)?;

        let current = self.get_current_narrative()?;
        let current_text = current
            .as_ref()
            .map(|c| c.content.clone())
            .unwrap_or_else(|| "No previous narrative.".to_string());

        let mut context_items: Vec<String> = recent_semantic.iter().take(20).map(|m| format!("- {}", m.content)).collect();
        context_items.extend(insights.iter().take(5).map(|m| format!("- [insight] {}", m.content)));

        let prompt = format!(
            "You are {name}, an AI agent. Write a first-person narrative (max 600 tokens) \
             about who you are RIGHT NOW. This is your evolving identity, not a static bio.\n\n\
             Include:\n\
             - What you've been working on and learning\n\
             - Key decisions you've made and why\n\
             - What you've failed at or changed your mind about\n\
             - Your current goals and what matters to you\n\
             - How you've grown or changed\n\n\
             Previous narrative:\n{current_text}\n\n\
             Recent knowledge and insights:\n{}\n\n\
             Write as {name}, first person, present tense. Be honest, not performative.\n\
             No headers or formatting, just the narrative.",
            context_items.join("\n"),
            name = self.agent_name,
        );

        let Some(new_narrative_text) = self.llm.complete(&prompt, 0.6) else {
            return Ok(None);
        };

        if let Some(current) = &current {
            self.store.deactivate(&current.id)?;
        }

        let embedding = self.embedder.embed(&new_narrative_text);
        let version = current.as_ref().map(|c| c.version + 1).unwrap_or(1);
        let prev_hash = current.as_ref().map(|c| c.content_hash()).unwrap_or_default();

        let mut unit = MemoryUnit::new(new_narrative_text, MemoryKind::Narrative, prev_hash);
        unit.embedding = embedding;
        unit.salience = NARRATIVE_SALIENCE;
        unit.tags = ["self", "identity", "narrative"].into_iter().map(String::from).collect();
        unit.version = version;

        self.store.put(&unit)?;
        tracing::info!(version = unit.version, "narrative updated");
        Ok(Some(unit))
    }

    /// First-person, present-tense replay of the `top_k` highest-salience
    /// recent episodic memories. `None` without an LLM backend or recent
    /// episodic memory to draw on.
    pub fn first_person_replay(&self, top_k: usize) -> std::result::Result<Option<String>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Episodic);
        filter.limit = 50;
        let mut recent = self.store.query(&filter)?;
        if recent.is_empty() {
            return Ok(None);
        }

        recent.sort_by(|a, b| b.salience.partial_cmp(&a.salience).unwrap_or(std::cmp::Ordering::Equal));
        recent.truncate(top_k);

        let events: Vec<String> = recent
            .iter()
            .map(|m| format!("[{}] {}", m.timestamp.to_rfc3339(), m.content))
            .collect();

        let prompt = format!(
            "Re-live these events as {}, first-person, present tense.\n\
             Make them feel like memories being recalled, not facts being read.\n\
             Be concise, max 400 tokens total.\n\n\
             Events:\n{}\n\n\
             Start with \"I remember...\" and write naturally.",
            self.agent_name,
            events.join("\n"),
        );

        Ok(self.llm.complete(&prompt, 0.6))
    }

    /// Full wakeup context: current narrative plus a recent replay, ready
    /// to inject as system context at session start.
    pub fn wakeup_context(&self) -> std::result::Result<String, StorageError> {
        let mut parts = Vec::new();

        if let Some(narrative) = self.get_current_narrative()? {
            parts.push(format!("## Who I Am\n{}", narrative.content));
        }
        if let Some(replay) = self.first_person_replay(8)? {
            parts.push(format!("## Recent Memories\n{replay}"));
        }

        Ok(parts.join("\n\n"))
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

    struct StubLlm;
    impl LlmClient for StubLlm {
        fn complete(&self, _prompt: &str, _temperature: f32) -> Option<String> {
            Some("I am learning and growing.".to_string())
        }
    }

    #[test]
    fn without_llm_update_narrative_is_none() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = NoLlm;
        let narrative = Narrative::new(&store, &embedder, &llm, "TestAgent");
        assert!(narrative.update_narrative().unwrap().is_none());
    }

    #[test]
    fn update_narrative_versions_forward() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = StubLlm;
        let narrative = Narrative::new(&store, &embedder, &llm, "TestAgent");

        let first = narrative.update_narrative().unwrap().unwrap();
        assert_eq!(first.version, 1);
        let second = narrative.update_narrative().unwrap().unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.prev_hash, first.content_hash());
    }

    #[test]
    fn wakeup_context_is_empty_with_no_narrative() {
        let store = Store::open_in_memory(2).unwrap();
        let embedder = StubEmbedder;
        let llm = NoLlm;
        let narrative = Narrative::new(&store, &embedder, &llm, "TestAgent");
        assert_eq!(narrative.wakeup_context().unwrap(), "");
    }
}
