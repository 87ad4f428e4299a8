//! End-to-end scenarios against the public [`engram::Orchestrator`] API.

use engram::config::EngramConfig;
use engram::embedder::Embedder;
use engram::llm::{LlmClient, NoLlm};
use engram::memory::MemoryKind;
use engram::orchestrator::Orchestrator;
use engram::retrieval::RetrieveOptions;

/// Deterministic bag-of-bytes embedder: good enough to make semantically
/// similar strings land near each other without pulling in a real model.
struct WordBagEmbedder;

impl Embedder for WordBagEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        for word in text.split_whitespace() {
            let bucket = word.bytes().map(|b| b as usize).sum::<usize>() % 8;
            v[bucket] += 1.0;
        }
        v
    }
    fn dimension(&self) -> usize {
        8
    }
}

struct ScriptedLlm(&'static str);

impl LlmClient for ScriptedLlm {
    fn complete(&self, _prompt: &str, _temperature: f32) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn fresh_config() -> EngramConfig {
    let dir = std::env::temp_dir().join(format!("engram-it-{}", uuid::Uuid::new_v4()));
    EngramConfig {
        data_dir: dir,
        ..EngramConfig::default()
    }
}

#[test]
fn remember_recall_and_wakeup_preserve_chain_integrity() {
    let orchestrator = Orchestrator::new(fresh_config(), Box::new(WordBagEmbedder), Box::new(NoLlm)).unwrap();

    orchestrator.wakeup().unwrap();

    let first = orchestrator
        .remember("deployed the new release pipeline", MemoryKind::Episodic, vec!["deploy".into()], 0.6, None)
        .unwrap();
    let second = orchestrator
        .remember("the release pipeline broke on first run", MemoryKind::Episodic, vec!["deploy".into(), "bug".into()], 0.8, None)
        .unwrap();

    assert_eq!(second.prev_hash, first.content_hash());

    let report = orchestrator.wakeup().unwrap();
    assert!(matches!(
        report.chain_verdict,
        engram::orchestrator::ChainVerdictSummary::Valid
    ));

    let (results, _fired) = orchestrator
        .recall("release pipeline", &RetrieveOptions::new(5))
        .unwrap();
    assert!(!results.is_empty());
}

#[test]
fn sleep_consolidates_episodes_into_semantic_memory() {
    let llm = ScriptedLlm(
        r#"[{"content": "release pipelines need a staging rehearsal before prod", "tags": ["deploy"], "salience": 0.7, "source_episodes": []}]"#,
    );
    let orchestrator = Orchestrator::new(fresh_config(), Box::new(WordBagEmbedder), Box::new(llm)).unwrap();

    for i in 0..3 {
        orchestrator
            .remember(&format!("episode number {i} about a deploy"), MemoryKind::Episodic, Vec::new(), 0.5, None)
            .unwrap();
    }

    let report = orchestrator.sleep().unwrap();
    assert_eq!(report.consolidated, 1);

    let status = orchestrator.status().unwrap();
    assert_eq!(status.memories.semantic, 1);
}

#[test]
fn intend_and_recall_fires_prospective_action() {
    let orchestrator = Orchestrator::new(fresh_config(), Box::new(WordBagEmbedder), Box::new(NoLlm)).unwrap();

    orchestrator
        .intend(
            "deployed the new release pipeline",
            serde_json::json!({"type": "remind", "message": "check rollout metrics"}),
            None,
            0.8,
        )
        .unwrap();

    let (_results, fired) = orchestrator
        .recall("deployed the new release pipeline", &RetrieveOptions::new(5))
        .unwrap();
    assert_eq!(fired.len(), 1);

    let status = orchestrator.status().unwrap();
    assert_eq!(status.memories.prospective, 0, "fired prospective memory should deactivate");
}

#[test]
fn transplant_round_trips_between_two_agents() {
    let source = Orchestrator::new(fresh_config(), Box::new(WordBagEmbedder), Box::new(NoLlm)).unwrap();
    let dest = Orchestrator::new(fresh_config(), Box::new(WordBagEmbedder), Box::new(NoLlm)).unwrap();

    let unit = source
        .remember("a fact worth sharing with another agent", MemoryKind::Semantic, vec!["shared".into()], 0.7, None)
        .unwrap();

    let package = source
        .export_memories(&[unit.id.clone()], &[])
        .unwrap()
        .expect("package should be built");

    let imported = dest.import_memories(&package, 0.85, false).unwrap();
    assert_eq!(imported.len(), 1);
    assert!(!imported[0].active, "unaccepted transplant lands as a proposal");

    let status = dest.status().unwrap();
    assert_eq!(status.memories.total, 0, "proposals are inactive until accepted");
}
