//! [`Orchestrator`]: the single entry point tying every subsystem together
//! (spec.md §2). Construct one per agent session, backed by an `Embedder`
//! and `LlmClient` the caller supplies.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::anchoring::{Anchoring, AuditReport, RiskLevel};
use crate::config::EngramConfig;
use crate::consolidation::Consolidator;
use crate::dreaming::Dreamer;
use crate::embedder::Embedder;
use crate::identity::{ChainVerdict, Identity, WakeupAttestation};
use crate::llm::LlmClient;
use crate::memory::{EmotionVector, MemoryCounts, MemoryKind, MemoryUnit};
use crate::metabolism::{Metabolism, MetabolismStatus};
use crate::narrative::Narrative;
use crate::prospective::Prospective;
use crate::retrieval::{RetrieveOptions, Retriever};
use crate::storage::{QueryFilter, Store, StorageError};
use crate::transplant::{Transplant, TransplantError, TransplantPackage};

/// Per-action credit toward the metabolism budget for useful work
/// (spec.md §4.6).
const EARN_MULTIPLIER_PER_REMEMBER: f32 = 0.5;
/// Minimum active semantic memories before a sleep cycle attempts to dream
/// (spec.md §4.5).
const DREAM_MIN_SEMANTIC: i64 = 10;

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),
    #[error("transplant error: {0}")]
    Transplant(#[from] TransplantError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeupReport {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub consolidated: Vec<String>,
    pub attestation: WakeupAttestationSummary,
    pub chain_verdict: ChainVerdictSummary,
    pub metabolism: MetabolismStatus,
    pub anchoring: AuditReport,
    pub prospective_count: usize,
    pub narrative: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeupAttestationSummary {
    pub agent_id: String,
    pub root_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChainVerdictSummary {
    Valid,
    BrokenAt { id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepReport {
    pub consolidated: usize,
    pub dreamed: usize,
    pub archived: usize,
    pub narrative_updated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub memories: MemoryCounts,
    pub metabolism: MetabolismStatus,
    pub identity: String,
    pub anchoring: AuditReport,
    pub wakeup_done: bool,
}

/// Ties [`Store`], [`Identity`], and every cognitive subsystem together
/// behind the handful of verbs spec.md §2 exposes: wakeup, remember,
/// recall, dream, sleep, intend, export/import, anchor, status.
pub struct Orchestrator {
    store: Store,
    identity: Identity,
    embedder: Box<dyn Embedder>,
    llm: Box<dyn LlmClient>,
    config: EngramConfig,
    earned_tokens: AtomicI64,
    micro_consolidation_count: Mutex<u32>,
    wakeup_done: std::sync::atomic::AtomicBool,
}

impl Orchestrator {
    pub fn new(config: EngramConfig, embedder: Box<dyn Embedder>, llm: Box<dyn LlmClient>) -> Result<Self> {
        let store = Store::open(&config.store_dir(), embedder.dimension())?;
        let identity = Identity::load_or_create(&config.identity_dir())?;
        Ok(Self {
            store,
            identity,
            embedder,
            llm,
            config,
            earned_tokens: AtomicI64::new(0),
            micro_consolidation_count: Mutex::new(0),
            wakeup_done: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn metabolism(&self) -> Metabolism<'_> {
        Metabolism::new(&self.store, self.config.max_tokens, &self.earned_tokens)
    }

    fn consolidator(&self) -> Consolidator<'_> {
        Consolidator::new(
            &self.store,
            self.embedder.as_ref(),
            self.llm.as_ref(),
            &self.micro_consolidation_count,
        )
    }

    fn dreamer(&self) -> Dreamer<'_> {
        Dreamer::new(&self.store, self.embedder.as_ref(), self.llm.as_ref())
    }

    fn retriever(&self) -> Retriever<'_> {
        Retriever::new(&self.store, self.embedder.as_ref())
    }

    fn narrative(&self) -> Narrative<'_> {
        Narrative::new(&self.store, self.embedder.as_ref(), self.llm.as_ref(), self.config.agent_name.clone())
    }

    fn prospective(&self) -> Prospective<'_> {
        Prospective::new(&self.store, self.embedder.as_ref(), self.llm.as_ref())
    }

    fn anchoring(&self) -> Anchoring<'_> {
        Anchoring::new(&self.store)
    }

    fn transplant(&self) -> Transplant<'_> {
        Transplant::new(&self.store, &self.identity)
    }

    /// Run at session start: verify chain integrity, sign a wakeup
    /// attestation, consolidate any pending episodes, enforce the
    /// metabolism budget, and audit ground-truth anchoring.
    pub fn wakeup(&self) -> Result<WakeupReport> {
        let mut filter = QueryFilter::new();
        filter.limit = 10_000;
        let all_active = self.store.query(&filter)?;

        let root_hash = self.identity.compute_root_hash(&all_active);
        let chain_verdict = self.identity.verify_chain(&all_active);
        if let ChainVerdict::BrokenAt(id) = &chain_verdict {
            tracing::error!(unit_id = %id, "chain integrity check failed on wakeup");
        }

        let last_consolidation = all_active
            .iter()
            .rev()
            .find_map(|m| m.consolidated_ts);
        let attestation = self.identity.wakeup_attestation(&root_hash, last_consolidation)?;

        let new_semantic = self.consolidator().wakeup_consolidate()?;

        let metabolism_status = self.metabolism().status()?;
        self.metabolism().metabolize(false)?;

        let anchoring_report = self.anchoring().audit_report()?;
        if anchoring_report.risk_level == RiskLevel::High {
            tracing::warn!(unanchored = anchoring_report.unanchored, "unanchored high-salience memories at risk threshold");
            self.anchoring().demote_unanchored(false)?;
        }

        let prospective_count = self.prospective().list_active()?.len();
        let narrative = self.narrative().get_current_narrative()?;

        self.wakeup_done.store(true, Ordering::Relaxed);

        Ok(WakeupReport {
            timestamp: chrono::Utc::now(),
            consolidated: new_semantic.into_iter().map(|m| m.content).collect(),
            attestation: WakeupAttestationSummary {
                agent_id: attestation.agent_id,
                root_hash: attestation.root_hash,
            },
            chain_verdict: match chain_verdict {
                ChainVerdict::Valid => ChainVerdictSummary::Valid,
                ChainVerdict::BrokenAt(id) => ChainVerdictSummary::BrokenAt { id },
            },
            metabolism: metabolism_status,
            anchoring: anchoring_report,
            prospective_count,
            narrative: narrative.map(|n| n.content),
        })
    }

    /// Store a new memory: embed, chain-link, sign, persist, and check for
    /// micro-consolidation. Earns metabolism credit for the action.
    pub fn remember(
        &self,
        content: &str,
        kind: MemoryKind,
        tags: impl IntoIterator<Item = String>,
        salience: f32,
        emotion: Option<EmotionVector>,
    ) -> Result<MemoryUnit> {
        let embedding = self.embedder.embed(content);
        let prev_hash = self.store.get_last_hash()?;

        let mut unit = MemoryUnit::new(content, kind, prev_hash);
        unit.embedding = embedding;
        unit.salience = salience;
        unit.tags = tags.into_iter().collect();
        unit.emotion_vector = emotion.unwrap_or_default();
        unit.signature = self.identity.sign_memory(&unit);

        self.store.put(&unit)?;
        self.consolidator().on_new_memory(&unit)?;
        self.metabolism().earn(EARN_MULTIPLIER_PER_REMEMBER);

        Ok(unit)
    }

    /// Retrieve memories relevant to `query`. Also checks prospective
    /// triggers against `query` and fires any that match, returning their
    /// action payloads alongside the retrieved memories.
    pub fn recall(&self, query: &str, opts: &RetrieveOptions) -> Result<(Vec<MemoryUnit>, Vec<serde_json::Value>)> {
        let results = self.retriever().retrieve(query, opts)?;

        let triggered = self.prospective().check_triggers(query)?;
        let mut fired_actions = Vec::new();
        for (unit, _score) in triggered {
            if let Some(action) = self.prospective().fire(&unit)? {
                fired_actions.push(action);
            }
        }

        Ok((results, fired_actions))
    }

    pub fn dream(&self, n_samples: usize, max_insights: usize) -> Result<Vec<MemoryUnit>> {
        Ok(self.dreamer().dream(n_samples, max_insights)?)
    }

    /// End-of-session maintenance: final consolidation, a dream cycle if
    /// there's enough new semantic knowledge, a narrative refresh, and
    /// metabolism cleanup.
    pub fn sleep(&self) -> Result<SleepReport> {
        let consolidated = self.consolidator().wakeup_consolidate()?;

        let semantic_count = self.store.count(Some(MemoryKind::Semantic), true)?;
        let dreamed = if semantic_count >= DREAM_MIN_SEMANTIC {
            self.dreamer().dream(6, 3)?
        } else {
            Vec::new()
        };

        let narrative_updated = self.narrative().update_narrative()?.is_some();
        let archived = self.metabolism().metabolize(false)?;

        tracing::info!(
            consolidated = consolidated.len(),
            dreamed = dreamed.len(),
            archived = archived.len(),
            "sleep cycle complete"
        );

        Ok(SleepReport {
            consolidated: consolidated.len(),
            dreamed: dreamed.len(),
            archived: archived.len(),
            narrative_updated,
        })
    }

    /// Create a prospective memory — a deferred, context-triggered
    /// intention.
    pub fn intend(
        &self,
        trigger: &str,
        action: serde_json::Value,
        content: Option<String>,
        salience: f32,
    ) -> Result<MemoryUnit> {
        Ok(self.prospective().create(trigger, action, content, salience)?)
    }

    /// Export memories by explicit id, or by tag if `ids` is empty.
    pub fn export_memories(&self, ids: &[String], tags: &[String]) -> Result<Option<TransplantPackage>> {
        if !ids.is_empty() {
            Ok(self.transplant().export_package(ids, serde_json::json!({}))?)
        } else if !tags.is_empty() {
            Ok(self.transplant().export_by_tags(tags, 50)?)
        } else {
            Ok(None)
        }
    }

    pub fn import_memories(
        &self,
        package: &TransplantPackage,
        trust_score: f32,
        auto_accept: bool,
    ) -> Result<Vec<MemoryUnit>> {
        Ok(self.transplant().import_package(package, trust_score, auto_accept, None)?)
    }

    /// Mark a memory as externally verified, clearing any anchoring demotion.
    pub fn anchor(&self, unit_id: &str, method: &str) -> Result<()> {
        Ok(self.anchoring().anchor(unit_id, method, None)?)
    }

    pub fn status(&self) -> Result<SystemStatus> {
        let memories = MemoryCounts {
            total: self.store.count(None, true)?,
            episodic: self.store.count(Some(MemoryKind::Episodic), true)?,
            semantic: self.store.count(Some(MemoryKind::Semantic), true)?,
            procedural: self.store.count(Some(MemoryKind::Procedural), true)?,
            insight: self.store.count(Some(MemoryKind::Insight), true)?,
            prospective: self.store.count(Some(MemoryKind::Prospective), true)?,
            narrative: self.store.count(Some(MemoryKind::Narrative), true)?,
        };

        Ok(SystemStatus {
            memories,
            metabolism: self.metabolism().status()?,
            identity: self.identity.public_key_b64(),
            anchoring: self.anchoring().audit_report()?,
            wakeup_done: self.wakeup_done.load(Ordering::Relaxed),
        })
    }

    /// Full wakeup context (narrative + recent replay) for injection into
    /// an agent's system prompt.
    pub fn wakeup_context(&self) -> Result<String> {
        Ok(self.narrative().wakeup_context()?)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::NoLlm;

    struct StubEmbedder;
    impl Embedder for StubEmbedder {
        fn embed(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32;
            }
            v
        }
        fn dimension(&self) -> usize {
            4
        }
    }

    fn orchestrator() -> Orchestrator {
        let dir = std::env::temp_dir().join(format!("engram-orchestrator-{}", uuid::Uuid::new_v4()));
        let config = EngramConfig {
            data_dir: dir,
            ..EngramConfig::default()
        };
        Orchestrator::new(config, Box::new(StubEmbedder), Box::new(NoLlm)).unwrap()
    }

    #[test]
    fn remember_then_recall_roundtrips() {
        let orch = orchestrator();
        let unit = orch
            .remember("the sky is blue today", MemoryKind::Episodic, vec!["weather".to_string()], 0.6, None)
            .unwrap();
        assert!(!unit.signature.is_empty());

        let (results, _actions) = orch
            .recall("the sky is blue today", &RetrieveOptions::new(5))
            .unwrap();
        assert!(results.iter().any(|m| m.id == unit.id));
    }

    #[test]
    fn wakeup_on_empty_store_succeeds() {
        let orch = orchestrator();
        let report = orch.wakeup().unwrap();
        assert_eq!(report.chain_verdict, ChainVerdictSummary::Valid);
    }

    #[test]
    fn status_reflects_remembered_counts() {
        let orch = orchestrator();
        orch.remember("a fact", MemoryKind::Semantic, std::iter::empty(), 0.5, None).unwrap();
        let status = orch.status().unwrap();
        assert_eq!(status.memories.semantic, 1);
        assert_eq!(status.memories.total, 1);
    }

    #[test]
    fn intend_creates_prospective_memory() {
        let orch = orchestrator();
        orch.intend("when I deploy", serde_json::json!({"message": "run smoke tests"}), None, 0.8)
            .unwrap();
        let status = orch.status().unwrap();
        assert_eq!(status.memories.prospective, 1);
    }
}
