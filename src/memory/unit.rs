//! The memory unit itself.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Relation, RelationKind};

/// Number of named emotional dimensions tracked per unit (invariant 3 of
/// spec.md §3: `emotion_vector` always has length 8).
pub const EMOTION_DIMS: usize = 8;

/// Fixed 8-dimensional signed emotional coloring of a memory.
///
/// Dimensions, in order: joy, frustration, curiosity, anger, surprise,
/// satisfaction, fear, calm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionVector(pub [f32; EMOTION_DIMS]);

impl Default for EmotionVector {
    fn default() -> Self {
        Self([0.0; EMOTION_DIMS])
    }
}

impl EmotionVector {
    pub fn new(values: [f32; EMOTION_DIMS]) -> Self {
        Self(values)
    }

    pub fn joy(&self) -> f32 {
        self.0[0]
    }
    pub fn frustration(&self) -> f32 {
        self.0[1]
    }
    pub fn curiosity(&self) -> f32 {
        self.0[2]
    }
    pub fn anger(&self) -> f32 {
        self.0[3]
    }
    pub fn surprise(&self) -> f32 {
        self.0[4]
    }
    pub fn satisfaction(&self) -> f32 {
        self.0[5]
    }
    pub fn fear(&self) -> f32 {
        self.0[6]
    }
    pub fn calm(&self) -> f32 {
        self.0[7]
    }

    pub fn dot(&self, other: &EmotionVector) -> f32 {
        self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum()
    }

    /// Cosine resonance between two emotion vectors, 0 if either is the
    /// zero vector.
    pub fn resonance(&self, other: &EmotionVector) -> f32 {
        let na = self.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        let nb = other.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        self.dot(other) / (na * nb)
    }
}

/// What kind of memory a unit represents.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Episodic,
    Semantic,
    Procedural,
    Insight,
    Prospective,
    Narrative,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Insight => "insight",
            MemoryKind::Prospective => "prospective",
            MemoryKind::Narrative => "narrative",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(MemoryKind::Episodic),
            "semantic" => Some(MemoryKind::Semantic),
            "procedural" => Some(MemoryKind::Procedural),
            "insight" => Some(MemoryKind::Insight),
            "prospective" => Some(MemoryKind::Prospective),
            "narrative" => Some(MemoryKind::Narrative),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single memory, typed, embedded, signed, and chained to its predecessor.
///
/// See spec.md §3 for the full invariant list; this struct only holds the
/// data, the invariants are enforced by [`crate::storage::Store`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUnit {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub embedding: Vec<f32>,
    pub salience: f32,
    pub emotion_vector: EmotionVector,
    pub tags: BTreeSet<String>,
    pub relations: Vec<Relation>,
    pub decay_rate: f32,
    pub version: u32,
    pub prev_hash: String,
    pub signature: String,
    pub consolidated_ts: Option<DateTime<Utc>>,
    pub trigger_condition: Option<String>,
    /// Action payload, present only when `kind == MemoryKind::Prospective`
    /// (invariant 6, spec.md §3). Arbitrary caller-defined JSON.
    pub action: Option<serde_json::Value>,
    pub source_agent: Option<String>,
    pub trust_score: f32,
    pub maintenance_cost: f32,
    pub retrieval_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub active: bool,
}

impl MemoryUnit {
    /// Construct a fresh unit ready for signing and storage. `prev_hash`
    /// should be `Store::get_last_hash()` taken under the writer's lock.
    pub fn new(content: impl Into<String>, kind: MemoryKind, prev_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            timestamp: now,
            embedding: Vec::new(),
            salience: 0.5,
            emotion_vector: EmotionVector::default(),
            tags: BTreeSet::new(),
            relations: Vec::new(),
            decay_rate: 0.95,
            version: 1,
            prev_hash,
            signature: String::new(),
            consolidated_ts: None,
            trigger_condition: None,
            action: None,
            source_agent: None,
            trust_score: 1.0,
            maintenance_cost: 0.0,
            retrieval_count: 0,
            last_accessed: now,
            active: true,
        }
    }

    /// `SHA256(id | content | timestamp | prev_hash)`, the chain-integrity
    /// hash signed by [`crate::identity::Identity`] (spec.md §4.3).
    pub fn content_hash(&self) -> String {
        let payload = format!(
            "{}|{}|{}|{}",
            self.id,
            self.content,
            self.timestamp.to_rfc3339(),
            self.prev_hash
        );
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// `words * 1.3 * salience * 1.2^age_days` — spec.md §4.6.
    pub fn compute_maintenance_cost(&mut self, age_days: f64) -> f32 {
        let token_estimate = self.content.split_whitespace().count() as f64 * 1.3;
        let cost = token_estimate * self.salience as f64 * 1.2_f64.powf(age_days.max(0.0));
        self.maintenance_cost = cost as f32;
        self.maintenance_cost
    }

    /// `retrieval_count*0.6 + salience*0.3 + min(|relations|,10)*0.01` —
    /// spec.md §4.6's utility function, used to rank eviction candidates.
    pub fn utility_score(&self) -> f32 {
        let graph_degree = self.relations.len().min(10) as f32;
        self.retrieval_count as f32 * 0.6 + self.salience * 0.3 + graph_degree * 0.01
    }

    /// `salience * decay_rate^age_days` — a unit below 0.01 is effectively
    /// forgotten (spec.md GLOSSARY, "Decayed salience").
    pub fn decayed_salience(&self, age_days: f64) -> f32 {
        (self.salience as f64 * (self.decay_rate as f64).powf(age_days.max(0.0))) as f32
    }

    /// Whether this unit's embedding matches the store's declared dimension
    /// (invariant 4 of spec.md §3).
    pub fn embedding_matches_dimension(&self, dim: usize) -> bool {
        self.embedding.len() == dim
    }

    pub fn add_relation(&mut self, target_id: impl Into<String>, kind: RelationKind, strength: f32) {
        self.relations.push(Relation::new(target_id, kind, strength));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_changes_with_prev_hash() {
        let a = MemoryUnit::new("hello", MemoryKind::Episodic, String::new());
        let mut b = a.clone();
        b.prev_hash = "deadbeef".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_is_deterministic() {
        let a = MemoryUnit::new("hello", MemoryKind::Episodic, String::new());
        assert_eq!(a.content_hash(), a.content_hash());
    }

    #[test]
    fn emotion_resonance_zero_vector() {
        let a = EmotionVector::default();
        let b = EmotionVector::new([1.0; 8]);
        assert_eq!(a.resonance(&b), 0.0);
    }

    #[test]
    fn maintenance_cost_grows_with_age() {
        let mut u = MemoryUnit::new("one two three four five", MemoryKind::Episodic, String::new());
        u.salience = 0.5;
        let young = u.compute_maintenance_cost(0.0);
        let old = u.compute_maintenance_cost(30.0);
        assert!(old > young);
    }

    #[test]
    fn decayed_salience_below_threshold_is_forgotten() {
        let mut u = MemoryUnit::new("x", MemoryKind::Episodic, String::new());
        u.salience = 0.5;
        u.decay_rate = 0.8;
        let ds = u.decayed_salience(60.0);
        assert!(ds < 0.01);
    }
}
