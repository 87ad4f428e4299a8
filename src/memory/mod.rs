//! Memory module - the single first-class entity in ENGRAM
//!
//! Every fact, experience, insight, or deferred intention ENGRAM holds is a
//! [`MemoryUnit`]. The type itself does not enforce the cross-unit
//! invariants (hash chain, active-set membership) — those live at the
//! [`crate::storage::Store`] boundary, since `Store` is the only writer.

mod relation;
mod unit;

pub use relation::{Relation, RelationKind};
pub use unit::{EmotionVector, MemoryKind, MemoryUnit};

use serde::{Deserialize, Serialize};

/// Aggregate counts returned by [`crate::storage::Store::count`] style queries
/// and surfaced through [`crate::orchestrator::Orchestrator::status`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCounts {
    pub total: i64,
    pub episodic: i64,
    pub semantic: i64,
    pub procedural: i64,
    pub insight: i64,
    pub prospective: i64,
    pub narrative: i64,
}
