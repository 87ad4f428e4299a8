//! Directed edges between memory units.

use serde::{Deserialize, Serialize};

/// Kind of directed relationship a [`super::MemoryUnit`] can declare to
/// another unit, by id.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Causes,
    Contradicts,
    Supports,
    Supersedes,
    InspiredBy,
    DistilledFrom,
    RelatedTo,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Causes => "causes",
            RelationKind::Contradicts => "contradicts",
            RelationKind::Supports => "supports",
            RelationKind::Supersedes => "supersedes",
            RelationKind::InspiredBy => "inspired_by",
            RelationKind::DistilledFrom => "distilled_from",
            RelationKind::RelatedTo => "related_to",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "causes" => Some(RelationKind::Causes),
            "contradicts" => Some(RelationKind::Contradicts),
            "supports" => Some(RelationKind::Supports),
            "supersedes" => Some(RelationKind::Supersedes),
            "inspired_by" => Some(RelationKind::InspiredBy),
            "distilled_from" => Some(RelationKind::DistilledFrom),
            "related_to" => Some(RelationKind::RelatedTo),
            _ => None,
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed edge from the owning [`super::MemoryUnit`] to `target_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub target_id: String,
    pub kind: RelationKind,
    pub strength: f32,
}

impl Relation {
    pub fn new(target_id: impl Into<String>, kind: RelationKind, strength: f32) -> Self {
        Self {
            target_id: target_id.into(),
            kind,
            strength: strength.clamp(0.0, 1.0),
        }
    }
}
