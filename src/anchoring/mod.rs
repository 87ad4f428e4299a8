//! Ground-truth anchoring: prevents bias drift in the consolidate → dream →
//! narrative loop by demoting high-salience semantic memories that have
//! never been externally validated (spec.md §4.9).

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::memory::{MemoryKind, MemoryUnit};
use crate::storage::{QueryFilter, Store, StorageError};

/// Only semantic memories at or above this salience require anchoring
/// (spec.md §4.9).
const SALIENCE_THRESHOLD: f32 = 0.85;
/// Grace period before an unanchored high-salience memory is flagged.
const ANCHOR_WINDOW_DAYS: i64 = 7;
/// Salience multiplier applied on demotion.
const DEMOTION_FACTOR: f32 = 0.6;

const ANCHOR_TAGS: [&str; 4] = ["anchored", "human_verified", "tool_verified", "external_verified"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub total_semantic: i64,
    pub high_salience: i64,
    pub anchored: i64,
    pub unanchored: i64,
    pub anchor_rate_pct: f32,
    pub risk_level: RiskLevel,
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

pub struct Anchoring<'a> {
    store: &'a Store,
}

impl<'a> Anchoring<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    fn is_anchored(tags: &std::collections::BTreeSet<String>) -> bool {
        ANCHOR_TAGS.iter().any(|t| tags.contains(*t))
    }

    /// High-salience active semantic memories older than the anchor window
    /// and lacking any anchor tag.
    pub fn find_unanchored(&self) -> std::result::Result<Vec<MemoryUnit>, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Semantic);
        filter.min_salience = SALIENCE_THRESHOLD;
        filter.limit = 500;
        let candidates = self.store.query(&filter)?;

        let now = Utc::now();
        Ok(candidates
            .into_iter()
            .filter(|m| !Self::is_anchored(&m.tags))
            .filter(|m| now - m.timestamp > Duration::days(ANCHOR_WINDOW_DAYS))
            .collect())
    }

    /// Demote every unanchored high-salience memory's `salience` by
    /// [`DEMOTION_FACTOR`] and tag it `unanchored_demoted`. Returns the
    /// demoted ids. `dry_run` computes the list without mutating.
    pub fn demote_unanchored(&self, dry_run: bool) -> std::result::Result<Vec<String>, StorageError> {
        let unanchored = self.find_unanchored()?;
        let mut demoted = Vec::new();

        for mut m in unanchored {
            if !dry_run {
                m.salience *= DEMOTION_FACTOR;
                m.tags.insert("unanchored_demoted".to_string());
                self.store.update_unit(&m)?;
            }
            demoted.push(m.id);
        }

        if !demoted.is_empty() {
            tracing::info!(count = demoted.len(), "demoted unanchored high-salience memories");
        }
        Ok(demoted)
    }

    /// Mark a memory as externally validated: add `method` as a tag
    /// (`human_verified`, `tool_verified`, or `external_verified`) and
    /// clear any prior demotion flag. `evidence` is recorded as a tag-
    /// adjacent note in logs only, ENGRAM does not persist free-text
    /// evidence on the unit itself.
    pub fn anchor(&self, unit_id: &str, method: &str, evidence: Option<&str>) -> std::result::Result<(), StorageError> {
        let Some(mut unit) = self.store.get(unit_id)? else {
            return Ok(());
        };
        unit.tags.insert(method.to_string());
        unit.tags.remove("unanchored_demoted");
        self.store.update_unit(&unit)?;
        tracing::info!(id = %unit_id, method, ?evidence, "memory anchored");
        Ok(())
    }

    pub fn audit_report(&self) -> std::result::Result<AuditReport, StorageError> {
        let mut filter = QueryFilter::new();
        filter.kind = Some(MemoryKind::Semantic);
        filter.limit = 10_000;
        let all_semantic = self.store.query(&filter)?;

        let high_salience: Vec<_> = all_semantic.iter().filter(|m| m.salience >= SALIENCE_THRESHOLD).collect();
        let anchored = high_salience.iter().filter(|m| Self::is_anchored(&m.tags)).count();
        let unanchored = self.find_unanchored()?.len();

        let risk_level = if unanchored > 10 {
            RiskLevel::High
        } else if unanchored > 3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        Ok(AuditReport {
            total_semantic: all_semantic.len() as i64,
            high_salience: high_salience.len() as i64,
            anchored: anchored as i64,
            unanchored: unanchored as i64,
            anchor_rate_pct: if high_salience.is_empty() {
                0.0
            } else {
                anchored as f32 / high_salience.len() as f32 * 100.0
            },
            risk_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn old_semantic(salience: f32) -> MemoryUnit {
        let mut u = MemoryUnit::new("an important fact", MemoryKind::Semantic, String::new());
        u.salience = salience;
        u.timestamp = Utc::now() - Duration::days(30);
        u
    }

    #[test]
    fn high_salience_unanchored_memory_is_found() {
        let store = Store::open_in_memory(2).unwrap();
        let unit = old_semantic(0.9);
        store.put(&unit).unwrap();
        let anchoring = Anchoring::new(&store);
        let found = anchoring.find_unanchored().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, unit.id);
    }

    #[test]
    fn anchored_memory_is_excluded() {
        let store = Store::open_in_memory(2).unwrap();
        let mut unit = old_semantic(0.9);
        unit.tags.insert("human_verified".to_string());
        store.put(&unit).unwrap();
        let anchoring = Anchoring::new(&store);
        assert!(anchoring.find_unanchored().unwrap().is_empty());
    }

    #[test]
    fn demote_unanchored_reduces_salience_and_tags() {
        let store = Store::open_in_memory(2).unwrap();
        let unit = old_semantic(0.9);
        store.put(&unit).unwrap();
        let anchoring = Anchoring::new(&store);
        let demoted = anchoring.demote_unanchored(false).unwrap();
        assert_eq!(demoted, vec![unit.id.clone()]);

        let refetched = store.get(&unit.id).unwrap().unwrap();
        assert!(refetched.salience < 0.9);
        assert!(refetched.tags.contains("unanchored_demoted"));
    }

    #[test]
    fn anchor_clears_demotion_flag() {
        let store = Store::open_in_memory(2).unwrap();
        let unit = old_semantic(0.9);
        store.put(&unit).unwrap();
        let anchoring = Anchoring::new(&store);
        anchoring.demote_unanchored(false).unwrap();
        anchoring.anchor(&unit.id, "human_verified", None).unwrap();

        let refetched = store.get(&unit.id).unwrap().unwrap();
        assert!(!refetched.tags.contains("unanchored_demoted"));
        assert!(refetched.tags.contains("human_verified"));
    }
}
