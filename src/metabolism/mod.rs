//! Metabolic pressure: every active memory has an upkeep cost, the agent
//! has a token budget, and going over budget forces the lowest-utility
//! memories into retirement (spec.md §4.6).

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::Serialize;

use crate::storage::{Store, StorageError};

/// Utility above which a unit is protected from metabolic eviction even
/// while over budget (spec.md §4.6).
const PROTECTED_UTILITY: f32 = 5.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetabolismStatus {
    pub active_memories: i64,
    pub total_cost: f32,
    pub budget: f32,
    pub utilization_pct: f32,
    pub earned_tokens: i64,
    pub headroom: f32,
}

pub struct Metabolism<'a> {
    store: &'a Store,
    max_tokens: u64,
    earn_per_action: u64,
    /// Owned by the caller (typically [`crate::orchestrator::Orchestrator`])
    /// so earned capacity survives across the short-lived `Metabolism`
    /// values constructed per call.
    earned_tokens: &'a AtomicI64,
}

impl<'a> Metabolism<'a> {
    pub fn new(store: &'a Store, max_tokens: u64, earned_tokens: &'a AtomicI64) -> Self {
        Self {
            store,
            max_tokens,
            earn_per_action: 50_000,
            earned_tokens,
        }
    }

    /// Recompute `maintenance_cost` for every active memory, in place.
    pub fn compute_costs(&self) -> std::result::Result<(), StorageError> {
        let mut filter = crate::storage::QueryFilter::new();
        filter.limit = 10_000;
        let memories = self.store.query(&filter)?;
        let now = Utc::now();

        for mut unit in memories {
            let age_days = ((now - unit.timestamp).num_seconds() as f64 / 86_400.0).max(0.0);
            unit.compute_maintenance_cost(age_days);
            self.store.update_unit(&unit)?;
        }
        Ok(())
    }

    pub fn total_cost(&self) -> std::result::Result<f32, StorageError> {
        Ok(self.store.all_active_costs()?.iter().map(|(_, cost, _)| cost).sum())
    }

    pub fn effective_budget(&self) -> f32 {
        self.max_tokens as f32 + self.earned_tokens.load(Ordering::Relaxed) as f32
    }

    /// Credit token capacity for useful work performed by the agent.
    pub fn earn(&self, multiplier: f32) {
        let amount = (self.earn_per_action as f32 * multiplier) as i64;
        self.earned_tokens.fetch_add(amount, Ordering::Relaxed);
    }

    /// Enforce the budget: if total cost exceeds it, deactivate low-utility
    /// memories (ascending utility, skipping anything above
    /// [`PROTECTED_UTILITY`]) until back under budget. Returns the ids
    /// archived. `dry_run` computes the same list without mutating.
    pub fn metabolize(&self, dry_run: bool) -> std::result::Result<Vec<String>, StorageError> {
        self.compute_costs()?;
        let total = self.total_cost()?;
        let budget = self.effective_budget();

        if total <= budget {
            return Ok(Vec::new());
        }

        let mut excess = total - budget;
        let mut archived = Vec::new();
        let costs = self.store.all_active_costs()?;

        for (id, cost, utility) in costs {
            if excess <= 0.0 {
                break;
            }
            if utility > PROTECTED_UTILITY {
                continue;
            }
            if !dry_run {
                self.store.deactivate(&id)?;
            }
            archived.push(id);
            excess -= cost;
        }

        if !archived.is_empty() {
            tracing::info!(
                count = archived.len(),
                total_cost = total,
                budget = budget,
                "metabolism archived low-utility memories"
            );
        }
        Ok(archived)
    }

    pub fn status(&self) -> std::result::Result<MetabolismStatus, StorageError> {
        let total = self.total_cost()?;
        let budget = self.effective_budget();
        let active = self.store.count(None, true)?;
        Ok(MetabolismStatus {
            active_memories: active,
            total_cost: total,
            budget,
            utilization_pct: if budget > 0.0 { total / budget * 100.0 } else { 0.0 },
            earned_tokens: self.earned_tokens.load(Ordering::Relaxed),
            headroom: budget - total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, MemoryUnit};

    #[test]
    fn under_budget_archives_nothing() {
        let store = Store::open_in_memory(2).unwrap();
        let unit = MemoryUnit::new("x", MemoryKind::Episodic, String::new());
        store.put(&unit).unwrap();
        let earned = AtomicI64::new(0);
        let metabolism = Metabolism::new(&store, 2_000_000, &earned);
        assert!(metabolism.metabolize(false).unwrap().is_empty());
    }

    #[test]
    fn over_budget_archives_low_utility_first() {
        let store = Store::open_in_memory(2).unwrap();
        let mut low = MemoryUnit::new(
            "low utility memory with plenty of words to cost tokens",
            MemoryKind::Episodic,
            String::new(),
        );
        low.salience = 0.9;
        low.retrieval_count = 0;
        store.put(&low).unwrap();

        let earned = AtomicI64::new(0);
        let metabolism = Metabolism::new(&store, 0, &earned);
        let archived = metabolism.metabolize(false).unwrap();
        assert_eq!(archived, vec![low.id.clone()]);
        assert!(store.get(&low.id).unwrap().unwrap().active == false);
    }

    #[test]
    fn earning_raises_effective_budget() {
        let store = Store::open_in_memory(2).unwrap();
        let earned = AtomicI64::new(0);
        let metabolism = Metabolism::new(&store, 1_000, &earned);
        let before = metabolism.effective_budget();
        metabolism.earn(2.0);
        assert!(metabolism.effective_budget() > before);
    }
}
