//! Run budget enforcement.
//!
//! Generalizes the teacher's `token_budget: Option<i64>` field — present on
//! `PlanMeta`/the `plans` table but never actually checked anywhere — into an
//! enforced running total. `CostTracker` is the port every executor round
//! calls through after an LLM call; once the running cost exceeds the
//! configured ceiling, every subsequent `record` call fails and the run
//! transitions to `BudgetExhausted` instead of silently continuing.

use tokio::sync::RwLock;

use crate::error::FabricError;

/// A single usage record: tokens consumed and their cost in the same unit
/// `max_cost` is expressed in (USD, fractional cents, provider credits —
/// the tracker is unit-agnostic).
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// Tracks cumulative cost for a single run and enforces a ceiling.
///
/// `base × budget_multiplier × complexity_factor` (spec.md §4.1's budget
/// model) is computed by the caller and passed in as `max_cost`; this type
/// only owns the running total and the comparison.
#[derive(Debug)]
pub struct CostTracker {
    max_cost: f64,
    spent: RwLock<Usage>,
}

impl CostTracker {
    pub fn new(max_cost: f64) -> Self {
        Self {
            max_cost,
            spent: RwLock::new(Usage::default()),
        }
    }

    /// Record a unit of usage, failing with `BudgetExhausted` if this pushes
    /// the running total past `max_cost`. The usage is recorded either way —
    /// work already done cost real tokens regardless of whether it fit the
    /// budget — so callers should treat a budget error as "stop starting new
    /// work", not "the last call didn't happen".
    pub async fn record(&self, usage: Usage) -> Result<(), FabricError> {
        let mut spent = self.spent.write().await;
        spent.tokens_in += usage.tokens_in;
        spent.tokens_out += usage.tokens_out;
        spent.cost += usage.cost;

        if spent.cost > self.max_cost {
            return Err(FabricError::budget_exhausted(format!(
                "run cost {:.4} exceeds budget {:.4}",
                spent.cost, self.max_cost
            )));
        }
        Ok(())
    }

    pub async fn spent(&self) -> Usage {
        *self.spent.read().await
    }

    pub fn max_cost(&self) -> f64 {
        self.max_cost
    }
}

/// `base × budget_multiplier × complexity_factor`, per spec.md §4.1.
pub fn compute_budget(base: f64, budget_multiplier: f64, complexity_factor: f64) -> f64 {
    base * budget_multiplier * complexity_factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_within_budget_succeed() {
        let tracker = CostTracker::new(10.0);
        tracker
            .record(Usage {
                tokens_in: 100,
                tokens_out: 50,
                cost: 3.0,
            })
            .await
            .unwrap();
        assert_eq!(tracker.spent().await.cost, 3.0);
    }

    #[tokio::test]
    async fn record_exceeding_budget_fails() {
        let tracker = CostTracker::new(5.0);
        tracker
            .record(Usage {
                tokens_in: 0,
                tokens_out: 0,
                cost: 4.0,
            })
            .await
            .unwrap();

        let err = tracker
            .record(Usage {
                tokens_in: 0,
                tokens_out: 0,
                cost: 2.0,
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(tracker.spent().await.cost, 6.0);
    }

    #[test]
    fn compute_budget_multiplies_factors() {
        assert_eq!(compute_budget(2.0, 1.5, 2.0), 6.0);
    }
}
