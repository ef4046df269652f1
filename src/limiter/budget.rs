//! Daily-epoch budget tracking.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{BudgetState, RateLimitStore, StoreError};

use super::unix_now;

/// Length of one budget epoch.
const EPOCH: Duration = Duration::from_secs(86_400);

/// Counts requests against a per-key daily budget, built on the store's
/// atomic budget primitive. Exceeding the configured threshold before the
/// epoch ends triggers the policy's configured block level, independent of
/// score.
pub struct BudgetTracker {
    store: Arc<dyn RateLimitStore>,
    epoch: Duration,
}

impl BudgetTracker {
    /// Create a tracker over the given store.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            epoch: EPOCH,
        }
    }

    /// Atomically count one request against the key's budget.
    pub async fn increment(&self, key: &str) -> Result<BudgetState, StoreError> {
        self.store.increment_budget(key, self.epoch).await
    }

    /// Current budget state for a key; zeros when absent.
    pub async fn status(&self, key: &str) -> Result<BudgetState, StoreError> {
        Ok(self.store.budget(key).await?.unwrap_or_default())
    }

    /// Whether the key's budget is exceeded right now. A stale epoch is
    /// never exceeded, even with a high leftover count; the store resets it
    /// lazily on the next increment.
    pub async fn is_exceeded(&self, key: &str, limit: u64) -> Result<bool, StoreError> {
        let state = self.status(key).await?;
        Ok(exceeded_at(state, limit, self.epoch.as_secs(), unix_now()))
    }
}

/// Pure exceed check against an explicit clock.
fn exceeded_at(state: BudgetState, limit: u64, epoch_secs: u64, now: u64) -> bool {
    state.count >= limit && now < state.epoch_start + epoch_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_exceeded_only_within_epoch() {
        let state = BudgetState {
            count: 100,
            epoch_start: 1_000,
        };

        // At the threshold, inside the epoch.
        assert!(exceeded_at(state, 100, 86_400, 1_000 + 86_399));
        // One second after epoch end the same count no longer counts.
        assert!(!exceeded_at(state, 100, 86_400, 1_000 + 86_400));
    }

    #[test]
    fn test_below_threshold_is_not_exceeded() {
        let state = BudgetState {
            count: 99,
            epoch_start: 1_000,
        };
        assert!(!exceeded_at(state, 100, 86_400, 1_500));
    }

    #[tokio::test]
    async fn test_increment_and_exceed_through_store() {
        let store = Arc::new(MemoryStore::new());
        let tracker = BudgetTracker::new(store);

        assert!(!tracker.is_exceeded("budget:login:acc1", 2).await.unwrap());

        tracker.increment("budget:login:acc1").await.unwrap();
        assert!(!tracker.is_exceeded("budget:login:acc1", 2).await.unwrap());

        tracker.increment("budget:login:acc1").await.unwrap();
        assert!(tracker.is_exceeded("budget:login:acc1", 2).await.unwrap());

        // Other keys are unaffected.
        assert!(!tracker.is_exceeded("budget:login:acc2", 2).await.unwrap());
    }
}
