//! Escalation watchdog for repeated soft blocks.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::store::{CorrelationStore, StoreError};

/// Soft blocks tolerated per account inside the window before escalation.
const ESCALATION_THRESHOLD: u64 = 3;
/// Watch-flag window.
const WINDOW: Duration = Duration::from_secs(21_600);

/// Detects accounts oscillating in and out of soft blocks: scoring just
/// enough, waiting out the short lockout, and resuming. The gate only
/// signals; the caller decides how to act (typically by hardening the next
/// block).
pub struct AntiEquilibriumGate {
    store: Arc<dyn CorrelationStore>,
}

impl AntiEquilibriumGate {
    /// Create a gate over the given store.
    pub fn new(store: Arc<dyn CorrelationStore>) -> Self {
        Self { store }
    }

    /// Record one soft block for an account. Returns the running count
    /// inside the current window.
    pub async fn record_soft_block(&self, account_id: &str) -> Result<u64, StoreError> {
        let count = self
            .store
            .increment_watch_flag(&watch_key(account_id), WINDOW)
            .await?;
        debug!(account = %account_id, soft_blocks = count, "recorded soft block");
        Ok(count)
    }

    /// Whether the account has accumulated enough soft blocks that a harder
    /// response should apply.
    pub async fn should_escalate(&self, account_id: &str) -> Result<bool, StoreError> {
        let count = self.store.watch_flag(&watch_key(account_id)).await?;
        Ok(count >= ESCALATION_THRESHOLD)
    }
}

fn watch_key(account_id: &str) -> String {
    format!("gate:soft:{}", account_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_escalates_on_third_soft_block() {
        let store = Arc::new(MemoryStore::new());
        let gate = AntiEquilibriumGate::new(store);

        assert!(!gate.should_escalate("acc-1").await.unwrap());

        gate.record_soft_block("acc-1").await.unwrap();
        assert!(!gate.should_escalate("acc-1").await.unwrap());

        gate.record_soft_block("acc-1").await.unwrap();
        assert!(!gate.should_escalate("acc-1").await.unwrap());

        gate.record_soft_block("acc-1").await.unwrap();
        assert!(gate.should_escalate("acc-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let gate = AntiEquilibriumGate::new(store);

        for _ in 0..3 {
            gate.record_soft_block("acc-1").await.unwrap();
        }

        assert!(gate.should_escalate("acc-1").await.unwrap());
        assert!(!gate.should_escalate("acc-2").await.unwrap());
    }
}
