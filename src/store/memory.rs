//! In-process store implementation.
//!
//! Backs all three store traits with sharded concurrent maps and lazy TTL
//! expiry. Suitable for single-node deployments and used by every test. The
//! health flag simulates a data-backend outage; breaker state is kept on a
//! separate channel and stays reachable while the flag is down, mirroring
//! deployments where breaker state lives in a more available store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{
    BlockState, BreakerState, BudgetState, CircuitBreakerStore, CorrelationStore, RateLimitState,
    RateLimitStore, StoreError,
};

/// A value with a lazy expiry deadline.
struct Expiring<T> {
    value: T,
    deadline: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            deadline: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.deadline
    }
}

/// In-memory implementation of the rate-limit, correlation, and breaker
/// stores.
pub struct MemoryStore {
    states: DashMap<String, Expiring<RateLimitState>>,
    blocks: DashMap<String, Expiring<BlockState>>,
    budgets: DashMap<String, BudgetState>,
    sets: DashMap<String, Expiring<HashSet<String>>>,
    flags: DashMap<String, Expiring<u64>>,
    breaker: Mutex<BreakerState>,
    healthy: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            blocks: DashMap::new(),
            budgets: DashMap::new(),
            sets: DashMap::new(),
            flags: DashMap::new(),
            breaker: Mutex::new(BreakerState::default()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Toggle the simulated health of the data backend.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked down".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, StoreError> {
        self.guard()?;
        Ok(self
            .states
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value))
    }

    async fn put(
        &self,
        key: &str,
        state: RateLimitState,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.guard()?;
        self.states.insert(key.to_string(), Expiring::new(state, ttl));
        Ok(())
    }

    async fn check_block(&self, key: &str) -> Result<Option<BlockState>, StoreError> {
        self.guard()?;
        Ok(self
            .blocks
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value))
    }

    async fn block(
        &self,
        key: &str,
        level: u8,
        expires_at: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.guard()?;
        self.blocks.insert(
            key.to_string(),
            Expiring::new(BlockState { level, expires_at }, ttl),
        );
        Ok(())
    }

    async fn increment_budget(
        &self,
        key: &str,
        epoch: Duration,
    ) -> Result<BudgetState, StoreError> {
        self.guard()?;
        let now = now_ts();
        let mut entry = self
            .budgets
            .entry(key.to_string())
            .or_insert(BudgetState {
                count: 0,
                epoch_start: now,
            });
        if now >= entry.epoch_start + epoch.as_secs() {
            // Lazy reset: the previous epoch lapsed.
            entry.count = 0;
            entry.epoch_start = now;
        }
        entry.count += 1;
        Ok(*entry)
    }

    async fn budget(&self, key: &str) -> Result<Option<BudgetState>, StoreError> {
        self.guard()?;
        Ok(self.budgets.get(key).map(|e| *e))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CorrelationStore for MemoryStore {
    async fn add_distinct(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        self.guard()?;
        let mut entry = self
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(HashSet::new(), ttl));
        if !entry.live() {
            entry.value.clear();
            entry.deadline = Instant::now() + ttl;
        }
        entry.value.insert(member.to_string());
        Ok(entry.value.len() as u64)
    }

    async fn increment_watch_flag(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.guard()?;
        let mut entry = self
            .flags
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(0, ttl));
        if !entry.live() {
            entry.value = 0;
            entry.deadline = Instant::now() + ttl;
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn watch_flag(&self, key: &str) -> Result<u64, StoreError> {
        self.guard()?;
        Ok(self
            .flags
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value)
            .unwrap_or(0))
    }
}

#[async_trait]
impl CircuitBreakerStore for MemoryStore {
    async fn breaker_state(&self) -> Result<BreakerState, StoreError> {
        Ok(*self.breaker.lock())
    }

    async fn set_breaker_state(&self, state: BreakerState) -> Result<(), StoreError> {
        *self.breaker.lock() = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_roundtrip() {
        let store = MemoryStore::new();
        let state = RateLimitState {
            score: 7,
            block_level: 1,
            last_update: 100,
        };

        store.put("rl:test:ip:1.2.3.4", state, Duration::from_secs(60))
            .await
            .unwrap();
        let got = store.get("rl:test:ip:1.2.3.4").await.unwrap().unwrap();
        assert_eq!(got.score, 7);
        assert_eq!(got.block_level, 1);
    }

    #[tokio::test]
    async fn test_state_expires() {
        let store = MemoryStore::new();
        store
            .put(
                "rl:test:ip:1.2.3.4",
                RateLimitState::default(),
                Duration::from_millis(5),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("rl:test:ip:1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_distinct_counts_unique_members() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.add_distinct("set", "a", ttl).await.unwrap(), 1);
        assert_eq!(store.add_distinct("set", "b", ttl).await.unwrap(), 2);
        // Re-adding is idempotent.
        assert_eq!(store.add_distinct("set", "a", ttl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_add_distinct_resets_after_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(5);

        store.add_distinct("set", "a", ttl).await.unwrap();
        store.add_distinct("set", "b", ttl).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.add_distinct("set", "c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_budget_lazy_epoch_reset() {
        let store = MemoryStore::new();

        let first = store
            .increment_budget("budget:x", Duration::from_secs(86400))
            .await
            .unwrap();
        assert_eq!(first.count, 1);

        let second = store
            .increment_budget("budget:x", Duration::from_secs(86400))
            .await
            .unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.epoch_start, first.epoch_start);

        // A zero-length epoch forces the lazy reset path.
        let reset = store
            .increment_budget("budget:x", Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(reset.count, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_store_errors() {
        let store = MemoryStore::new();
        store.set_healthy(false);

        assert!(!store.is_healthy());
        assert!(store.get("any").await.is_err());
        assert!(store
            .add_distinct("any", "m", Duration::from_secs(1))
            .await
            .is_err());

        // Breaker state stays reachable during a data outage.
        assert!(store.breaker_state().await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_flag_increments_and_reads() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.watch_flag("gate:soft:acc1").await.unwrap(), 0);
        assert_eq!(
            store.increment_watch_flag("gate:soft:acc1", ttl).await.unwrap(),
            1
        );
        assert_eq!(
            store.increment_watch_flag("gate:soft:acc1", ttl).await.unwrap(),
            2
        );
        assert_eq!(store.watch_flag("gate:soft:acc1").await.unwrap(), 2);
    }
}
