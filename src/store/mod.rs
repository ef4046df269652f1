//! Store abstractions consumed by the limiter.
//!
//! The engine owns no durable state. Everything it persists goes through
//! these traits, keyed by composite, human-inspectable, colon-delimited
//! strings (e.g. `dev_cap:acc:{account}:{ip_scope}`). TTLs are always
//! specified explicitly by the caller. The concrete backend (Redis or any
//! atomic key-value store with TTL support) lives outside this crate;
//! [`MemoryStore`](memory::MemoryStore) is provided for single-node
//! deployments and tests.
//!
//! `add_distinct`, `increment_budget`, and `increment_watch_flag` are atomic
//! per key. The score state read-modify-write is not; concurrent requests
//! for the same key may under- or over-count by the overlap window. This is
//! an accepted trade for store-call simplicity.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by store implementations.
///
/// These never reach the limiter's callers; the orchestrator converts them
/// into the policy's failure-mode decision.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend reports itself unhealthy or unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A store operation failed.
    #[error("store operation failed: {0}")]
    Backend(String),
}

/// Persisted score state for one (policy, scope, key) tuple.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Current risk score.
    pub score: u64,
    /// Block level reached within the current escalation episode (0 = none).
    pub block_level: u8,
    /// Unix timestamp of the last state write, used for decay.
    pub last_update: u64,
}

/// An active block for one key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockState {
    /// Severity tier, 1-6.
    pub level: u8,
    /// Unix timestamp at which the block lapses.
    pub expires_at: u64,
}

/// Daily-epoch budget counter state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetState {
    /// Requests counted in the current epoch.
    pub count: u64,
    /// Unix timestamp at which the current epoch began.
    pub epoch_start: u64,
}

/// Shared circuit-breaker state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BreakerState {
    /// Whether the circuit is currently open.
    pub open: bool,
    /// Unix timestamp of the transition to open; 0 when closed.
    pub opened_at: u64,
}

/// Primary rate-limit state store.
///
/// Implementations must make `increment_budget` atomic per key. `get`/`put`
/// of score state is a plain read-modify-write seam; see the module docs.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetch the score state for a key, if any.
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, StoreError>;

    /// Write the score state for a key with an explicit TTL.
    async fn put(
        &self,
        key: &str,
        state: RateLimitState,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Fetch the active block for a key, if one exists.
    async fn check_block(&self, key: &str) -> Result<Option<BlockState>, StoreError>;

    /// Record a block for a key.
    async fn block(
        &self,
        key: &str,
        level: u8,
        expires_at: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Atomically increment the budget counter for a key, lazily resetting
    /// it when the previous epoch has lapsed. Returns the updated state.
    async fn increment_budget(
        &self,
        key: &str,
        epoch: Duration,
    ) -> Result<BudgetState, StoreError>;

    /// Fetch the budget state for a key. Stale epochs are returned as-is;
    /// staleness handling is the caller's concern.
    async fn budget(&self, key: &str) -> Result<Option<BudgetState>, StoreError>;

    /// Cheap liveness check consulted before every decision.
    fn is_healthy(&self) -> bool;
}

/// Correlation primitives: distinct-member sets and watch-flag counters.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Atomically insert `member` into the set at `key` and return the
    /// resulting distinct cardinality. The TTL applies from set creation.
    async fn add_distinct(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Atomically increment the watch flag at `key`, returning the new value.
    async fn increment_watch_flag(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Read the watch flag at `key` (0 when absent or expired).
    async fn watch_flag(&self, key: &str) -> Result<u64, StoreError>;
}

/// Shared circuit-breaker state store, so that multiple engine instances
/// agree on whether the backing store's circuit is open.
#[async_trait]
pub trait CircuitBreakerStore: Send + Sync {
    /// Read the current breaker state.
    async fn breaker_state(&self) -> Result<BreakerState, StoreError>;

    /// Replace the breaker state.
    async fn set_breaker_state(&self, state: BreakerState) -> Result<(), StoreError>;
}
