//! Observability signals for store health transitions.
//!
//! Emission is strictly observational: nothing here may influence a limit
//! decision. Decisions under store failure come from the policy's failure
//! mode alone.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::store::{BreakerState, CircuitBreakerStore};

/// Circuit-breaker transition events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// The store failed often enough that the circuit opened.
    CircuitOpened,
    /// The store came back and the cool-down elapsed.
    CircuitRecovered,
    /// Store failures keep arriving while the circuit is already open:
    /// traffic is still reaching an unhealthy dependency.
    CircuitReEntryViolation,
}

/// Sink for failure signals. Implementations must be cheap and must not
/// fail; the monitor calls them inline.
pub trait FailureSignalEmitter: Send + Sync {
    fn emit(&self, signal: FailureSignal);
}

/// Default emitter: structured log lines.
pub struct TracingSignalEmitter;

impl FailureSignalEmitter for TracingSignalEmitter {
    fn emit(&self, signal: FailureSignal) {
        match signal {
            FailureSignal::CircuitOpened => warn!(event = "CB_OPENED", "store circuit opened"),
            FailureSignal::CircuitRecovered => {
                info!(event = "CB_RECOVERED", "store circuit recovered")
            }
            FailureSignal::CircuitReEntryViolation => warn!(
                event = "CB_RE_ENTRY_VIOLATION",
                "store failure while circuit already open"
            ),
        }
    }
}

/// Consecutive failures before the circuit opens.
const OPEN_THRESHOLD: u32 = 3;
/// Minimum time the circuit stays open once tripped.
const COOLDOWN: Duration = Duration::from_secs(30);

/// Tracks store health observations, persists breaker state through the
/// shared breaker store, and emits transition signals.
pub struct CircuitMonitor {
    store: Arc<dyn CircuitBreakerStore>,
    emitter: Arc<dyn FailureSignalEmitter>,
    open_threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
}

impl CircuitMonitor {
    /// Create a monitor with the default threshold and cool-down.
    pub fn new(
        store: Arc<dyn CircuitBreakerStore>,
        emitter: Arc<dyn FailureSignalEmitter>,
    ) -> Self {
        Self {
            store,
            emitter,
            open_threshold: OPEN_THRESHOLD,
            cooldown: COOLDOWN,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Override threshold and cool-down; for tests and unusual deployments.
    pub fn with_tuning(mut self, open_threshold: u32, cooldown: Duration) -> Self {
        self.open_threshold = open_threshold;
        self.cooldown = cooldown;
        self
    }

    /// Record the health outcome of one store interaction.
    ///
    /// Breaker-store errors are swallowed: the monitor is observability
    /// only, and a broken breaker store must not add failures of its own.
    pub async fn observe(&self, healthy: bool) {
        let Ok(state) = self.store.breaker_state().await else {
            return;
        };

        if healthy {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            if state.open && now_ts() >= state.opened_at + self.cooldown.as_secs() {
                if self
                    .store
                    .set_breaker_state(BreakerState {
                        open: false,
                        opened_at: 0,
                    })
                    .await
                    .is_ok()
                {
                    self.emitter.emit(FailureSignal::CircuitRecovered);
                }
            }
            return;
        }

        if state.open {
            self.emitter.emit(FailureSignal::CircuitReEntryViolation);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.open_threshold {
            if self
                .store
                .set_breaker_state(BreakerState {
                    open: true,
                    opened_at: now_ts(),
                })
                .await
                .is_ok()
            {
                self.emitter.emit(FailureSignal::CircuitOpened);
            }
        }
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
