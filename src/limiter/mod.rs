//! Rate limiting logic and decision orchestration.

mod budget;
mod context;
mod decay;
mod engine;
mod ephemeral;
mod gate;
mod penalty;
mod policy;

pub use budget::BudgetTracker;
pub use context::{LimitDecision, LimitRequest, RateLimitContext, Scope, Verdict};
pub use decay::{owed as decay_owed, DecayOutcome};
pub use engine::RateLimiter;
pub use ephemeral::{ip_scope, EphemeralBucket, EphemeralState};
pub use gate::AntiEquilibriumGate;
pub use penalty::PenaltyLadder;
pub use policy::{
    BlockPolicy, BudgetConfig, FailureMode, ScoreDeltas, Signal, SignalClass, Thresholds,
};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
