//! Per-endpoint block policies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::context::Scope;

/// Behavior when the backing store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Never block on infrastructure failure. For low-risk endpoints.
    FailOpen,
    /// Deny by default on infrastructure failure. For login/OTP, where an
    /// open door is worse than a stuck one.
    FailClosed,
}

/// Score thresholds for one signal class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Soft block (level 1).
    pub l1: u64,
    /// Hard block (level 2).
    pub l2: u64,
    /// Extended hard block (level 3).
    pub l3: u64,
}

/// Score increments per signal type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreDeltas {
    #[serde(default)]
    pub access: u64,
    #[serde(default)]
    pub spray: u64,
    #[serde(default)]
    pub missing_fingerprint: u64,
    #[serde(default)]
    pub failure: u64,
    #[serde(default)]
    pub repeated_missing_fingerprint: u64,
}

/// Secondary epoch-based hard cap, independent of scoring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Requests per 24h epoch before the budget trips.
    pub threshold: u64,
    /// Block level applied when the budget is exceeded.
    pub block_level: u8,
}

/// The signal a counted request fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Access,
    Spray,
    MissingFingerprint,
    Failure,
    RepeatedMissingFingerprint,
}

impl Signal {
    /// The threshold class this signal is evaluated against.
    pub fn class(&self) -> SignalClass {
        match self {
            Signal::Access => SignalClass::K1,
            Signal::Spray => SignalClass::K2,
            Signal::MissingFingerprint => SignalClass::K3,
            Signal::Failure => SignalClass::K4,
            Signal::RepeatedMissingFingerprint => SignalClass::K5,
        }
    }
}

/// Threshold class key.
///
/// Known classes are closed variants; anything else is carried verbatim in
/// `Other` so unknown configuration values degrade to the default
/// thresholds instead of erroring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignalClass {
    K1,
    K2,
    K3,
    K4,
    K5,
    Other(String),
}

impl SignalClass {
    /// Parse a class key. Never fails; unknown values become `Other`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "k1" => SignalClass::K1,
            "k2" => SignalClass::K2,
            "k3" => SignalClass::K3,
            "k4" => SignalClass::K4,
            "k5" => SignalClass::K5,
            other => SignalClass::Other(other.to_string()),
        }
    }
}

/// Static configuration for one protected endpoint.
///
/// Immutable once built; the registry hands out shared references. Policies
/// are plain injected values, not globals, so tests can substitute their
/// own freely.
#[derive(Debug, Clone)]
pub struct BlockPolicy {
    pub name: String,
    /// Per-class thresholds; classes not present fall back to `default_thresholds`.
    pub thresholds: HashMap<SignalClass, Thresholds>,
    pub default_thresholds: Thresholds,
    pub deltas: ScoreDeltas,
    pub failure_mode: FailureMode,
    pub budget: Option<BudgetConfig>,
    /// Scopes this policy scores against. Account is skipped when the
    /// request carries no account id.
    pub scopes: Vec<Scope>,
}

impl BlockPolicy {
    /// Thresholds for a signal class, falling back to the default set.
    pub fn thresholds_for(&self, class: &SignalClass) -> Thresholds {
        self.thresholds
            .get(class)
            .copied()
            .unwrap_or(self.default_thresholds)
    }

    /// Score delta for a fired signal.
    pub fn delta(&self, signal: Signal) -> u64 {
        match signal {
            Signal::Access => self.deltas.access,
            Signal::Spray => self.deltas.spray,
            Signal::MissingFingerprint => self.deltas.missing_fingerprint,
            Signal::Failure => self.deltas.failure,
            Signal::RepeatedMissingFingerprint => self.deltas.repeated_missing_fingerprint,
        }
    }
}
