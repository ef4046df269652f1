//! Per-request facts and decision types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ephemeral::EphemeralState;
use super::policy::FailureMode;

/// Immutable per-request identity context. Created once per request by the
/// embedding middleware and never mutated.
#[derive(Debug, Clone)]
pub struct RateLimitContext {
    /// Remote address as received (IPv4 dotted quad or IPv6 text form).
    pub ip: String,
    /// Raw user-agent header value.
    pub ua: String,
    /// Authenticated account id, when known.
    pub account_id: Option<String>,
    /// Client-declared fingerprint attributes. Ordered map so the
    /// serialized form is deterministic.
    pub client_fingerprint: Option<BTreeMap<String, serde_json::Value>>,
    /// Device id bound to the session, when one exists.
    pub session_device_id: Option<String>,
    /// Whether the session has passed server-side trust checks.
    pub is_session_trusted: bool,
    /// Remaining request headers of interest to callers.
    pub headers: BTreeMap<String, String>,
}

impl RateLimitContext {
    /// Create a context from the two signals every request carries.
    pub fn new(ip: impl Into<String>, ua: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ua: ua.into(),
            account_id: None,
            client_fingerprint: None,
            session_device_id: None,
            is_session_trusted: false,
            headers: BTreeMap::new(),
        }
    }

    /// Attach an authenticated account id.
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Attach a client-declared fingerprint.
    pub fn with_client_fingerprint(
        mut self,
        fingerprint: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        self.client_fingerprint = Some(fingerprint);
        self
    }

    /// Attach a session device id and its trust status.
    pub fn with_session(mut self, device_id: impl Into<String>, trusted: bool) -> Self {
        self.session_device_id = Some(device_id.into());
        self.is_session_trusted = trusted;
        self
    }

    /// Attach a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What the caller wants evaluated for this request.
#[derive(Debug, Clone)]
pub struct LimitRequest {
    /// Registered policy name.
    pub policy: String,
    /// Multiplier applied to the fired signal's score delta.
    pub cost: u32,
    /// Evaluate thresholds without charging or mutating state.
    pub is_precheck: bool,
    /// The request represents a failed attempt (wrong password, bad OTP...).
    pub is_failure: bool,
    /// The request represents a successful attempt; charges nothing.
    pub is_success: bool,
}

impl LimitRequest {
    /// A normal counted request with cost 1.
    pub fn charge(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            cost: 1,
            is_precheck: false,
            is_failure: false,
            is_success: false,
        }
    }

    /// Check the current standing without charging.
    pub fn precheck(policy: impl Into<String>) -> Self {
        Self {
            is_precheck: true,
            ..Self::charge(policy)
        }
    }

    /// Record a failed attempt.
    pub fn failure(policy: impl Into<String>) -> Self {
        Self {
            is_failure: true,
            ..Self::charge(policy)
        }
    }

    /// Record a successful attempt.
    pub fn success(policy: impl Into<String>) -> Self {
        Self {
            is_success: true,
            ..Self::charge(policy)
        }
    }

    /// Override the cost multiplier.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// Scope a score key is tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Account,
    Device,
    Ip,
}

impl Scope {
    /// Key segment for this scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Account => "acc",
            Scope::Device => "dev",
            Scope::Ip => "ip",
        }
    }
}

/// The outcome of a limit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    Allow,
    SoftBlock,
    HardBlock,
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// Map a block level to its verdict.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verdict::Allow,
            1 => Verdict::SoftBlock,
            _ => Verdict::HardBlock,
        }
    }
}

/// Decision returned to the caller for every request.
#[derive(Debug, Clone)]
pub struct LimitDecision {
    pub verdict: Verdict,
    /// Block level backing the verdict, when one applies.
    pub block_level: Option<u8>,
    /// How long the caller should tell the client to wait.
    pub retry_after: Option<Duration>,
    /// The policy's configured failure mode, echoed for observability.
    pub failure_mode: FailureMode,
    /// True when the decision came from the failure mode because the store
    /// was unavailable, rather than from scoring.
    pub degraded: bool,
    /// Device-farm detection metadata, when the check ran.
    pub ephemeral: Option<EphemeralState>,
}

impl LimitDecision {
    /// An allow decision outside any failure path.
    pub(crate) fn allow(failure_mode: FailureMode) -> Self {
        Self {
            verdict: Verdict::Allow,
            block_level: None,
            retry_after: None,
            failure_mode,
            degraded: false,
            ephemeral: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builders() {
        let ctx = RateLimitContext::new("1.2.3.4", "agent")
            .with_account("acc-9")
            .with_session("dev-1", true)
            .with_header("x-request-id", "r1");

        assert_eq!(ctx.account_id.as_deref(), Some("acc-9"));
        assert_eq!(ctx.session_device_id.as_deref(), Some("dev-1"));
        assert!(ctx.is_session_trusted);
        assert_eq!(ctx.headers.get("x-request-id").map(String::as_str), Some("r1"));
    }

    #[test]
    fn test_request_constructors() {
        let charge = LimitRequest::charge("login_protection");
        assert_eq!(charge.cost, 1);
        assert!(!charge.is_precheck && !charge.is_failure && !charge.is_success);

        let precheck = LimitRequest::precheck("login_protection");
        assert!(precheck.is_precheck);

        let failure = LimitRequest::failure("login_protection").with_cost(2);
        assert!(failure.is_failure);
        assert_eq!(failure.cost, 2);
    }

    #[test]
    fn test_verdict_ordering_tracks_severity() {
        assert!(Verdict::Allow < Verdict::SoftBlock);
        assert!(Verdict::SoftBlock < Verdict::HardBlock);
        assert_eq!(Verdict::from_level(0), Verdict::Allow);
        assert_eq!(Verdict::from_level(1), Verdict::SoftBlock);
        assert_eq!(Verdict::from_level(5), Verdict::HardBlock);
    }
}
