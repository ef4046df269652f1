//! Device identity resolution from request signals.

use regex::Regex;

use super::FingerprintHasher;
use crate::limiter::RateLimitContext;

/// How much trust the resolved fingerprint deserves.
///
/// Escalates LOW (UA only) -> MEDIUM (client fingerprint present) ->
/// HIGH (trusted session with a session device id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Per-request derived device identity. Never persisted by this module.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// HMAC-SHA256 hex digest of the composite identity string.
    pub fingerprint_hash: String,
    pub confidence: Confidence,
    pub is_trusted_session: bool,
    /// Set by the orchestrator once the ephemeral bucket flags the scope.
    pub churn_detected: bool,
    pub normalized_ua: String,
}

/// Builds a normalized device fingerprint and confidence tier from request
/// signals. Always produces a result: a hash over an all-empty composite is
/// intentional and must be treated as LOW confidence by callers.
pub struct DeviceIdentityResolver {
    hasher: FingerprintHasher,
    ua_pattern: Regex,
}

/// Browser tokens in priority order. Chrome UAs also carry a Safari token
/// and Edge/Opera UAs carry a Chrome token, so the more specific markers
/// must win.
const BROWSER_TOKENS: &[(&str, &str)] = &[
    ("edg", "edge"),
    ("opr", "opera"),
    ("chrome", "chrome"),
    ("firefox", "firefox"),
    ("safari", "safari"),
];

/// Maximum length of the lowercase fallback when no browser token matches.
const UA_FALLBACK_LEN: usize = 50;

impl DeviceIdentityResolver {
    /// Create a resolver hashing with the given secret.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            hasher: FingerprintHasher::new(secret),
            ua_pattern: Regex::new(r"(?i)\b(edg|opr|chrome|firefox|safari)/(\d+)").unwrap(),
        }
    }

    /// Resolve the device identity for a request context.
    pub fn resolve(&self, ctx: &RateLimitContext) -> DeviceIdentity {
        let normalized_ua = self.normalize_ua(&ctx.ua);

        let client_fp = ctx
            .client_fingerprint
            .as_ref()
            .map(|map| serde_json::to_string(map).unwrap_or_default())
            .unwrap_or_default();

        let session_fp = ctx.session_device_id.clone().unwrap_or_default();

        let confidence = if !session_fp.is_empty() && ctx.is_session_trusted {
            Confidence::High
        } else if !client_fp.is_empty() {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        let composite = format!("v1|{}|{}|{}", normalized_ua, client_fp, session_fp);

        DeviceIdentity {
            fingerprint_hash: self.hasher.hash(&composite),
            confidence,
            is_trusted_session: ctx.is_session_trusted,
            churn_detected: false,
            normalized_ua,
        }
    }

    /// Normalize a user-agent string to `"{browser}/{major}"`, falling back
    /// to the lowercase first 50 characters of the raw UA.
    fn normalize_ua(&self, ua: &str) -> String {
        let mut best: Option<(usize, &str, String)> = None;
        for caps in self.ua_pattern.captures_iter(ua) {
            let token = caps[1].to_ascii_lowercase();
            let Some(priority) = BROWSER_TOKENS.iter().position(|(t, _)| *t == token) else {
                continue;
            };
            if best.as_ref().map_or(true, |(p, _, _)| priority < *p) {
                best = Some((priority, BROWSER_TOKENS[priority].1, caps[2].to_string()));
            }
        }

        match best {
            Some((_, name, major)) => format!("{}/{}", name, major),
            None => ua.to_lowercase().chars().take(UA_FALLBACK_LEN).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn resolver() -> DeviceIdentityResolver {
        DeviceIdentityResolver::new(b"test-secret")
    }

    fn base_ctx() -> RateLimitContext {
        RateLimitContext::new("203.0.113.9", CHROME_UA)
    }

    #[test]
    fn test_chrome_ua_yields_low_confidence() {
        let identity = resolver().resolve(&base_ctx());
        assert_eq!(identity.normalized_ua, "chrome/120");
        assert_eq!(identity.confidence, Confidence::Low);
        assert!(!identity.fingerprint_hash.is_empty());
    }

    #[test]
    fn test_edge_token_wins_over_chrome() {
        let ua = "Mozilla/5.0 ... Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";
        let ctx = RateLimitContext::new("203.0.113.9", ua);
        let identity = resolver().resolve(&ctx);
        assert_eq!(identity.normalized_ua, "edge/120");
    }

    #[test]
    fn test_unknown_ua_falls_back_to_prefix() {
        let ua = "SomeExoticAgent With A Rather Long Identification String v9.9.9 extra";
        let ctx = RateLimitContext::new("203.0.113.9", ua);
        let identity = resolver().resolve(&ctx);
        assert_eq!(identity.normalized_ua.len(), 50);
        assert_eq!(identity.normalized_ua, ua.to_lowercase()[..50]);
    }

    #[test]
    fn test_client_fingerprint_raises_confidence_to_medium() {
        let mut fp = BTreeMap::new();
        fp.insert("screen".to_string(), serde_json::json!("1920x1080"));
        let ctx = base_ctx().with_client_fingerprint(fp);
        let identity = resolver().resolve(&ctx);
        assert_eq!(identity.confidence, Confidence::Medium);
    }

    #[test]
    fn test_trusted_session_raises_confidence_to_high() {
        let mut fp = BTreeMap::new();
        fp.insert("screen".to_string(), serde_json::json!("1920x1080"));
        let ctx = base_ctx()
            .with_client_fingerprint(fp)
            .with_session("device-123", true);
        let identity = resolver().resolve(&ctx);
        assert_eq!(identity.confidence, Confidence::High);
    }

    #[test]
    fn test_untrusted_session_does_not_raise_confidence() {
        let ctx = base_ctx().with_session("device-123", false);
        let identity = resolver().resolve(&ctx);
        assert_eq!(identity.confidence, Confidence::Low);
    }

    #[test]
    fn test_fingerprint_ignores_client_map_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("a".to_string(), serde_json::json!(1));
        a.insert("b".to_string(), serde_json::json!(2));

        let mut b = BTreeMap::new();
        b.insert("b".to_string(), serde_json::json!(2));
        b.insert("a".to_string(), serde_json::json!(1));

        let r = resolver();
        let fp_a = r.resolve(&base_ctx().with_client_fingerprint(a)).fingerprint_hash;
        let fp_b = r.resolve(&base_ctx().with_client_fingerprint(b)).fingerprint_hash;
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn test_empty_signals_still_produce_a_hash() {
        let ctx = RateLimitContext::new("203.0.113.9", "");
        let identity = resolver().resolve(&ctx);
        assert_eq!(identity.fingerprint_hash.len(), 64);
        assert_eq!(identity.confidence, Confidence::Low);
    }
}
