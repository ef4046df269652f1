//! Device-farm detection via distinct-fingerprint capping.
//!
//! An attacker who rotates fingerprints faster than the scoring window
//! would otherwise start every request with a fresh score. The bucket caps
//! distinct fingerprints per account and per IP scope inside a rolling
//! window; once a scope is over capacity, all of its devices collapse onto
//! one shared ephemeral key, so rotation stops paying.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::store::{CorrelationStore, StoreError};

use super::context::RateLimitContext;

/// Distinct devices allowed per account scope within the window.
const ACCOUNT_DEVICE_CAP: u64 = 10;
/// Distinct devices allowed per IP scope within the window.
const IP_DEVICE_CAP: u64 = 50;
/// Rolling window for the distinct-count sets.
const WINDOW: Duration = Duration::from_secs(900);

/// Per-request device-farm detection result. Not persisted; the backing
/// sets carry all cross-request state.
#[derive(Debug, Clone, Copy)]
pub struct EphemeralState {
    pub is_ephemeral: bool,
    pub account_device_count: u64,
    pub ip_device_count: u64,
}

/// Scope component derived from the request IP: the /64 prefix for IPv6
/// (first 16 hex chars of the packed address), the raw string for IPv4.
/// Unparseable input degrades to the raw string.
pub fn ip_scope(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => hex::encode(v6.octets())[..16].to_string(),
        _ => ip.to_string(),
    }
}

/// Caps distinct fingerprints per scope and substitutes a shared key once
/// capacity is exceeded.
pub struct EphemeralBucket {
    store: Arc<dyn CorrelationStore>,
    window: Duration,
}

impl EphemeralBucket {
    /// Create a bucket with the standard 15-minute window.
    pub fn new(store: Arc<dyn CorrelationStore>) -> Self {
        Self {
            store,
            window: WINDOW,
        }
    }

    /// Override the window; for tests.
    #[cfg(test)]
    pub fn with_window(store: Arc<dyn CorrelationStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Register the request's fingerprint in its scope sets and report
    /// device counts. Recomputed on every call; membership is idempotent,
    /// so the sets saturate naturally. Over-capacity fingerprints still
    /// land in the set (bounded only by TTL expiry) because the atomic
    /// insert-and-count primitive cannot pre-check membership without
    /// mutating; they merely stop counting as new unique devices.
    pub async fn check(
        &self,
        ctx: &RateLimitContext,
        fingerprint_hash: &str,
    ) -> Result<EphemeralState, StoreError> {
        let scope = ip_scope(&ctx.ip);

        let account_device_count = match &ctx.account_id {
            Some(account) => {
                let key = format!("dev_cap:acc:{}:{}", account, scope);
                self.store
                    .add_distinct(&key, fingerprint_hash, self.window)
                    .await?
            }
            None => 0,
        };

        let key = format!("dev_cap:ip:{}", scope);
        let ip_device_count = self
            .store
            .add_distinct(&key, fingerprint_hash, self.window)
            .await?;

        let is_ephemeral =
            account_device_count > ACCOUNT_DEVICE_CAP || ip_device_count > IP_DEVICE_CAP;
        if is_ephemeral {
            debug!(
                account_devices = account_device_count,
                ip_devices = ip_device_count,
                "scope over device capacity, substituting ephemeral key"
            );
        }

        Ok(EphemeralState {
            is_ephemeral,
            account_device_count,
            ip_device_count,
        })
    }

    /// The key the caller should score against: the shared ephemeral key
    /// when the scope is over capacity (account scope takes priority),
    /// otherwise the real fingerprint hash.
    pub fn resolve_key(
        &self,
        ctx: &RateLimitContext,
        state: &EphemeralState,
        fingerprint_hash: &str,
    ) -> String {
        let scope = ip_scope(&ctx.ip);

        if state.account_device_count > ACCOUNT_DEVICE_CAP {
            if let Some(account) = &ctx.account_id {
                return format!("ephemeral:dev_cap:acc:{}:{}", account, scope);
            }
        }
        if state.ip_device_count > IP_DEVICE_CAP {
            return format!("ephemeral:dev_cap:ip:{}", scope);
        }
        fingerprint_hash.to_string()
    }
}
