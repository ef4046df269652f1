//! Keyed hashing of raw identity material.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Keyed HMAC-SHA256 hasher for device fingerprints.
///
/// The secret is operator-provisioned and never logged. Output is
/// deterministic for a fixed secret, so fingerprints are stable across
/// requests and engine instances sharing the same secret.
pub struct FingerprintHasher {
    secret: Vec<u8>,
}

impl FingerprintHasher {
    /// Create a hasher with the given secret.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Hash the input, returning lowercase hex.
    pub fn hash(&self, input: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(input.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for FingerprintHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret must not leak through Debug output.
        f.debug_struct("FingerprintHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = FingerprintHasher::new(b"test-secret");
        assert_eq!(hasher.hash("v1|chrome/120||"), hasher.hash("v1|chrome/120||"));
    }

    #[test]
    fn test_hash_depends_on_secret() {
        let a = FingerprintHasher::new(b"secret-a");
        let b = FingerprintHasher::new(b"secret-b");
        assert_ne!(a.hash("input"), b.hash("input"));
    }

    #[test]
    fn test_hash_is_hex_sha256_width() {
        let hasher = FingerprintHasher::new(b"test-secret");
        let out = hasher.hash("input");
        assert_eq!(out.len(), 64);
        assert!(out.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_debug_does_not_expose_secret() {
        let hasher = FingerprintHasher::new(b"super-secret");
        let rendered = format!("{:?}", hasher);
        assert!(!rendered.contains("super-secret"));
    }
}
