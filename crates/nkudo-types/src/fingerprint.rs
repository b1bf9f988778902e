//! Salted fingerprints for bearer secrets.
//!
//! API keys, enrollment tokens, and refresh tokens exist in plaintext only
//! inside the creation response. Everything persisted is a salted SHA-256
//! fingerprint in the form `<salt_hex>$<digest_hex>`. Verification recomputes
//! the digest under the stored salt and compares in constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Separator between the hex salt and the hex digest in a stored fingerprint.
const SEPARATOR: char = '$';

/// Generate a new bearer secret with the given prefix.
///
/// The body is 256 bits of OS CSPRNG randomness (two UUID v4s), hex-encoded.
/// Prefixes (`nkak_` for API keys, `nket_` for enrollment tokens, `nkrt_`
/// for refresh tokens) make leaked secrets attributable in scanners.
#[must_use]
pub fn generate_secret(prefix: &str) -> String {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    format!("{prefix}{}{}", a.as_simple(), b.as_simple())
}

/// Fingerprint a plaintext secret under a fresh random salt.
///
/// Returns `<salt_hex>$<digest_hex>` where
/// `digest = SHA-256(salt || plaintext)`.
#[must_use]
pub fn hash_secret(plaintext: &str) -> String {
    let salt = Uuid::new_v4();
    hash_secret_with_salt(plaintext, salt.as_bytes())
}

fn hash_secret_with_salt(plaintext: &str, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(plaintext.as_bytes());
    let digest = hasher.finalize();
    format!("{}{SEPARATOR}{}", hex::encode(salt), hex::encode(digest))
}

/// Verify a plaintext secret against a stored fingerprint.
///
/// Malformed fingerprints verify as false — a corrupted row must never
/// authenticate anything. The digest comparison is constant-time.
#[must_use]
pub fn verify_secret(plaintext: &str, stored: &str) -> bool {
    let Some((salt_hex, _)) = stored.split_once(SEPARATOR) else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let recomputed = hash_secret_with_salt(plaintext, &salt);
    recomputed.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// A short display prefix for a secret (first 12 characters).
///
/// Used in listings so operators can correlate keys without ever seeing
/// the full plaintext again.
#[must_use]
pub fn display_prefix(plaintext: &str) -> String {
    let end = plaintext
        .char_indices()
        .nth(12)
        .map_or(plaintext.len(), |(i, _)| i);
    format!("{}...", &plaintext[..end])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_roundtrip() {
        let secret = generate_secret("nkak_");
        let stored = hash_secret(&secret);
        assert!(verify_secret(&secret, &stored));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let stored = hash_secret("nkak_correct");
        assert!(!verify_secret("nkak_wrong", &stored));
    }

    #[test]
    fn same_secret_hashes_differently_per_salt() {
        let a = hash_secret("nket_token");
        let b = hash_secret("nket_token");
        assert_ne!(a, b);
        assert!(verify_secret("nket_token", &a));
        assert!(verify_secret("nket_token", &b));
    }

    #[test]
    fn malformed_fingerprint_never_verifies() {
        assert!(!verify_secret("anything", "no-separator-here"));
        assert!(!verify_secret("anything", "zzzz$deadbeef"));
        assert!(!verify_secret("anything", ""));
    }

    #[test]
    fn generated_secrets_carry_prefix_and_entropy() {
        let s = generate_secret("nkrt_");
        assert!(s.starts_with("nkrt_"));
        // Two simple-format UUIDs: 64 hex chars after the prefix.
        assert_eq!(s.len(), "nkrt_".len() + 64);
        assert_ne!(generate_secret("nkrt_"), generate_secret("nkrt_"));
    }

    #[test]
    fn display_prefix_truncates() {
        let s = "nkak_0123456789abcdef";
        assert_eq!(display_prefix(s), "nkak_0123456...");
    }
}
