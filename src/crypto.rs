//! Cryptographic primitives shared across subsystems
//!
//! Token bodies are URL-safe base64 over 32 random bytes (256 bits of
//! entropy). Secrets are stored only as SHA-256 digests; the digest hex
//! strings are compared in constant time to defeat timing oracles.

use base64::Engine;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a URL-safe base64 secret body with 256 bits of entropy.
#[must_use]
pub fn generate_secret_body() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generate an alphanumeric (base62) secret of `len` characters.
///
/// Each character carries ~5.95 bits; 44 characters exceed 256 bits of
/// entropy. Base62 keeps the secret free of the `_` separator used in
/// API key framing.
#[must_use]
pub fn generate_base62(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(rng.sample(rand::distr::Alphanumeric)))
        .collect()
}

/// SHA-256 digest of `input`, hex-encoded.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Constant-time equality over two strings.
///
/// Length is not secret here (both sides are fixed-width digests); the
/// comparison of the bytes themselves must not short-circuit.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Generate a UUID v4 identifier string.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bodies_are_unique_and_long() {
        let a = generate_secret_body();
        let b = generate_secret_body();
        assert_ne!(a, b);
        // 32 bytes => 43 base64url chars
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn base62_secrets_use_only_alphanumerics() {
        let s = generate_base62(44);
        assert_eq!(s.len(), 44);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(s, generate_base62(44));
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex("hello"), sha256_hex("hello"));
        assert_ne!(sha256_hex("hello"), sha256_hex("hellp"));
        // SHA-256 hex digest is 64 chars
        assert_eq!(sha256_hex("hello").len(), 64);
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        let digest = sha256_hex("secret");
        assert!(constant_time_eq(&digest, &digest.clone()));
        assert!(!constant_time_eq(&digest, &sha256_hex("other")));
        assert!(!constant_time_eq("short", "longer-string"));
    }
}
