//! Secret generation and one-way hashing.
//!
//! All randomness comes from the thread-local CSPRNG (`rand::random`). API
//! secrets are stored only as `hex(sha256(secret))`; PKCE uses the RFC 7636
//! S256 transform.

use std::fmt::Write as _;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Random bytes behind an API key id (8 hex chars).
pub const KEY_ID_BYTES: usize = 4;

/// Random bytes behind a raw API secret (64 hex chars).
pub const API_SECRET_BYTES: usize = 32;

/// `n` random bytes, lowercase hex encoded (`2 * n` characters).
#[must_use]
pub fn random_hex(n: usize) -> String {
    let bytes: Vec<u8> = (0..n).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

/// A fresh API key id.
#[must_use]
pub fn new_key_id() -> String {
    random_hex(KEY_ID_BYTES)
}

/// A fresh raw API secret. Only ever returned to the caller once.
#[must_use]
pub fn new_api_secret() -> String {
    random_hex(API_SECRET_BYTES)
}

/// Opaque identifier for clients, sessions and authorization codes.
#[must_use]
pub fn new_opaque_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One-way hash used as the API key lookup key.
#[must_use]
pub fn hash_secret(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// S256 code challenge for a PKCE verifier: `base64url(sha256(verifier))`.
#[must_use]
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Whether `verifier` hashes to `challenge`. Constant time in the challenge
/// contents.
#[must_use]
pub fn pkce_matches(verifier: &str, challenge: &str) -> bool {
    let expected = pkce_challenge(verifier);
    expected.as_bytes().ct_eq(challenge.as_bytes()).into()
}

/// Mask a secret for log output, keeping a short prefix.
#[must_use]
pub fn redact(secret: &str) -> String {
    let mut out: String = secret.chars().take(4).collect();
    let _ = write!(out, "…({} chars)", secret.chars().count());
    out
}
