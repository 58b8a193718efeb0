//! API key secrets and digests.
//!
//! Raw keys are shown to the operator exactly once. Only the SHA-256 digest
//! is persisted and looked up, so a database leak does not reveal usable keys.

use base64::prelude::*;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Bytes of entropy in a generated key.
pub const API_KEY_BYTES: usize = 32;

/// A freshly generated API key.
///
/// `Debug` is redacted so the secret never ends up in logs by accident.
#[derive(Clone)]
pub struct ApiKeySecret(String);

impl ApiKeySecret {
    /// Generate a new key: 32 OS-random bytes, URL-safe base64 without padding.
    #[must_use]
    pub fn generate() -> Self {
        let mut random = [0u8; API_KEY_BYTES];
        OsRng.fill_bytes(&mut random);
        Self(BASE64_URL_SAFE_NO_PAD.encode(random))
    }

    /// The raw key, for the one-time display to the operator.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Digest to persist for this key.
    pub fn digest(&self) -> String {
        digest_key(&self.0)
    }
}

impl std::fmt::Debug for ApiKeySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKeySecret(<redacted>)")
    }
}

/// Lowercase hex SHA-256 of a raw key.
pub fn digest_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Compare a presented administrative secret against the configured one.
///
/// Both sides are hashed first so the comparison is constant-time regardless
/// of the presented length.
pub fn master_key_matches(provided: &str, expected: &str) -> bool {
    let provided: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    let expected: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    provided.ct_eq(&expected).into()
}
