//! Nebula X25519 public key validation.
//!
//! Clients generate their own key pair and send only the PEM-encoded public
//! half. The key is forwarded to the signer untouched; this module only
//! checks that it is structurally a Nebula X25519 public key.

use base64::prelude::*;

pub const PUBLIC_KEY_HEADER: &str = "-----BEGIN NEBULA X25519 PUBLIC KEY-----";
pub const PUBLIC_KEY_FOOTER: &str = "-----END NEBULA X25519 PUBLIC KEY-----";

/// Raw X25519 public key length in bytes.
pub const X25519_KEY_LEN: usize = 32;

/// Reasons a public key is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PublicKeyError {
    #[error("public_key cannot be empty")]
    Empty,

    #[error("public_key must be an X25519 Nebula public key")]
    MissingHeader,

    #[error("public_key must have proper PEM footer")]
    MissingFooter,

    #[error("public_key has no body content")]
    EmptyBody,

    #[error("public_key contains invalid base64 content")]
    InvalidBase64,

    #[error("public_key is not a valid X25519 key (incorrect length {0})")]
    WrongLength(usize),
}

/// A PEM public key that passed structural validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NebulaPublicKey {
    pem: String,
}

impl NebulaPublicKey {
    /// Validate a PEM-encoded Nebula X25519 public key.
    pub fn parse(pem: &str) -> Result<Self, PublicKeyError> {
        if pem.is_empty() {
            return Err(PublicKeyError::Empty);
        }
        if !pem.starts_with(PUBLIC_KEY_HEADER) {
            return Err(PublicKeyError::MissingHeader);
        }
        if !pem.contains(PUBLIC_KEY_FOOTER) {
            return Err(PublicKeyError::MissingFooter);
        }

        let body: String = pem
            .trim()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("-----"))
            .collect();
        if body.is_empty() {
            return Err(PublicKeyError::EmptyBody);
        }

        let decoded = BASE64_STANDARD
            .decode(body.as_bytes())
            .map_err(|_| PublicKeyError::InvalidBase64)?;
        if decoded.len() != X25519_KEY_LEN {
            return Err(PublicKeyError::WrongLength(decoded.len()));
        }

        Ok(Self {
            pem: pem.to_string(),
        })
    }

    /// The PEM text exactly as supplied.
    pub fn as_pem(&self) -> &str {
        &self.pem
    }
}
