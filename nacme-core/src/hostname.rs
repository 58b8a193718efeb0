//! Hostname prefix sanitization and random suffixes.
//!
//! Generated hostnames have the shape `<prefix>-<suffix>` where the suffix is
//! a fixed number of lowercase hex characters drawn from the OS RNG.

use rand::rngs::OsRng;
use rand::RngCore;

/// Longest accepted prefix, measured after trimming whitespace.
pub const MAX_PREFIX_LEN: usize = 63;

/// Prefix used when the caller does not supply one.
pub const DEFAULT_PREFIX: &str = "node";

/// Reasons a hostname prefix is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PrefixError {
    #[error("hostname_prefix must be 63 characters or less")]
    TooLong,

    #[error("hostname_prefix may only contain letters, numbers, and hyphens")]
    InvalidCharacters,

    #[error("hostname_prefix cannot be empty after sanitization")]
    Empty,
}

/// A sanitized hostname prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostnamePrefix(String);

impl HostnamePrefix {
    /// Sanitize a caller-supplied prefix.
    ///
    /// Steps, in order: trim whitespace, enforce the length limit, enforce the
    /// `[A-Za-z0-9-]` charset, collapse hyphen runs, strip leading and trailing
    /// hyphens, reject an empty result.
    pub fn sanitize(raw: &str) -> Result<Self, PrefixError> {
        let trimmed = raw.trim();

        if trimmed.chars().count() > MAX_PREFIX_LEN {
            return Err(PrefixError::TooLong);
        }

        if trimmed.is_empty()
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(PrefixError::InvalidCharacters);
        }

        let mut collapsed = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            if c == '-' && collapsed.ends_with('-') {
                continue;
            }
            collapsed.push(c);
        }

        let stripped = collapsed.trim_matches('-');
        if stripped.is_empty() {
            return Err(PrefixError::Empty);
        }

        Ok(Self(stripped.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join the prefix with a suffix: `<prefix>-<suffix>`.
    pub fn with_suffix(&self, suffix: &str) -> String {
        format!("{}-{}", self.0, suffix)
    }
}

impl Default for HostnamePrefix {
    fn default() -> Self {
        Self(DEFAULT_PREFIX.to_string())
    }
}

impl std::fmt::Display for HostnamePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate `len` random lowercase hex characters.
pub fn random_suffix(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    OsRng.fill_bytes(&mut bytes);
    let mut suffix = hex::encode(bytes);
    suffix.truncate(len);
    suffix
}
