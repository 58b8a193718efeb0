//! API key admission policy.
//!
//! Pure checks applied to a looked-up key record. Metering (consuming a use)
//! is not done here: it happens in the same storage transaction that commits
//! the host, so a failed onboarding never costs a use.

use crate::records::ApiKeyRecord;

/// Why a key was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AdmissionError {
    /// No key with this digest exists.
    #[error("Invalid API key")]
    InvalidKey,

    /// The key's expiration is in the past.
    #[error("API key expired")]
    Expired,

    /// The key has a use counter and it is spent.
    #[error("No uses remaining on API key")]
    Exhausted,

    /// The key authorizes no groups.
    #[error("API key has no groups defined")]
    NoGroups,
}

/// A key that passed admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub api_key_id: i64,
    pub groups: Vec<String>,
    /// Counter at admission time; `Some` means the key is metered.
    pub uses_remaining: Option<i64>,
}

impl Admission {
    /// Whether a successful onboarding must consume a use.
    pub fn is_metered(&self) -> bool {
        self.uses_remaining.is_some()
    }
}

/// Evaluate a key record at time `now` (Unix seconds).
///
/// Checks run in order: existence, expiry (strictly before `now`), remaining
/// uses, groups.
pub fn evaluate_admission(
    record: Option<&ApiKeyRecord>,
    now: i64,
) -> Result<Admission, AdmissionError> {
    let record = record.ok_or(AdmissionError::InvalidKey)?;

    if matches!(record.expiration, Some(expiration) if expiration < now) {
        return Err(AdmissionError::Expired);
    }

    if matches!(record.uses_remaining, Some(uses) if uses <= 0) {
        return Err(AdmissionError::Exhausted);
    }

    if record.groups.is_empty() {
        return Err(AdmissionError::NoGroups);
    }

    Ok(Admission {
        api_key_id: record.id,
        groups: record.groups.clone(),
        uses_remaining: record.uses_remaining,
    })
}
