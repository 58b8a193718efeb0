//! Persisted record shapes and the certificate bundle returned to clients.

use serde::{Deserialize, Serialize};

/// A stored API key. The raw key itself is never kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key_hash: String,
    /// Unix seconds after which the key is rejected.
    pub expiration: Option<i64>,
    /// Remaining onboardings; `None` means unlimited.
    pub uses_remaining: Option<i64>,
    pub groups: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A host row about to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHost {
    pub hostname: String,
    pub ip: String,
    pub groups: Vec<String>,
    pub expiry: i64,
    pub api_key_id: i64,
    pub cert: String,
}

/// A committed host row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub id: i64,
    pub hostname: String,
    pub ip: String,
    pub groups: Vec<String>,
    pub expiry: i64,
    pub api_key_id: i64,
    pub current_cert: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Everything a client needs to join the overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertBundle {
    pub ca_cert: String,
    pub host_cert: String,
    pub ip: String,
    pub hostname: String,
    /// Certificate expiry, Unix seconds.
    pub expiry: i64,
    /// Private key, only present when the server generated the key pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
}

/// Reasons a group list is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GroupsError {
    #[error("At least one group is required")]
    Empty,

    #[error("group names must be non-empty and may not contain commas or whitespace: {0:?}")]
    InvalidName(String),
}

/// Normalize a group list: trim names, drop duplicates (first occurrence wins).
///
/// Group names end up comma-joined on the signer command line, so commas and
/// embedded whitespace are refused.
pub fn normalize_groups<I, S>(groups: I) -> Result<Vec<String>, GroupsError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for group in groups {
        let name = group.as_ref().trim();
        if name.is_empty() || name.contains(',') || name.chars().any(char::is_whitespace) {
            return Err(GroupsError::InvalidName(name.to_string()));
        }
        if !out.iter().any(|g| g == name) {
            out.push(name.to_string());
        }
    }
    if out.is_empty() {
        return Err(GroupsError::Empty);
    }
    Ok(out)
}
