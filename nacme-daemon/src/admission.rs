//! API key admission and issuance against the ledger.

use nacme_core::{
    digest_key, evaluate_admission, normalize_groups, Admission, AdmissionError, ApiKeySecret,
    GroupsError,
};

use crate::ledger::{current_timestamp, Ledger, LedgerError};

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error(transparent)]
    Denied(#[from] AdmissionError),
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IssueError {
    #[error(transparent)]
    Groups(#[from] GroupsError),
    #[error("uses_remaining must be >= 0")]
    NegativeUses,
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

/// Looks up presented API keys and applies the admission policy.
#[derive(Clone)]
pub struct AdmissionGuard {
    ledger: Ledger,
}

impl AdmissionGuard {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Check a raw key. No use is consumed here.
    pub async fn admit(&self, raw_key: &str) -> Result<Admission, AdmitError> {
        let record = self.ledger.find_api_key(&digest_key(raw_key)).await?;
        let admission = evaluate_admission(record.as_ref(), current_timestamp())?;
        Ok(admission)
    }
}

/// A newly issued key. The secret is not recoverable afterwards.
#[derive(Debug)]
pub struct IssuedKey {
    pub id: i64,
    pub secret: ApiKeySecret,
    pub groups: Vec<String>,
}

/// Generate a key and store its digest.
pub async fn issue_api_key<I, S>(
    ledger: &Ledger,
    groups: I,
    expiration: Option<i64>,
    uses_remaining: Option<i64>,
) -> Result<IssuedKey, IssueError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let groups = normalize_groups(groups)?;
    if matches!(uses_remaining, Some(n) if n < 0) {
        return Err(IssueError::NegativeUses);
    }

    let secret = ApiKeySecret::generate();
    let id = ledger
        .insert_api_key(&secret.digest(), expiration, uses_remaining, &groups)
        .await?;

    tracing::info!(
        api_key_id = id,
        groups = ?groups,
        expiration = ?expiration,
        uses_remaining = ?uses_remaining,
        "API key created"
    );

    Ok(IssuedKey { id, secret, groups })
}
