//! Host onboarding.
//!
//! One call turns an API key into a signed certificate bundle:
//! validate the request, admit the key, then allocate, sign and commit until
//! the commit sticks or the attempt budget runs out. Allocation is optimistic,
//! so a commit can lose a race on `ip` or `hostname`; the losing attempt's
//! certificate is thrown away and the next attempt allocates again, never
//! handing out an IP or hostname an earlier attempt already lost with.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use nacme_core::{
    Admission, AdmissionError, CertBundle, HostnamePrefix, NebulaPublicKey, NewHost, PoolError,
    PrefixError, PublicKeyError,
};

use crate::admission::{AdmissionGuard, AdmitError};
use crate::allocator::{allocate_hostname, allocate_ip, AllocationError, Excluding};
use crate::config::RuntimeConfig;
use crate::ledger::{current_timestamp, CommitOutcome, ConflictField, Ledger, LedgerError};
use crate::signer::{KeyMaterial, SignRequest, Signer, SignerError};

/// Allocate/sign/commit rounds per request.
pub const MAX_ATTEMPTS: usize = 10;

/// An onboarding request as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnboardRequest {
    pub api_key: String,
    pub hostname_prefix: Option<String>,
    pub public_key: Option<String>,
    pub suggested_ip: Option<String>,
}

/// Coarse failure category, used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The key was refused.
    Unauthorized,
    /// The request body is malformed.
    Validation,
    /// No address or hostname could be found.
    Capacity,
    /// Certificate signing failed.
    Signer,
    /// Server-side misconfiguration or bad stored data.
    Internal,
    /// The database failed.
    Storage,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OnboardError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Prefix(#[from] PrefixError),

    #[error(transparent)]
    PublicKey(#[from] PublicKeyError),

    #[error("public_key is required")]
    PublicKeyRequired,

    #[error("Invalid suggested_ip: {0:?} is not a valid IP address")]
    MalformedSuggestedIp(String),

    #[error("Invalid suggested_ip: {0}")]
    SuggestedIp(#[source] PoolError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("Failed to allocate unique IP/hostname after {0} attempts")]
    RetriesExhausted(usize),

    #[error(transparent)]
    Storage(#[from] LedgerError),
}

impl From<AdmitError> for OnboardError {
    fn from(err: AdmitError) -> Self {
        match err {
            AdmitError::Denied(e) => Self::Admission(e),
            AdmitError::Storage(e) => Self::Storage(e),
        }
    }
}

impl OnboardError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Admission(AdmissionError::NoGroups) => FailureClass::Internal,
            Self::Admission(_) => FailureClass::Unauthorized,
            Self::Prefix(_)
            | Self::PublicKey(_)
            | Self::PublicKeyRequired
            | Self::MalformedSuggestedIp(_)
            | Self::SuggestedIp(_) => FailureClass::Validation,
            Self::Allocation(AllocationError::Storage(_)) => FailureClass::Storage,
            Self::Allocation(AllocationError::Pool(_)) => FailureClass::Internal,
            Self::Allocation(_) => FailureClass::Capacity,
            Self::Signer(_) => FailureClass::Signer,
            Self::RetriesExhausted(_) => FailureClass::Internal,
            Self::Storage(_) => FailureClass::Storage,
        }
    }
}

/// Request fields that passed validation.
struct Validated {
    prefix: HostnamePrefix,
    key: KeyMaterial,
    suggested_ip: Option<IpAddr>,
}

enum AttemptOutcome {
    Committed(CertBundle),
    Conflict {
        field: ConflictField,
        ip: IpAddr,
        hostname: String,
    },
}

/// Values handed out by attempts that lost at commit.
#[derive(Default)]
struct Discarded {
    ips: HashSet<IpAddr>,
    hostnames: HashSet<String>,
}

/// Runs the onboarding flow. Cheap to clone.
#[derive(Clone)]
pub struct OnboardingCoordinator {
    guard: AdmissionGuard,
    ledger: Ledger,
    signer: Arc<dyn Signer>,
    config: Arc<RuntimeConfig>,
}

impl OnboardingCoordinator {
    pub fn new(ledger: Ledger, signer: Arc<dyn Signer>, config: Arc<RuntimeConfig>) -> Self {
        Self {
            guard: AdmissionGuard::new(ledger.clone()),
            ledger,
            signer,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Onboard one host.
    ///
    /// A key use is consumed only if this returns `Ok`.
    pub async fn onboard(&self, request: OnboardRequest) -> Result<CertBundle, OnboardError> {
        let validated = self.validate(&request)?;

        let admission = match self.guard.admit(&request.api_key).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::warn!(
                    prefix = ?request.hostname_prefix,
                    error = %e,
                    "Admission refused"
                );
                return Err(e.into());
            }
        };

        let mut suggested = validated
            .suggested_ip
            .map(|ip| self.check_suggested_ip(ip))
            .transpose()?;

        let now = current_timestamp();
        let expiry = now + self.config.expiry_secs();
        let mut discarded = Discarded::default();

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = self
                .attempt(&validated, &admission, suggested, &discarded, expiry)
                .await?;

            match outcome {
                AttemptOutcome::Committed(bundle) => {
                    tracing::info!(
                        hostname = %bundle.hostname,
                        ip = %bundle.ip,
                        api_key_id = admission.api_key_id,
                        attempt,
                        server_keygen = bundle.host_key.is_some(),
                        "Host onboarded"
                    );
                    return Ok(bundle);
                }
                AttemptOutcome::Conflict {
                    field,
                    ip,
                    hostname,
                } => {
                    tracing::warn!(
                        field = %field,
                        ip = %ip,
                        hostname = %hostname,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        "Allocation collided at commit, retrying"
                    );
                    if suggested == Some(ip) {
                        suggested = None;
                    }
                    discarded.ips.insert(ip);
                    discarded.hostnames.insert(hostname);
                }
            }
        }

        tracing::error!(
            api_key_id = admission.api_key_id,
            attempts = MAX_ATTEMPTS,
            "Onboarding retries exhausted"
        );
        Err(OnboardError::RetriesExhausted(MAX_ATTEMPTS))
    }

    fn validate(&self, request: &OnboardRequest) -> Result<Validated, OnboardError> {
        let prefix = match request.hostname_prefix.as_deref() {
            Some(raw) => HostnamePrefix::sanitize(raw)?,
            None => HostnamePrefix::default(),
        };

        let key = match request.public_key.as_deref() {
            Some(pem) => KeyMaterial::PublicKey(NebulaPublicKey::parse(pem)?),
            None if self.config.allow_server_keygen => KeyMaterial::Generate,
            None => return Err(OnboardError::PublicKeyRequired),
        };

        let suggested_ip = request
            .suggested_ip
            .as_deref()
            .map(|raw| {
                raw.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| OnboardError::MalformedSuggestedIp(raw.to_string()))
            })
            .transpose()?;

        Ok(Validated {
            prefix,
            key,
            suggested_ip,
        })
    }

    /// Pool membership is checked only for admitted requests.
    fn check_suggested_ip(&self, ip: IpAddr) -> Result<IpAddr, OnboardError> {
        self.config.pool.validate_assignable(ip).map_err(|e| {
            tracing::warn!(ip = %ip, error = %e, "Suggested IP rejected");
            OnboardError::SuggestedIp(e)
        })
    }

    async fn attempt(
        &self,
        validated: &Validated,
        admission: &Admission,
        suggested: Option<IpAddr>,
        discarded: &Discarded,
        expiry: i64,
    ) -> Result<AttemptOutcome, OnboardError> {
        let pool = &self.config.pool;
        let occupancy = Excluding::new(&self.ledger, &discarded.ips, &discarded.hostnames);

        let ip = allocate_ip(pool, &occupancy, suggested).await?;
        let hostname =
            allocate_hostname(&validated.prefix, self.config.random_suffix_length, &occupancy)
                .await?;

        let signed = self
            .signer
            .sign(SignRequest {
                hostname: hostname.clone(),
                ip,
                prefix_len: pool.prefix_len(),
                groups: admission.groups.clone(),
                duration_hours: self.config.duration_hours(),
                key: validated.key.clone(),
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    hostname = %hostname,
                    ip = %ip,
                    error = ?e,
                    "Certificate signing failed"
                );
                e
            })?;

        let host = NewHost {
            hostname: hostname.clone(),
            ip: ip.to_string(),
            groups: admission.groups.clone(),
            expiry,
            api_key_id: admission.api_key_id,
            cert: signed.cert_pem,
        };

        match self.ledger.commit_host(&host, admission.is_metered()).await? {
            CommitOutcome::Committed(record) => Ok(AttemptOutcome::Committed(CertBundle {
                ca_cert: self.config.ca_cert_pem.clone(),
                host_cert: record.current_cert,
                ip: record.ip,
                hostname: record.hostname,
                expiry: record.expiry,
                host_key: signed.key_pem,
            })),
            CommitOutcome::Conflict(field) => Ok(AttemptOutcome::Conflict {
                field,
                ip,
                hostname,
            }),
            CommitOutcome::KeyExhausted => {
                tracing::warn!(
                    api_key_id = admission.api_key_id,
                    "Key spent by a concurrent request"
                );
                Err(AdmissionError::Exhausted.into())
            }
        }
    }
}
