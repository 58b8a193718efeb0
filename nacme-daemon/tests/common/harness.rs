//! Test harness for onboarding tests.
//!
//! Runs the real ledger on a temporary SQLite file and swaps the
//! `nebula-cert` process for an in-process stub signer.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use nacme_core::{ApiKeyRecord, NewHost};
use nacme_daemon::config::{ConfigSeed, RuntimeConfig};
use nacme_daemon::ledger::{current_timestamp, CommitOutcome};
use nacme_daemon::services::{admin, onboarding, OnboardingRateLimiter};
use nacme_daemon::signer::{KeyMaterial, SignRequest, SignedCert, Signer, SignerError};
use nacme_daemon::{issue_api_key, Ledger, OnboardRequest, OnboardingCoordinator};
use tempfile::TempDir;

pub const TEST_CA: &str = "-----BEGIN NEBULA CERTIFICATE V2-----\nQ0E=\n-----END NEBULA CERTIFICATE V2-----\n";
pub const MASTER_KEY: &str = "test-master-key";

/// Column a competing host claims while a certificate is being signed.
#[derive(Debug, Clone, Copy)]
pub enum Collision {
    /// Take the IP being signed.
    Ip,
    /// Take the hostname being signed.
    Hostname,
}

#[derive(Clone)]
struct Competitor {
    ledger: Ledger,
    api_key_id: i64,
    on: Collision,
}

/// Signer double that records requests and fabricates certificates.
#[derive(Default)]
pub struct StubSigner {
    pub requests: Mutex<Vec<SignRequest>>,
    fail: AtomicBool,
    /// Delay before answering, to widen race windows.
    delay: Option<Duration>,
    competitor: Mutex<Option<Competitor>>,
}

impl StubSigner {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Signer for StubSigner {
    async fn sign(&self, request: SignRequest) -> Result<SignedCert, SignerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };

        let competitor = self.competitor.lock().unwrap().clone();
        if let Some(competitor) = competitor {
            let (hostname, ip) = match competitor.on {
                Collision::Ip => (format!("competitor-{call}"), request.ip.to_string()),
                Collision::Hostname => (request.hostname.clone(), format!("192.0.2.{call}")),
            };
            let outcome = competitor
                .ledger
                .commit_host(
                    &NewHost {
                        hostname,
                        ip,
                        groups: vec!["fixtures".to_string()],
                        expiry: current_timestamp() + 3600,
                        api_key_id: competitor.api_key_id,
                        cert: "-----BEGIN NEBULA CERTIFICATE V2-----\nZml4\n".to_string(),
                    },
                    false,
                )
                .await
                .expect("Failed to insert competing host");
            assert!(matches!(outcome, CommitOutcome::Committed(_)));
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(SignerError::InvalidCaMaterial);
        }

        let body = BASE64_STANDARD.encode(format!("{} {}", request.hostname, request.ip));
        let key_pem = match request.key {
            KeyMaterial::Generate => Some(
                "-----BEGIN NEBULA X25519 PRIVATE KEY-----\nAAAA\n-----END NEBULA X25519 PRIVATE KEY-----\n"
                    .to_string(),
            ),
            KeyMaterial::PublicKey(_) => None,
        };

        Ok(SignedCert {
            cert_pem: format!(
                "-----BEGIN NEBULA CERTIFICATE V2-----\n{body}\n-----END NEBULA CERTIFICATE V2-----\n"
            ),
            key_pem,
        })
    }
}

/// A valid client public key PEM.
pub fn public_key_pem() -> String {
    format!(
        "-----BEGIN NEBULA X25519 PUBLIC KEY-----\n{}\n-----END NEBULA X25519 PUBLIC KEY-----\n",
        BASE64_STANDARD.encode([7u8; 32])
    )
}

/// Daemon components wired against a temporary database.
pub struct TestDaemon {
    pub ledger: Ledger,
    pub coordinator: OnboardingCoordinator,
    pub signer: Arc<StubSigner>,
    _dir: TempDir,
}

impl TestDaemon {
    pub async fn new(cidr: &str) -> Self {
        Self::build(cidr, StubSigner::default(), false).await
    }

    pub async fn build(cidr: &str, signer: StubSigner, allow_server_keygen: bool) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let ledger = Ledger::open(dir.path().join("nacme.db"), 8)
            .await
            .expect("Failed to open ledger");

        let seed = ConfigSeed {
            cidr: cidr.to_string(),
            default_expiry_days: 365,
            random_suffix_length: 6,
        };
        let config = RuntimeConfig::load(&ledger, &seed, TEST_CA.to_string(), allow_server_keygen)
            .await
            .expect("Failed to load runtime config");

        let signer = Arc::new(signer);
        let coordinator =
            OnboardingCoordinator::new(ledger.clone(), signer.clone(), Arc::new(config));

        Self {
            ledger,
            coordinator,
            signer,
            _dir: dir,
        }
    }

    /// Issue a key and return the raw secret.
    pub async fn issue_key(&self, uses: Option<i64>, expiration: Option<i64>) -> String {
        issue_api_key(&self.ledger, ["servers", "laptops"], expiration, uses)
            .await
            .expect("Failed to issue key")
            .secret
            .expose()
            .to_string()
    }

    pub async fn key_record(&self, raw: &str) -> ApiKeyRecord {
        self.ledger
            .find_api_key(&nacme_core::digest_key(raw))
            .await
            .expect("lookup failed")
            .expect("key missing")
    }

    /// Make every signing call race against a competing host that claims
    /// the IP or hostname being signed before the commit.
    pub async fn collide_on(&self, on: Collision) {
        let api_key_id = issue_api_key(&self.ledger, ["fixtures"], None, None)
            .await
            .expect("Failed to issue fixture key")
            .id;
        *self.signer.competitor.lock().unwrap() = Some(Competitor {
            ledger: self.ledger.clone(),
            api_key_id,
            on,
        });
    }

    /// Insert a host row directly, bypassing the coordinator.
    pub async fn occupy(&self, hostname: &str, ip: &str) {
        let key_id = issue_api_key(&self.ledger, ["fixtures"], None, None)
            .await
            .expect("Failed to issue fixture key")
            .id;
        let outcome = self
            .ledger
            .commit_host(
                &NewHost {
                    hostname: hostname.to_string(),
                    ip: ip.to_string(),
                    groups: vec!["fixtures".to_string()],
                    expiry: current_timestamp() + 3600,
                    api_key_id: key_id,
                    cert: "-----BEGIN NEBULA CERTIFICATE V2-----\nZml4\n".to_string(),
                },
                false,
            )
            .await
            .expect("Failed to insert fixture host");
        assert!(matches!(outcome, CommitOutcome::Committed(_)));
    }

    pub fn request(&self, api_key: &str) -> OnboardRequest {
        OnboardRequest {
            api_key: api_key.to_string(),
            public_key: Some(public_key_pem()),
            ..Default::default()
        }
    }

    pub fn public_router(&self, per_second: u32, burst: u32) -> axum::Router {
        onboarding::router(
            self.coordinator.clone(),
            OnboardingRateLimiter::new(per_second, burst),
        )
    }

    pub fn admin_router(&self) -> axum::Router {
        admin::router(self.ledger.clone(), MASTER_KEY)
    }
}
