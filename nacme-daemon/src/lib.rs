//! NACME daemon: onboarding control plane for a Nebula overlay network.
//!
//! Hosts present a pre-issued API key and receive a signed Nebula
//! certificate, a unique overlay address and a unique hostname. The public
//! API (`POST /add`) and the admin API (`POST /keys`) run on separate
//! listeners backed by one SQLite ledger.

pub mod admission;
pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod ledger;
pub mod services;
pub mod signer;
pub mod startup;

pub use admission::{issue_api_key, AdmissionGuard};
pub use config::{RuntimeConfig, ServerConfig};
pub use coordinator::{OnboardError, OnboardRequest, OnboardingCoordinator};
pub use ledger::Ledger;
pub use signer::{NebulaCertSigner, Signer};
