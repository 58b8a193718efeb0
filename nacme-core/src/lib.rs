//! # NACME Core
//!
//! Pure domain types and policy for the NACME onboarding control plane.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! Storage, process execution and HTTP live in `nacme-daemon`. Everything
//! here is deterministic apart from the OS random source used for API key
//! secrets and hostname suffixes.
//!
//! ## Modules
//!
//! - [`pool`] - CIDR address pool arithmetic and suggested-IP validation
//! - [`hostname`] - Hostname prefix sanitization and suffix generation
//! - [`pubkey`] - Nebula X25519 public key validation
//! - [`apikey`] - API key secrets and digests
//! - [`admission`] - API key admission policy
//! - [`records`] - Persisted record shapes and the certificate bundle

pub mod admission;
pub mod apikey;
pub mod hostname;
pub mod pool;
pub mod pubkey;
pub mod records;

pub use admission::{evaluate_admission, Admission, AdmissionError};
pub use apikey::{digest_key, master_key_matches, ApiKeySecret};
pub use hostname::{random_suffix, HostnamePrefix, PrefixError};
pub use pool::{AddressPool, PoolError};
pub use pubkey::{NebulaPublicKey, PublicKeyError};
pub use records::{normalize_groups, ApiKeyRecord, CertBundle, GroupsError, HostRecord, NewHost};
