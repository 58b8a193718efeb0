//! Process and runtime configuration.
//!
//! [`ServerConfig`] comes from the command line and `NACME_*` environment
//! variables. [`RuntimeConfig`] is built once at startup from the ledger's
//! `configs` table (seeded from `ServerConfig` on first run) and is then
//! shared read-only.

use std::net::IpAddr;
use std::path::PathBuf;

use nacme_core::{AddressPool, PoolError};

use crate::ledger::{Ledger, LedgerError, DEFAULT_MAX_CONNECTIONS};

pub const CONFIG_CIDR: &str = "cidr";
pub const CONFIG_DEFAULT_EXPIRY_DAYS: &str = "default_expiry_days";
pub const CONFIG_RANDOM_SUFFIX_LENGTH: &str = "random_suffix_length";

/// Settings for `nacme-daemon serve`.
#[derive(Debug, Clone, clap::Args)]
pub struct ServerConfig {
    /// Port for the public onboarding API
    #[arg(long, env = "NACME_PUBLIC_PORT", default_value_t = 8000)]
    pub public_port: u16,

    /// Port for the admin API
    #[arg(long, env = "NACME_ADMIN_PORT", default_value_t = 9000)]
    pub admin_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "NACME_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Secret required in the X-Master-Key header of admin requests
    #[arg(long, env = "NACME_MASTER_KEY", hide_env_values = true)]
    pub master_key: String,

    #[arg(long, env = "NACME_DB_PATH", default_value = "nacme.db")]
    pub db_path: PathBuf,

    #[arg(long, env = "NACME_DB_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub db_max_connections: u32,

    /// Nebula CA certificate
    #[arg(long, env = "NACME_CA_CERT", default_value = "./ca.crt")]
    pub ca_cert: PathBuf,

    /// Nebula CA private key
    #[arg(long, env = "NACME_CA_KEY", default_value = "./ca.key")]
    pub ca_key: PathBuf,

    /// Overlay subnet host addresses are drawn from, e.g. 10.200.0.0/16
    #[arg(long, env = "NACME_SUBNET_CIDR")]
    pub subnet_cidr: String,

    #[arg(long, env = "NACME_DEFAULT_EXPIRY_DAYS", default_value_t = 365)]
    pub default_expiry_days: u32,

    /// Hex characters appended to generated hostnames
    #[arg(long, env = "NACME_RANDOM_SUFFIX_LENGTH", default_value_t = 6)]
    pub random_suffix_length: u8,

    /// Path or name of the nebula-cert binary
    #[arg(long, env = "NACME_NEBULA_CERT", default_value = "nebula-cert")]
    pub nebula_cert: PathBuf,

    /// Generate host key pairs on the server when a client sends no public key
    #[arg(long, env = "NACME_ALLOW_SERVER_KEYGEN")]
    pub allow_server_keygen: bool,

    /// Sustained /add requests per second
    #[arg(long, env = "NACME_RATE_LIMIT_PER_SECOND", default_value_t = 2)]
    pub rate_limit_per_second: u32,

    #[arg(long, env = "NACME_RATE_LIMIT_BURST", default_value_t = 10)]
    pub rate_limit_burst: u32,
}

impl ServerConfig {
    /// Values used to seed the `configs` table on first start.
    pub fn seed(&self) -> ConfigSeed {
        ConfigSeed {
            cidr: self.subnet_cidr.clone(),
            default_expiry_days: self.default_expiry_days,
            random_suffix_length: self.random_suffix_length,
        }
    }
}

/// Initial values for the persisted runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSeed {
    pub cidr: String,
    pub default_expiry_days: u32,
    pub random_suffix_length: u8,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("missing config key {0:?}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for config key {key:?}")]
    Invalid { key: &'static str, value: String },

    #[error("config key {key:?}: {source}")]
    Pool {
        key: &'static str,
        #[source]
        source: PoolError,
    },

    #[error("failed to read CA certificate {path}: {source}")]
    CaCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Immutable settings shared by every request.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub pool: AddressPool,
    pub default_expiry_days: u32,
    pub random_suffix_length: usize,
    /// CA certificate PEM, returned in every bundle.
    pub ca_cert_pem: String,
    pub allow_server_keygen: bool,
}

impl RuntimeConfig {
    /// Seed missing config rows, then parse all persisted values.
    ///
    /// Values already in the ledger win over `seed`, so a deployment keeps
    /// its subnet even if the environment changes.
    pub async fn load(
        ledger: &Ledger,
        seed: &ConfigSeed,
        ca_cert_pem: String,
        allow_server_keygen: bool,
    ) -> Result<Self, ConfigError> {
        ledger.seed_config(CONFIG_CIDR, &seed.cidr).await?;
        ledger
            .seed_config(CONFIG_DEFAULT_EXPIRY_DAYS, &seed.default_expiry_days.to_string())
            .await?;
        ledger
            .seed_config(CONFIG_RANDOM_SUFFIX_LENGTH, &seed.random_suffix_length.to_string())
            .await?;

        let rows = ledger.load_config().await?;
        let get = |key: &'static str| {
            rows.get(key)
                .map(String::as_str)
                .ok_or(ConfigError::Missing(key))
        };

        let pool = AddressPool::parse(get(CONFIG_CIDR)?).map_err(|source| ConfigError::Pool {
            key: CONFIG_CIDR,
            source,
        })?;
        pool.ensure_usable().map_err(|source| ConfigError::Pool {
            key: CONFIG_CIDR,
            source,
        })?;

        let default_expiry_days =
            parse_positive(CONFIG_DEFAULT_EXPIRY_DAYS, get(CONFIG_DEFAULT_EXPIRY_DAYS)?)?;
        let random_suffix_length =
            parse_positive(CONFIG_RANDOM_SUFFIX_LENGTH, get(CONFIG_RANDOM_SUFFIX_LENGTH)?)?;

        Ok(Self {
            pool,
            default_expiry_days,
            random_suffix_length: random_suffix_length as usize,
            ca_cert_pem,
            allow_server_keygen,
        })
    }

    /// Certificate lifetime in seconds.
    pub fn expiry_secs(&self) -> i64 {
        i64::from(self.default_expiry_days) * 86_400
    }

    pub fn duration_hours(&self) -> u64 {
        u64::from(self.default_expiry_days) * 24
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

/// Read the CA certificate into memory.
pub async fn read_ca_certificate(path: &std::path::Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::CaCertificate {
            path: path.to_path_buf(),
            source,
        })
}
