//! Pre-flight checks run before `serve` opens the database.
//!
//! All problems are collected and reported together so an operator can fix a
//! broken deployment in one pass.

use std::path::{Path, PathBuf};

use nacme_core::AddressPool;

use crate::config::ServerConfig;
use crate::signer::{NebulaCertSigner, SignerError};

/// Startup failed; each entry is one problem.
#[derive(Debug, thiserror::Error)]
#[error("startup validation failed: {}", .problems.join("; "))]
pub struct StartupError {
    pub problems: Vec<String>,
}

/// Validate configuration and the host environment.
pub async fn validate_startup(
    config: &ServerConfig,
    signer: &NebulaCertSigner,
) -> Result<(), StartupError> {
    let mut problems = Vec::new();

    if config.master_key.trim().is_empty() {
        problems.push("NACME_MASTER_KEY must not be empty".to_string());
    }

    match AddressPool::parse(&config.subnet_cidr) {
        Ok(pool) => {
            if let Err(e) = pool.ensure_usable() {
                problems.push(format!("invalid subnet: {e}"));
            }
        }
        Err(e) => problems.push(format!("invalid subnet: {e}")),
    }

    if config.default_expiry_days == 0 {
        problems.push("NACME_DEFAULT_EXPIRY_DAYS must be at least 1".to_string());
    }
    if config.random_suffix_length == 0 {
        problems.push("NACME_RANDOM_SUFFIX_LENGTH must be at least 1".to_string());
    }

    check_readable_file(&config.ca_cert, "CA certificate", &mut problems);
    check_readable_file(&config.ca_key, "CA key", &mut problems);

    match signer.probe().await {
        Ok(version) => tracing::debug!(
            binary = %signer.binary().display(),
            version = %version,
            "nebula-cert available"
        ),
        Err(SignerError::BinaryUnavailable) => problems.push(format!(
            "nebula-cert binary not found: {}",
            signer.binary().display()
        )),
        Err(e) => problems.push(format!("nebula-cert validation failed: {e}")),
    }

    let db_dir = database_dir(&config.db_path);
    if let Err(e) = check_writable_dir(&db_dir) {
        problems.push(format!(
            "Database directory not writable: {} ({e})",
            db_dir.display()
        ));
    }

    if problems.is_empty() {
        tracing::info!("Startup validation passed");
        Ok(())
    } else {
        for problem in &problems {
            tracing::error!(problem = %problem, "Startup validation failed");
        }
        Err(StartupError { problems })
    }
}

fn check_readable_file(path: &Path, label: &str, problems: &mut Vec<String>) {
    if !path.exists() {
        problems.push(format!("{label} not found: {}", path.display()));
    } else if !path.is_file() {
        problems.push(format!("{label} path is not a file: {}", path.display()));
    } else if let Err(e) = std::fs::File::open(path) {
        problems.push(format!("Cannot read {label}: {e}"));
    }
}

/// Directory that will hold the database file.
fn database_dir(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Probe writability by creating a temporary file. A missing directory is
/// fine as long as its nearest existing ancestor is writable.
fn check_writable_dir(dir: &Path) -> std::io::Result<()> {
    let existing = dir
        .ancestors()
        .find(|p| p.as_os_str().is_empty() || p.exists())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    tempfile::tempfile_in(existing).map(drop)
}
