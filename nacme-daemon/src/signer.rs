//! Certificate signing.
//!
//! The coordinator only sees the [`Signer`] trait. Production uses
//! [`NebulaCertSigner`], which shells out to `nebula-cert sign` inside a
//! private temporary directory. Tests inject a stub.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use nacme_core::NebulaPublicKey;
use tokio::process::Command;

/// Header every Nebula certificate PEM (v1 or v2) starts with.
pub const CERT_HEADER: &str = "-----BEGIN NEBULA CERTIFICATE";

/// Where the host key pair comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// The client generated the key pair and sent its public half.
    PublicKey(NebulaPublicKey),
    /// The signer generates the key pair and returns the private half.
    Generate,
}

/// Everything needed to sign one host certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub hostname: String,
    pub ip: IpAddr,
    pub prefix_len: u8,
    pub groups: Vec<String>,
    pub duration_hours: u64,
    pub key: KeyMaterial,
}

/// A signed certificate and, for generated key pairs, the private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCert {
    pub cert_pem: String,
    pub key_pem: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignerError {
    #[error("nebula-cert binary not found or not executable")]
    BinaryUnavailable,

    #[error("Permission denied accessing CA files or working directory")]
    PermissionDenied,

    #[error("CA certificate or key file is invalid or corrupted")]
    InvalidCaMaterial,

    #[error("Invalid IP address format: {0}")]
    InvalidIp(String),

    #[error("Invalid groups format: {0}")]
    InvalidGroups(String),

    /// Any other non-zero exit. `stderr` is kept for server-side logging only.
    #[error("Certificate generation failed")]
    Failed { status: Option<i32>, stderr: String },

    #[error("nebula-cert completed but output certificate file missing")]
    MissingOutput,

    #[error("nebula-cert created empty certificate file")]
    EmptyOutput,

    #[error("Generated certificate is not a valid Nebula certificate")]
    MalformedOutput,

    /// Local I/O failure. The cause is kept for server-side logging only.
    #[error("Certificate generation failed")]
    Io(#[source] io::Error),
}

/// Issues host certificates.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, request: SignRequest) -> Result<SignedCert, SignerError>;
}

/// Map a failed spawn to a signer error.
pub fn classify_spawn_error(err: io::Error) -> SignerError {
    match err.kind() {
        io::ErrorKind::NotFound => SignerError::BinaryUnavailable,
        io::ErrorKind::PermissionDenied => SignerError::PermissionDenied,
        _ => SignerError::Io(err),
    }
}

/// Map a non-zero exit to a signer error by inspecting stderr.
pub fn classify_failure(request: &SignRequest, status: Option<i32>, stderr: &str) -> SignerError {
    let lower = stderr.to_lowercase();

    if lower.contains("command not found") {
        SignerError::BinaryUnavailable
    } else if lower.contains("permission denied") || lower.contains("access denied") {
        SignerError::PermissionDenied
    } else if lower.contains("invalid") && lower.contains("certificate") {
        SignerError::InvalidCaMaterial
    } else if lower.contains("invalid") && lower.contains("ip") {
        SignerError::InvalidIp(request.ip.to_string())
    } else if lower.contains("invalid") && lower.contains("groups") {
        SignerError::InvalidGroups(request.groups.join(","))
    } else {
        SignerError::Failed {
            status,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Check signer output for a recognisable certificate.
pub fn check_certificate(pem: &str) -> Result<(), SignerError> {
    if pem.is_empty() {
        return Err(SignerError::EmptyOutput);
    }
    if !pem.contains(CERT_HEADER) {
        return Err(SignerError::MalformedOutput);
    }
    Ok(())
}

/// Signs with the `nebula-cert` command line tool.
#[derive(Debug, Clone)]
pub struct NebulaCertSigner {
    binary: PathBuf,
    ca_cert: PathBuf,
    ca_key: PathBuf,
}

impl NebulaCertSigner {
    pub fn new(
        binary: impl Into<PathBuf>,
        ca_cert: impl Into<PathBuf>,
        ca_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            ca_cert: ca_cert.into(),
            ca_key: ca_key.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run `nebula-cert --version` to confirm the binary is usable.
    ///
    /// Returns the trimmed version output.
    pub async fn probe(&self) -> Result<String, SignerError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(classify_spawn_error)?;

        if !output.status.success() {
            return Err(SignerError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            version = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        Ok(version)
    }

    async fn run(&self, request: &SignRequest, workdir: &Path) -> Result<Output, SignerError> {
        let out_crt = workdir.join("host.crt");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("sign")
            .arg("-ca-crt")
            .arg(&self.ca_cert)
            .arg("-ca-key")
            .arg(&self.ca_key);

        match &request.key {
            KeyMaterial::PublicKey(public_key) => {
                let in_pub = workdir.join("host.pub");
                tokio::fs::write(&in_pub, public_key.as_pem())
                    .await
                    .map_err(SignerError::Io)?;
                cmd.arg("-in-pub").arg(in_pub);
            }
            KeyMaterial::Generate => {
                cmd.arg("-out-key").arg(workdir.join("host.key"));
            }
        }

        cmd.arg("-name")
            .arg(&request.hostname)
            .arg("-ip")
            .arg(format!("{}/{}", request.ip, request.prefix_len))
            .arg("-groups")
            .arg(request.groups.join(","))
            .arg("-duration")
            .arg(format!("{}h", request.duration_hours))
            .arg("-out-crt")
            .arg(out_crt)
            .kill_on_drop(true);

        cmd.output().await.map_err(classify_spawn_error)
    }
}

#[async_trait]
impl Signer for NebulaCertSigner {
    async fn sign(&self, request: SignRequest) -> Result<SignedCert, SignerError> {
        let workdir = tempfile::tempdir().map_err(SignerError::Io)?;

        let output = self.run(&request, workdir.path()).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = classify_failure(&request, output.status.code(), &stderr);
            tracing::error!(
                hostname = %request.hostname,
                ip = %request.ip,
                status = ?output.status.code(),
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %stderr,
                error = %err,
                "nebula-cert sign failed"
            );
            return Err(err);
        }

        let cert_pem = match tokio::fs::read_to_string(workdir.path().join("host.crt")).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SignerError::MissingOutput)
            }
            Err(e) => return Err(SignerError::Io(e)),
        };
        check_certificate(&cert_pem)?;

        let key_pem = match request.key {
            KeyMaterial::Generate => Some(
                tokio::fs::read_to_string(workdir.path().join("host.key"))
                    .await
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::NotFound => SignerError::MissingOutput,
                        _ => SignerError::Io(e),
                    })?,
            ),
            KeyMaterial::PublicKey(_) => None,
        };

        Ok(SignedCert { cert_pem, key_pem })
    }
}
