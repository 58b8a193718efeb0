//! NACME Daemon - Nebula onboarding server
//!
//! Serves the public onboarding API and the admin API on two ports, and
//! offers offline key management against the same database.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nacme_daemon::config::{read_ca_certificate, RuntimeConfig, ServerConfig};
use nacme_daemon::ledger::{current_timestamp, Ledger};
use nacme_daemon::services::{admin, onboarding, OnboardingRateLimiter};
use nacme_daemon::startup::validate_startup;
use nacme_daemon::{issue_api_key, NebulaCertSigner, OnboardingCoordinator, Signer};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Definition
// ============================================================================

/// NACME Daemon - Nebula certificate onboarding
#[derive(Parser)]
#[command(name = "nacme-daemon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the onboarding and admin servers
    Serve(ServerConfig),

    /// API key management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Create an API key directly in the database
    Create {
        /// Group granted to hosts onboarded with this key (repeatable)
        #[arg(long = "group", required = true)]
        groups: Vec<String>,

        /// Number of hosts this key may onboard (unlimited if omitted)
        #[arg(long)]
        uses: Option<i64>,

        /// Key lifetime (e.g., "90m", "12h", "30d"); never expires if omitted
        #[arg(long)]
        expires_in: Option<String>,

        #[arg(long, env = "NACME_DB_PATH", default_value = "nacme.db")]
        db_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(config) => cmd_serve(config).await,
        Commands::Key { action } => cmd_key(action).await,
    }
}

/// Handle key subcommands.
async fn cmd_key(action: KeyAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        KeyAction::Create {
            groups,
            uses,
            expires_in,
            db_path,
        } => {
            let expiration = match expires_in.as_deref() {
                Some(s) => Some(current_timestamp() + parse_duration(s)?),
                None => None,
            };

            let ledger = Ledger::open(&db_path, 1).await?;
            let issued = issue_api_key(&ledger, &groups, expiration, uses).await?;

            let expires_at = expiration
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());

            println!("API Key Created");
            println!("===============");
            println!();
            println!("Key:     {}", issued.secret.expose());
            println!();
            println!("Groups:  {}", issued.groups.join(", "));
            println!("Expires: {}", expires_at);
            match uses {
                Some(n) => println!("Uses:    {}", n),
                None => println!("Uses:    unlimited"),
            }
            println!();
            println!("This key is shown only once. Store it securely.");

            Ok(())
        }
    }
}

/// Parse a duration string like "90m", "12h" or "30d" into seconds.
fn parse_duration(s: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let s = s.trim();

    let (num_str, unit) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 3600),
        Some((i, 'd')) => (&s[..i], 86_400),
        // Assume seconds if no unit
        Some(_) => (s, 1),
        None => return Err("Empty duration".into()),
    };

    let num: i64 = num_str
        .parse()
        .map_err(|_| format!("Invalid duration: {}", s))?;
    if num <= 0 {
        return Err(format!("Duration must be positive: {}", s).into());
    }

    Ok(num.saturating_mul(unit))
}

/// Start the daemon servers.
async fn cmd_serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let signer = NebulaCertSigner::new(&config.nebula_cert, &config.ca_cert, &config.ca_key);
    validate_startup(&config, &signer).await?;

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let ledger = Ledger::open(&config.db_path, config.db_max_connections.max(1)).await?;

    let ca_cert_pem = read_ca_certificate(&config.ca_cert).await?;
    let runtime = RuntimeConfig::load(
        &ledger,
        &config.seed(),
        ca_cert_pem,
        config.allow_server_keygen,
    )
    .await?;

    if runtime.pool.to_string() != config.subnet_cidr.trim() {
        tracing::warn!(
            configured = %config.subnet_cidr,
            persisted = %runtime.pool,
            "Using subnet persisted in database"
        );
    }

    tracing::info!(
        subnet = %runtime.pool,
        expiry_days = runtime.default_expiry_days,
        suffix_length = runtime.random_suffix_length,
        server_keygen = runtime.allow_server_keygen,
        "Runtime config loaded"
    );

    let signer: Arc<dyn Signer> = Arc::new(signer);
    let coordinator = OnboardingCoordinator::new(ledger.clone(), signer, Arc::new(runtime));
    let limiter =
        OnboardingRateLimiter::new(config.rate_limit_per_second, config.rate_limit_burst);

    let public_app = onboarding::router(coordinator, limiter);
    let admin_app = admin::router(ledger, config.master_key.clone());

    let public_addr = SocketAddr::new(config.bind_addr, config.public_port);
    let admin_addr = SocketAddr::new(config.bind_addr, config.admin_port);

    tracing::info!(
        public = %public_addr,
        admin = %admin_addr,
        "NACME daemon starting"
    );

    let shutdown_result =
        run_dual_port_servers(public_app, admin_app, public_addr, admin_addr).await;

    match shutdown_result {
        Ok(()) => {
            tracing::info!("Daemon shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Daemon shutdown with error");
            Err(e)
        }
    }
}

/// Run the public and admin servers until SIGINT or SIGTERM.
async fn run_dual_port_servers(
    public_app: axum::Router,
    admin_app: axum::Router,
    public_addr: SocketAddr,
    admin_addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let public_listener = TcpListener::bind(public_addr).await?;
    let admin_listener = TcpListener::bind(admin_addr).await?;
    tracing::info!("Public listener bound to {}", public_addr);
    tracing::info!("Admin listener bound to {}", admin_addr);

    // Broadcast channel for shutdown (multiple receivers)
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut shutdown_rx_public = shutdown_tx.subscribe();
    let mut shutdown_rx_admin = shutdown_tx.subscribe();

    let signal_task = tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let public_handle = tokio::spawn(async move {
        axum::serve(public_listener, public_app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx_public.recv().await;
            })
            .await
    });

    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx_admin.recv().await;
            })
            .await
    });

    let (public_result, admin_result) = tokio::join!(public_handle, admin_handle);
    signal_task.abort();

    for (name, result) in [("public", public_result), ("admin", admin_result)] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(server = name, error = %e, "Server error"),
            Err(e) => tracing::error!(server = name, error = %e, "Server task panicked"),
        }
    }

    tracing::info!("Dual-port servers stopped, shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
