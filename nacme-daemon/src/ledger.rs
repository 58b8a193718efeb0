//! Persistent storage for API keys, hosts and runtime config.
//!
//! SQLite in WAL mode is the only serialization point between concurrent
//! onboarding requests. Uniqueness of `hosts.hostname` and `hosts.ip` is
//! enforced by the schema; callers learn about collisions from the tagged
//! [`CommitOutcome`] instead of checking first.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nacme_core::{ApiKeyRecord, HostRecord, NewHost};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::allocator::Occupancy;

/// How long a connection waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS configs (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key_hash TEXT NOT NULL UNIQUE,
        expiration INTEGER,
        uses_remaining INTEGER,
        groups_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL UNIQUE,
        ip TEXT NOT NULL UNIQUE,
        groups_json TEXT NOT NULL,
        expiry INTEGER NOT NULL,
        api_key_id INTEGER NOT NULL,
        current_cert TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_hosts_expiry ON hosts(expiry)",
    "CREATE INDEX IF NOT EXISTS idx_hosts_hostname ON hosts(hostname)",
    "CREATE INDEX IF NOT EXISTS idx_hosts_ip ON hosts(ip)",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_key_hash ON api_keys(key_hash)",
];

/// Which unique column a host insert collided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictField {
    Ip,
    Hostname,
}

impl std::fmt::Display for ConflictField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::Hostname => f.write_str("hostname"),
        }
    }
}

/// Result of trying to commit a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Host row inserted and (if metered) one key use consumed.
    Committed(HostRecord),
    /// Another request already holds this IP or hostname. Nothing was written.
    Conflict(ConflictField),
    /// The key's last use was consumed concurrently. Nothing was written.
    KeyExhausted,
}

/// Errors that can occur during ledger operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to create database directory: {0}")]
    Directory(#[source] std::io::Error),
    #[error("invalid {column} value in row {id}: {reason}")]
    Decode {
        column: &'static str,
        id: i64,
        reason: String,
    },
}

/// Transactional store over `configs`, `api_keys` and `hosts`.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open or create a ledger database at the given path.
    ///
    /// Uses WAL journaling and a [`BUSY_TIMEOUT`] lock wait so that
    /// overlapping readers and writers queue instead of failing.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, LedgerError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(LedgerError::Directory)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating tables and indexes if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    #[cfg(test)]
    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Config
    // =========================================================================

    /// Insert a config value unless the key already exists.
    ///
    /// Returns `true` if the value was written.
    pub async fn seed_config(&self, key: &str, value: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query("INSERT OR IGNORE INTO configs (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load every persisted config pair.
    pub async fn load_config(&self) -> Result<BTreeMap<String, String>, LedgerError> {
        let rows = sqlx::query("SELECT key, value FROM configs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    // =========================================================================
    // API keys
    // =========================================================================

    /// Store a new API key digest. Returns the new row id.
    pub async fn insert_api_key(
        &self,
        key_hash: &str,
        expiration: Option<i64>,
        uses_remaining: Option<i64>,
        groups: &[String],
    ) -> Result<i64, LedgerError> {
        let now = current_timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO api_keys (key_hash, expiration, uses_remaining, groups_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key_hash)
        .bind(expiration)
        .bind(uses_remaining)
        .bind(encode_groups(groups))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Look up a key by digest.
    pub async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, key_hash, expiration, uses_remaining, groups_json, created_at, updated_at
            FROM api_keys WHERE key_hash = ?
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_api_key_row).transpose()
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Insert a host and, for metered keys, consume one use, atomically.
    ///
    /// Unique violations on `ip` or `hostname` come back as
    /// [`CommitOutcome::Conflict`]. Any other constraint failure is an error.
    /// The use decrement only applies while `uses_remaining > 0`, so a key can
    /// never be driven below zero by concurrent commits.
    pub async fn commit_host(
        &self,
        host: &NewHost,
        metered: bool,
    ) -> Result<CommitOutcome, LedgerError> {
        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO hosts (hostname, ip, groups_json, expiry, api_key_id,
                               current_cert, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&host.hostname)
        .bind(&host.ip)
        .bind(encode_groups(&host.groups))
        .bind(host.expiry)
        .bind(host.api_key_id)
        .bind(&host.cert)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let host_id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                match conflict_field(db_err.message()) {
                    Some(field) => {
                        tx.rollback().await?;
                        return Ok(CommitOutcome::Conflict(field));
                    }
                    None => return Err(sqlx::Error::Database(db_err).into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        if metered {
            let consumed = sqlx::query(
                "UPDATE api_keys
                 SET uses_remaining = uses_remaining - 1, updated_at = ?
                 WHERE id = ? AND uses_remaining IS NOT NULL AND uses_remaining > 0",
            )
            .bind(now)
            .bind(host.api_key_id)
            .execute(&mut *tx)
            .await?;

            if consumed.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(CommitOutcome::KeyExhausted);
            }
        }

        tx.commit().await?;

        Ok(CommitOutcome::Committed(HostRecord {
            id: host_id,
            hostname: host.hostname.clone(),
            ip: host.ip.clone(),
            groups: host.groups.clone(),
            expiry: host.expiry,
            api_key_id: host.api_key_id,
            current_cert: host.cert.clone(),
            created_at: now,
            updated_at: now,
        }))
    }

    /// List all hosts ordered by id.
    pub async fn list_hosts(&self) -> Result<Vec<HostRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, hostname, ip, groups_json, expiry, api_key_id,
                   current_cert, created_at, updated_at
            FROM hosts ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_host_row).collect()
    }
}

#[async_trait]
impl Occupancy for Ledger {
    async fn occupied_ips(&self) -> Result<HashSet<IpAddr>, LedgerError> {
        let rows = sqlx::query("SELECT ip FROM hosts")
            .fetch_all(&self.pool)
            .await?;

        // Rows are written from parsed addresses; anything unparsable cannot
        // collide with a candidate and is skipped.
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<String, _>("ip").parse().ok())
            .collect())
    }

    async fn ip_in_use(&self, ip: IpAddr) -> Result<bool, LedgerError> {
        let row = sqlx::query("SELECT 1 FROM hosts WHERE ip = ?")
            .bind(ip.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn hostname_in_use(&self, hostname: &str) -> Result<bool, LedgerError> {
        let row = sqlx::query("SELECT 1 FROM hosts WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

/// Map a SQLite unique-violation message to the colliding host column.
///
/// SQLite reports e.g. `UNIQUE constraint failed: hosts.ip`.
fn conflict_field(message: &str) -> Option<ConflictField> {
    if message.contains("hosts.hostname") {
        Some(ConflictField::Hostname)
    } else if message.contains("hosts.ip") {
        Some(ConflictField::Ip)
    } else {
        None
    }
}

fn encode_groups(groups: &[String]) -> String {
    serde_json::Value::from(groups.to_vec()).to_string()
}

fn decode_groups(json: &str, id: i64) -> Result<Vec<String>, LedgerError> {
    serde_json::from_str(json).map_err(|e| LedgerError::Decode {
        column: "groups_json",
        id,
        reason: e.to_string(),
    })
}

fn parse_api_key_row(row: &SqliteRow) -> Result<ApiKeyRecord, LedgerError> {
    let id: i64 = row.try_get("id")?;
    let groups_json: String = row.try_get("groups_json")?;

    Ok(ApiKeyRecord {
        id,
        key_hash: row.try_get("key_hash")?,
        expiration: row.try_get("expiration")?,
        uses_remaining: row.try_get("uses_remaining")?,
        groups: decode_groups(&groups_json, id)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_host_row(row: &SqliteRow) -> Result<HostRecord, LedgerError> {
    let id: i64 = row.try_get("id")?;
    let groups_json: String = row.try_get("groups_json")?;

    Ok(HostRecord {
        id,
        hostname: row.try_get("hostname")?,
        ip: row.try_get("ip")?,
        groups: decode_groups(&groups_json, id)?,
        expiry: row.try_get("expiry")?,
        api_key_id: row.try_get("api_key_id")?,
        current_cert: row.try_get("current_cert")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Current Unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
