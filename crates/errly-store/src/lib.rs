//! Errly store - embedded SQLite persistence.
//!
//! One [`Store`] value owns the connection pool and exposes the three
//! persisted domains:
//!
//! - **error groups** ([`groups`]): the deduplicated error records,
//!   including the transactional upsert the grouper relies on
//! - **sessions** ([`sessions`]): dashboard sessions, keyed by the SHA-256
//!   of the cookie token (the raw token is never persisted)
//! - **settings** ([`settings`]): string-keyed JSON values
//!
//! A single writer is assumed; the grouper's read-modify-write runs inside
//! a transaction so concurrent duplicate arrivals cannot violate the
//! unique fingerprint index.

pub mod error;
pub mod groups;
pub mod sessions;
pub mod settings;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub use error::{StoreError, StoreResult};
pub use groups::{GroupFilter, GroupPage, GroupStats, TimeRange};
pub use sessions::{hash_token, Session};

/// Sentinel written next to the database after the first successful init.
///
/// On platforms with ephemeral disks the sentinel vanishes together with
/// the data; its absence next to an otherwise empty data directory is the
/// signal we can observe.
const STORAGE_SENTINEL: &str = ".errly-storage";

/// Embedded SQLite store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and create if missing) the database at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let data_dir = path.parent().map(Path::to_path_buf);
        if let Some(ref dir) = data_dir {
            check_storage_sentinel(dir);
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Init(format!("cannot create data directory {}: {e}", dir.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        if let Some(ref dir) = data_dir {
            write_storage_sentinel(dir);
        }

        Ok(store)
    }

    /// Open an in-memory database, for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        // One connection only: every connection to ":memory:" is its own
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// The underlying pool, for the domain modules.
    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Whether the database answers a trivial query.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables and indexes if they do not exist.
    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS error_groups (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                deployment_id TEXT,
                message TEXT NOT NULL,
                stack_trace TEXT,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                endpoint TEXT,
                raw_log TEXT NOT NULL,
                source TEXT NOT NULL,
                metadata TEXT,
                fingerprint TEXT NOT NULL UNIQUE,
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                occurrences INTEGER NOT NULL DEFAULT 1,
                status_changed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_groups_service ON error_groups (service)",
            "CREATE INDEX IF NOT EXISTS idx_groups_severity ON error_groups (severity)",
            "CREATE INDEX IF NOT EXISTS idx_groups_last_seen ON error_groups (last_seen_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_groups_created ON error_groups (created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_groups_status ON error_groups (status)",
            "CREATE INDEX IF NOT EXISTS idx_groups_service_last_seen \
             ON error_groups (service, last_seen_at DESC)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Warn when the data directory looks freshly wiped.
///
/// Indistinguishable from a genuine first boot, so the wording covers both;
/// if the warning recurs across restarts the volume is ephemeral.
fn check_storage_sentinel(dir: &Path) {
    let sentinel = dir.join(STORAGE_SENTINEL);
    if sentinel.exists() {
        return;
    }

    let dir_is_empty = match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    };
    if dir_is_empty {
        tracing::warn!(
            data_dir = %dir.display(),
            "data directory is empty: this is either the first boot or the volume was wiped. \
             If this warning recurs on every restart, storage is ephemeral and error history \
             will not survive deploys"
        );
    }
}

fn write_storage_sentinel(dir: &Path) {
    let sentinel = dir.join(STORAGE_SENTINEL);
    if let Err(e) = std::fs::write(&sentinel, b"errly\n") {
        tracing::debug!(error = %e, "could not write storage sentinel");
    }
}
