//! SQLite persistence for rosterdb: migrations, provenance, rule versions and domain upserts.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::info;

pub mod checks;
pub mod domain;
pub mod migrations;
pub mod provenance;
pub mod versions;

pub use checks::{integrity_check, naming_check, CheckIssue, CheckReport, CheckStatus};
pub use migrations::{ChecksumMismatch, Migration, MigrationManager, PendingMigration, MIGRATIONS};
pub use provenance::{
    EvictionPolicy, EvictionReport, ProvenanceDiff, ProvenanceEntry, ProvenanceRecord,
    ProvenanceStore,
};
pub use versions::{save_version_in, RuleSetVersion, RuleVersionStore, SavedVersion};

pub const CRATE_NAME: &str = "roster-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("migration {id} ({description}) failed: {source}")]
    Migration {
        id: i64,
        description: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration ids must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguous { expected: i64, found: i64 },
    #[error("invalid stored timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid eviction policy: {0}")]
    InvalidPolicy(String),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Handle on the relational store. The pool holds a single connection: the store is one
/// logical writer and transactions are the unit of isolation.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        Self::with_options(options).await
    }

    /// Opens (creating if needed) a database file, including its parent directory.
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        Self::with_options(options).await
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Opens the store and brings the schema up to date.
    pub async fn open_migrated(url: &str) -> Result<Self> {
        let store = Self::connect(url).await?;
        let applied = MigrationManager::registered().apply_pending(&store).await?;
        info!(applied, "store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub fn provenance(&self) -> ProvenanceStore {
        ProvenanceStore::new(self.pool.clone())
    }

    pub fn rule_versions(&self) -> RuleVersionStore {
        RuleVersionStore::new(self.pool.clone())
    }

    pub async fn table_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

/// RFC 3339 UTC with fixed microsecond precision, so text order equals time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}
