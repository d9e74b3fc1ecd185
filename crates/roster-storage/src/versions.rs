//! Content-addressed rule set revisions.

use chrono::{DateTime, Utc};
use roster_core::content_hash;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::FromRow;
use tracing::{debug, info};

use crate::{format_timestamp, parse_timestamp, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSetVersion {
    pub version_num: i64,
    pub content_hash: String,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct VersionRow {
    version_num: i64,
    content_hash: String,
    payload_json: String,
    created_at: String,
}

impl TryFrom<VersionRow> for RuleSetVersion {
    type Error = crate::StoreError;

    fn try_from(row: VersionRow) -> Result<Self> {
        Ok(Self {
            created_at: parse_timestamp(&row.created_at)?,
            version_num: row.version_num,
            content_hash: row.content_hash,
            payload_json: row.payload_json,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedVersion {
    pub version_num: i64,
    pub content_hash: String,
    pub deduplicated: bool,
}

/// [`RuleVersionStore::save_version`] on the caller's connection, so the version can
/// commit together with whatever records it.
pub async fn save_version_in(conn: &mut SqliteConnection, serialized: &str) -> Result<SavedVersion> {
    let content_hash = content_hash(serialized.as_bytes());
    let existing: Option<i64> = sqlx::query_scalar("SELECT version_num FROM rule_set_version WHERE content_hash = ?")
        .bind(&content_hash)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(version_num) = existing {
        debug!(version_num, "rule set unchanged; reusing version");
        return Ok(SavedVersion {
            version_num,
            content_hash,
            deduplicated: true,
        });
    }

    let version_num: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version_num), 0) + 1 FROM rule_set_version")
        .fetch_one(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO rule_set_version (version_num, content_hash, payload_json, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(version_num)
    .bind(&content_hash)
    .bind(serialized)
    .bind(format_timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;

    info!(version_num, "saved rule set version");
    Ok(SavedVersion {
        version_num,
        content_hash,
        deduplicated: false,
    })
}

#[derive(Debug, Clone)]
pub struct RuleVersionStore {
    pool: SqlitePool,
}

impl RuleVersionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores `serialized` under the next version number unless an identical payload
    /// (by content hash) already exists anywhere in history, in which case its number is reused.
    pub async fn save_version(&self, serialized: &str) -> Result<SavedVersion> {
        let mut tx = self.pool.begin().await?;
        let saved = save_version_in(&mut *tx, serialized).await?;
        tx.commit().await?;
        Ok(saved)
    }

    /// Newest first.
    pub async fn list_versions(&self) -> Result<Vec<RuleSetVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(
            "SELECT version_num, content_hash, payload_json, created_at FROM rule_set_version ORDER BY version_num DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RuleSetVersion::try_from).collect()
    }

    pub async fn latest(&self) -> Result<Option<RuleSetVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(
            "SELECT version_num, content_hash, payload_json, created_at FROM rule_set_version ORDER BY version_num DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(RuleSetVersion::try_from).transpose()
    }

    pub async fn get(&self, version_num: i64) -> Result<Option<RuleSetVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(
            "SELECT version_num, content_hash, payload_json, created_at FROM rule_set_version WHERE version_num = ?",
        )
        .bind(version_num)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RuleSetVersion::try_from).transpose()
    }

    /// Payload of the version just before the latest. History is left untouched; re-saving
    /// the returned payload reuses its original version number.
    pub async fn rollback_to_previous(&self) -> Result<Option<String>> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload_json FROM rule_set_version
             WHERE version_num < (SELECT MAX(version_num) FROM rule_set_version)
             ORDER BY version_num DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload)
    }
}
