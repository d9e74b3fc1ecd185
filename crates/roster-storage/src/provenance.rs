//! Content-hash provenance: change detection for incremental ingest plus age/LRU eviction.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::FromRow;
use tracing::{debug, info};

use crate::{format_timestamp, parse_timestamp, Result, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvenanceRecord {
    pub source_file: String,
    pub hash: String,
    pub parser_version: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub rule_version: Option<i64>,
}

#[derive(Debug, FromRow)]
struct ProvenanceRow {
    source_file: String,
    hash: String,
    parser_version: Option<String>,
    ingested_at: String,
    last_accessed_at: String,
    access_count: i64,
    rule_version: Option<i64>,
}

impl TryFrom<ProvenanceRow> for ProvenanceRecord {
    type Error = crate::StoreError;

    fn try_from(row: ProvenanceRow) -> Result<Self> {
        Ok(Self {
            ingested_at: parse_timestamp(&row.ingested_at)?,
            last_accessed_at: parse_timestamp(&row.last_accessed_at)?,
            source_file: row.source_file,
            hash: row.hash,
            parser_version: row.parser_version,
            access_count: row.access_count,
            rule_version: row.rule_version,
        })
    }
}

const SELECT_RECORD: &str = "SELECT source_file, hash, parser_version, ingested_at, last_accessed_at, access_count, rule_version FROM ingest_provenance";

/// What a successful ingest of one source looked like.
#[derive(Debug, Clone, Copy)]
pub struct ProvenanceEntry<'a> {
    pub source_file: &'a str,
    pub hash: &'a str,
    pub parser_version: Option<&'a str>,
    pub rule_version: Option<i64>,
}

/// Four disjoint, sorted path sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvenanceDiff {
    pub unchanged: Vec<String>,
    pub updated: Vec<String>,
    pub new: Vec<String>,
    pub missing: Vec<String>,
}

impl ProvenanceDiff {
    pub fn needs_ingest(&self) -> impl Iterator<Item = &String> {
        self.new.iter().chain(self.updated.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvictionPolicy {
    pub max_age_days: Option<i64>,
    pub max_entries: Option<usize>,
    /// Records accessed at or after this instant are never evicted (the current ingest pass).
    pub protected_since: Option<DateTime<Utc>>,
}

impl EvictionPolicy {
    pub fn is_noop(&self) -> bool {
        self.max_age_days.is_none() && self.max_entries.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub inspected: usize,
    pub removed: usize,
    pub by_age: usize,
    pub by_lru: usize,
}

/// Inserts a first-seen source with `access_count = 1`, or refreshes hash and access
/// fields of a known one. Runs on the caller's connection so it can share a transaction
/// with the data write it describes.
pub async fn record_or_update_at(
    conn: &mut SqliteConnection,
    entry: ProvenanceEntry<'_>,
    at: DateTime<Utc>,
) -> Result<()> {
    let stamp = format_timestamp(at);
    sqlx::query(
        "INSERT INTO ingest_provenance
            (source_file, parser_version, ingested_at, hash, last_accessed_at, access_count, rule_version)
         VALUES (?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(source_file) DO UPDATE SET
            hash = excluded.hash,
            parser_version = excluded.parser_version,
            ingested_at = excluded.ingested_at,
            last_accessed_at = excluded.last_accessed_at,
            access_count = ingest_provenance.access_count + 1,
            rule_version = excluded.rule_version",
    )
    .bind(entry.source_file)
    .bind(entry.parser_version)
    .bind(&stamp)
    .bind(entry.hash)
    .bind(&stamp)
    .bind(entry.rule_version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Bumps access fields of an already-recorded source. Returns false for unknown paths.
pub async fn touch_at(conn: &mut SqliteConnection, source_file: &str, at: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE ingest_provenance SET last_accessed_at = ?, access_count = access_count + 1 WHERE source_file = ?",
    )
    .bind(format_timestamp(at))
    .bind(source_file)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn age_cutoff(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    if days < 0 {
        return Err(StoreError::InvalidPolicy(format!("max_age_days must not be negative, got {days}")));
    }
    Duration::try_days(days)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| StoreError::InvalidPolicy(format!("max_age_days {days} is out of range")))
}

#[derive(Debug, Clone)]
pub struct ProvenanceStore {
    pool: SqlitePool,
}

impl ProvenanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record_or_update(&self, entry: ProvenanceEntry<'_>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        record_or_update_at(&mut conn, entry, Utc::now()).await
    }

    pub async fn touch(&self, source_file: &str) -> Result<bool> {
        self.touch_at(source_file, Utc::now()).await
    }

    pub async fn touch_at(&self, source_file: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        touch_at(&mut conn, source_file, at).await
    }

    pub async fn get(&self, source_file: &str) -> Result<Option<ProvenanceRecord>> {
        let row: Option<ProvenanceRow> =
            sqlx::query_as(&format!("{SELECT_RECORD} WHERE source_file = ?"))
                .bind(source_file)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ProvenanceRecord::try_from).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ProvenanceRecord>> {
        let rows: Vec<ProvenanceRow> = sqlx::query_as(&format!("{SELECT_RECORD} ORDER BY source_file"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ProvenanceRecord::try_from).collect()
    }

    /// Compares `current` (path -> content hash) with the latest recorded hashes.
    pub async fn diff_against_current(
        &self,
        current: &BTreeMap<String, String>,
    ) -> Result<ProvenanceDiff> {
        let recorded: BTreeMap<String, String> =
            sqlx::query_as::<_, (String, String)>("SELECT source_file, hash FROM ingest_provenance")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();

        let mut diff = ProvenanceDiff::default();
        for (path, hash) in current {
            match recorded.get(path) {
                Some(previous) if previous == hash => diff.unchanged.push(path.clone()),
                Some(_) => diff.updated.push(path.clone()),
                None => diff.new.push(path.clone()),
            }
        }
        let current_paths: BTreeSet<&String> = current.keys().collect();
        diff.missing = recorded
            .into_keys()
            .filter(|path| !current_paths.contains(path))
            .collect();
        debug!(
            unchanged = diff.unchanged.len(),
            updated = diff.updated.len(),
            new = diff.new.len(),
            missing = diff.missing.len(),
            "provenance diff"
        );
        Ok(diff)
    }

    pub async fn evict(&self, policy: &EvictionPolicy) -> Result<EvictionReport> {
        self.evict_at(policy, Utc::now()).await
    }

    /// Age pass first, then least-recently-accessed (ties: lowest access count) until at or
    /// below `max_entries`. Protected records count toward the cap but are never removed.
    pub async fn evict_at(&self, policy: &EvictionPolicy, now: DateTime<Utc>) -> Result<EvictionReport> {
        let cutoff = policy.max_age_days.map(|days| age_cutoff(now, days)).transpose()?;
        let protected = policy.protected_since.map(format_timestamp);
        let mut tx = self.pool.begin().await?;

        let inspected: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_provenance")
            .fetch_one(&mut *tx)
            .await?;
        let mut report = EvictionReport {
            inspected: inspected as usize,
            ..EvictionReport::default()
        };

        if let Some(cutoff) = cutoff {
            let cutoff = format_timestamp(cutoff);
            let removed = sqlx::query(
                "DELETE FROM ingest_provenance
                 WHERE last_accessed_at < ? AND (? IS NULL OR last_accessed_at < ?)",
            )
            .bind(&cutoff)
            .bind(protected.as_deref())
            .bind(protected.as_deref())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            report.by_age = removed as usize;
        }

        if let Some(cap) = policy.max_entries {
            let remaining = report.inspected - report.by_age;
            if remaining > cap {
                let removed = sqlx::query(
                    "DELETE FROM ingest_provenance WHERE provenance_id IN (
                        SELECT provenance_id FROM ingest_provenance
                        WHERE (? IS NULL OR last_accessed_at < ?)
                        ORDER BY last_accessed_at ASC, access_count ASC, provenance_id ASC
                        LIMIT ?
                    )",
                )
                .bind(protected.as_deref())
                .bind(protected.as_deref())
                .bind((remaining - cap) as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                report.by_lru = removed as usize;
            }
        }

        tx.commit().await?;
        report.removed = report.by_age + report.by_lru;
        if report.removed > 0 {
            info!(
                removed = report.removed,
                by_age = report.by_age,
                by_lru = report.by_lru,
                "evicted provenance records"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MigrationManager, Store};
    use chrono::TimeZone;

    async fn migrated() -> Store {
        let store = Store::in_memory().await.expect("store");
        MigrationManager::registered()
            .apply_pending(&store)
            .await
            .expect("migrate");
        store
    }

    fn entry<'a>(path: &'a str, hash: &'a str) -> ProvenanceEntry<'a> {
        ProvenanceEntry {
            source_file: path,
            hash,
            parser_version: Some("test-1"),
            rule_version: None,
        }
    }

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, n, 12, 0, 0).single().expect("ts")
    }

    async fn record_at(store: &Store, path: &str, hash: &str, at: DateTime<Utc>) {
        let mut conn = store.pool().acquire().await.expect("conn");
        record_or_update_at(&mut conn, entry(path, hash), at)
            .await
            .expect("record");
    }

    #[tokio::test]
    async fn repeat_ingest_updates_hash_and_counts_access() {
        let store = migrated().await;
        let provenance = store.provenance();
        provenance.record_or_update(entry("a.html", "h1")).await.expect("first");
        provenance.record_or_update(entry("a.html", "h2")).await.expect("second");

        let record = provenance.get("a.html").await.expect("get").expect("record");
        assert_eq!(record.hash, "h2");
        assert_eq!(record.access_count, 2);
        assert_eq!(record.parser_version.as_deref(), Some("test-1"));
        assert_eq!(provenance.list().await.expect("list").len(), 1);

        assert!(provenance.touch("a.html").await.expect("touch"));
        assert!(!provenance.touch("unknown.html").await.expect("touch"));
        let record = provenance.get("a.html").await.expect("get").expect("record");
        assert_eq!(record.access_count, 3);
    }

    #[tokio::test]
    async fn diff_splits_into_four_disjoint_sets() {
        let store = migrated().await;
        let provenance = store.provenance();
        for (path, hash) in [("a", "h1"), ("b", "h2old"), ("old", "h3")] {
            provenance.record_or_update(entry(path, hash)).await.expect("record");
        }
        let current: BTreeMap<String, String> = [("a", "h1"), ("b", "h2new"), ("c", "h4")]
            .into_iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect();

        let diff = provenance.diff_against_current(&current).await.expect("diff");
        assert_eq!(diff.unchanged, vec!["a"]);
        assert_eq!(diff.updated, vec!["b"]);
        assert_eq!(diff.new, vec!["c"]);
        assert_eq!(diff.missing, vec!["old"]);
        assert_eq!(diff.needs_ingest().count(), 2);
    }

    #[tokio::test]
    async fn eviction_by_age_then_lru() {
        let store = migrated().await;
        let provenance = store.provenance();
        record_at(&store, "ancient.html", "h0", day(1)).await;
        record_at(&store, "old.html", "h1", day(10)).await;
        record_at(&store, "busy.html", "h2", day(10)).await;
        provenance.touch_at("busy.html", day(10)).await.expect("touch");
        record_at(&store, "fresh.html", "h3", day(20)).await;

        let report = provenance
            .evict_at(
                &EvictionPolicy {
                    max_age_days: Some(15),
                    max_entries: Some(2),
                    protected_since: None,
                },
                day(21),
            )
            .await
            .expect("evict");

        assert_eq!(report.inspected, 4);
        assert_eq!(report.by_age, 1);
        assert_eq!(report.by_lru, 1);
        let left: Vec<String> = provenance
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|r| r.source_file)
            .collect();
        assert_eq!(left, vec!["busy.html", "fresh.html"]);
    }

    #[tokio::test]
    async fn eviction_spares_records_touched_in_current_pass() {
        let store = migrated().await;
        let provenance = store.provenance();
        record_at(&store, "a.html", "h1", day(1)).await;
        record_at(&store, "b.html", "h2", day(2)).await;
        record_at(&store, "c.html", "h3", day(5)).await;

        let report = provenance
            .evict_at(
                &EvictionPolicy {
                    max_age_days: Some(1),
                    max_entries: Some(0),
                    protected_since: Some(day(2)),
                },
                day(6),
            )
            .await
            .expect("evict");

        assert_eq!(report.removed, 1);
        assert!(provenance.get("a.html").await.expect("get").is_none());
        assert!(provenance.get("b.html").await.expect("get").is_some());
        assert!(provenance.get("c.html").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn out_of_range_age_is_an_error_and_removes_nothing() {
        let store = migrated().await;
        let provenance = store.provenance();
        record_at(&store, "a.html", "h1", day(1)).await;

        for days in [1_000_000_000_000, -3] {
            let err = provenance
                .evict_at(
                    &EvictionPolicy {
                        max_age_days: Some(days),
                        max_entries: None,
                        protected_since: None,
                    },
                    day(6),
                )
                .await
                .expect_err("rejected");
            assert!(matches!(err, StoreError::InvalidPolicy(_)));
        }
        assert_eq!(provenance.list().await.expect("list").len(), 1);
    }
}
