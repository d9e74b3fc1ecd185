//! Ordered schema migrations with per-unit checksums.

use std::collections::BTreeMap;

use chrono::Utc;
use roster_core::content_hash;
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::{format_timestamp, Result, Store, StoreError};

/// One schema-change unit. Ids start at 1 and are contiguous; each unit runs at most once per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub id: i64,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

impl Migration {
    pub fn checksum(&self) -> String {
        let mut body = String::from(self.description);
        for statement in self.statements {
            body.push('\n');
            body.push_str(statement);
        }
        content_hash(body.as_bytes())
    }
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "league schema",
        statements: &[
            "CREATE TABLE division (
                division_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                season INTEGER NOT NULL DEFAULT 0,
                UNIQUE(name, season)
            )",
            "CREATE TABLE club (
                club_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            )",
            "CREATE TABLE team (
                team_id INTEGER PRIMARY KEY,
                division_id INTEGER NOT NULL REFERENCES division(division_id) ON DELETE CASCADE,
                club_id INTEGER REFERENCES club(club_id),
                name TEXT NOT NULL,
                team_number INTEGER NOT NULL DEFAULT 1,
                roster_link TEXT,
                UNIQUE(division_id, name)
            )",
            "CREATE TABLE player (
                player_id INTEGER PRIMARY KEY,
                team_id INTEGER NOT NULL REFERENCES team(team_id) ON DELETE CASCADE,
                full_name TEXT NOT NULL,
                live_pz INTEGER,
                UNIQUE(team_id, full_name)
            )",
            "CREATE TABLE match_record (
                match_id INTEGER PRIMARY KEY AUTOINCREMENT,
                division_id INTEGER NOT NULL REFERENCES division(division_id) ON DELETE CASCADE,
                match_number TEXT,
                match_date TEXT NOT NULL DEFAULT '',
                match_time TEXT,
                home_team TEXT NOT NULL,
                guest_team TEXT NOT NULL,
                home_score INTEGER,
                guest_score INTEGER,
                status TEXT NOT NULL,
                UNIQUE(division_id, home_team, guest_team, match_date)
            )",
            "CREATE INDEX idx_player_team ON player(team_id)",
            "CREATE INDEX idx_match_division_date ON match_record(division_id, match_date)",
        ],
    },
    Migration {
        id: 2,
        description: "ingest provenance",
        statements: &[
            "CREATE TABLE ingest_provenance (
                provenance_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_file TEXT NOT NULL UNIQUE,
                parser_version TEXT,
                ingested_at TEXT NOT NULL,
                hash TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 1,
                UNIQUE(source_file, hash)
            )",
            "CREATE INDEX idx_provenance_access ON ingest_provenance(last_accessed_at, access_count)",
        ],
    },
    Migration {
        id: 3,
        description: "rule set versions and extracted rows",
        statements: &[
            "CREATE TABLE rule_set_version (
                version_num INTEGER PRIMARY KEY,
                content_hash TEXT NOT NULL UNIQUE,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "ALTER TABLE ingest_provenance ADD COLUMN rule_version INTEGER",
            "CREATE TABLE rule_extracted_row (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_file TEXT NOT NULL,
                resource TEXT NOT NULL,
                row_index INTEGER NOT NULL,
                rule_version INTEGER REFERENCES rule_set_version(version_num),
                payload_json TEXT NOT NULL,
                UNIQUE(source_file, resource, row_index)
            )",
        ],
    },
    Migration {
        id: 4,
        description: "rankings, stable ids, error log and apply audit",
        statements: &[
            "CREATE TABLE division_ranking (
                division_id INTEGER NOT NULL REFERENCES division(division_id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                team_name TEXT NOT NULL,
                points INTEGER,
                PRIMARY KEY(division_id, position)
            )",
            "CREATE TABLE id_map (
                assigned_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                source_key TEXT NOT NULL,
                UNIQUE(entity_type, source_key)
            )",
            "CREATE TABLE ingest_error (
                error_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_file TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
            "CREATE TABLE rule_apply_audit (
                audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_version INTEGER REFERENCES rule_set_version(version_num),
                applied_at TEXT NOT NULL,
                rows_json TEXT NOT NULL,
                gates_passed INTEGER NOT NULL
            )",
        ],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub id: i64,
    pub description: String,
    pub statements: Vec<String>,
}

/// A unit whose recorded checksum no longer matches its registered definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub id: i64,
    pub recorded: String,
    pub current: String,
}

#[derive(Debug, Clone)]
pub struct MigrationManager {
    units: Vec<Migration>,
}

impl MigrationManager {
    pub fn new(units: Vec<Migration>) -> Result<Self> {
        for (index, unit) in units.iter().enumerate() {
            let expected = index as i64 + 1;
            if unit.id != expected {
                return Err(StoreError::NonContiguous {
                    expected,
                    found: unit.id,
                });
            }
        }
        Ok(Self { units })
    }

    /// The built-in registry.
    pub fn registered() -> Self {
        Self {
            units: MIGRATIONS.to_vec(),
        }
    }

    pub fn units(&self) -> &[Migration] {
        &self.units
    }

    async fn bookkeeping_exists(&self, store: &Store) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migration'",
        )
        .fetch_one(store.pool())
        .await?;
        Ok(count > 0)
    }

    async fn applied(&self, store: &Store) -> Result<BTreeMap<i64, String>> {
        if !self.bookkeeping_exists(store).await? {
            return Ok(BTreeMap::new());
        }
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT migration_id, checksum FROM schema_migration ORDER BY migration_id")
                .fetch_all(store.pool())
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn current_version(&self, store: &Store) -> Result<i64> {
        Ok(self
            .applied(store)
            .await?
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    pub async fn apply_pending(&self, store: &Store) -> Result<usize> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migration (
                migration_id INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(store.pool())
        .await?;

        let applied = self.applied(store).await?;
        let mut count = 0usize;
        for unit in self.units.iter().filter(|u| !applied.contains_key(&u.id)) {
            let span = info_span!("migration", id = unit.id, description = unit.description);
            apply_unit(store, unit).instrument(span).await?;
            count += 1;
        }
        if count > 0 {
            info!(count, "applied pending migrations");
        }
        Ok(count)
    }

    /// Statements `apply_pending` would run, in order. Never writes.
    pub async fn preview_pending(&self, store: &Store) -> Result<Vec<PendingMigration>> {
        let applied = self.applied(store).await?;
        Ok(self
            .units
            .iter()
            .filter(|u| !applied.contains_key(&u.id))
            .map(|u| PendingMigration {
                id: u.id,
                description: u.description.to_string(),
                statements: u.statements.iter().map(|s| s.to_string()).collect(),
            })
            .collect())
    }

    pub async fn verify_checksums(&self, store: &Store) -> Result<Vec<ChecksumMismatch>> {
        let applied = self.applied(store).await?;
        Ok(self
            .units
            .iter()
            .filter_map(|unit| {
                let recorded = applied.get(&unit.id)?;
                let current = unit.checksum();
                (recorded != &current).then(|| ChecksumMismatch {
                    id: unit.id,
                    recorded: recorded.clone(),
                    current,
                })
            })
            .collect())
    }
}

async fn apply_unit(store: &Store, unit: &Migration) -> Result<()> {
    let fail = |source| StoreError::Migration {
        id: unit.id,
        description: unit.description.to_string(),
        source,
    };
    let mut tx = store.begin().await?;
    for statement in unit.statements {
        sqlx::query(statement).execute(&mut *tx).await.map_err(fail)?;
    }
    sqlx::query(
        "INSERT INTO schema_migration (migration_id, description, checksum, applied_at) VALUES (?, ?, ?, ?)",
    )
    .bind(unit.id)
    .bind(unit.description)
    .bind(unit.checksum())
    .bind(format_timestamp(Utc::now()))
    .execute(&mut *tx)
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)?;
    info!("migration applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn schema_of(store: &Store) -> Vec<(String, String)> {
        sqlx::query_as(
            "SELECT name, COALESCE(sql, '') FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(store.pool())
        .await
        .expect("schema")
    }

    #[test]
    fn registry_is_contiguous() {
        assert!(MigrationManager::new(MIGRATIONS.to_vec()).is_ok());
    }

    #[test]
    fn gaps_in_ids_are_rejected() {
        let units = vec![MIGRATIONS[0], MIGRATIONS[2]];
        let err = MigrationManager::new(units).expect_err("gap");
        assert!(matches!(err, StoreError::NonContiguous { expected: 2, found: 3 }));
    }

    #[tokio::test]
    async fn applying_twice_is_a_no_op() {
        let store = Store::in_memory().await.expect("store");
        let manager = MigrationManager::registered();

        let first = manager.apply_pending(&store).await.expect("first");
        let schema_once = schema_of(&store).await;
        let second = manager.apply_pending(&store).await.expect("second");

        assert_eq!(first, MIGRATIONS.len());
        assert_eq!(second, 0);
        assert_eq!(schema_of(&store).await, schema_once);
        assert_eq!(
            manager.current_version(&store).await.expect("version"),
            MIGRATIONS.len() as i64
        );
    }

    #[tokio::test]
    async fn preview_lists_pending_without_writing() {
        let store = Store::in_memory().await.expect("store");
        let manager = MigrationManager::registered();

        let pending = manager.preview_pending(&store).await.expect("preview");
        assert_eq!(pending.len(), MIGRATIONS.len());
        assert_eq!(pending[0].id, 1);
        assert!(pending[0].statements[0].contains("CREATE TABLE division"));
        assert!(store.table_names().await.expect("tables").is_empty());

        manager.apply_pending(&store).await.expect("apply");
        assert!(manager.preview_pending(&store).await.expect("preview").is_empty());
    }

    #[tokio::test]
    async fn changed_definition_is_reported_as_drift() {
        let store = Store::in_memory().await.expect("store");
        MigrationManager::registered()
            .apply_pending(&store)
            .await
            .expect("apply");

        let mut edited = MIGRATIONS.to_vec();
        edited[1] = Migration {
            id: 2,
            description: "ingest provenance",
            statements: &["CREATE TABLE ingest_provenance (source_file TEXT)"],
        };
        let manager = MigrationManager::new(edited).expect("manager");
        let drift = manager.verify_checksums(&store).await.expect("verify");

        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].id, 2);
        assert_eq!(drift[0].recorded, MIGRATIONS[1].checksum());
        assert_ne!(drift[0].recorded, drift[0].current);
    }

    #[tokio::test]
    async fn failing_unit_keeps_earlier_units_recorded() {
        const BROKEN: Migration = Migration {
            id: 2,
            description: "broken",
            statements: &[
                "CREATE TABLE half_done (id INTEGER)",
                "CREATE TABLE division (name TEXT)",
            ],
        };
        let store = Store::in_memory().await.expect("store");
        let manager = MigrationManager::new(vec![MIGRATIONS[0], BROKEN]).expect("manager");

        let err = manager.apply_pending(&store).await.expect_err("must fail");
        assert!(matches!(err, StoreError::Migration { id: 2, .. }));
        assert_eq!(manager.current_version(&store).await.expect("version"), 1);

        let tables = store.table_names().await.expect("tables");
        assert!(!tables.contains(&"half_done".to_string()));
    }
}
