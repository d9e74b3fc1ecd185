//! Database integrity and table-naming checks reported as JSON-friendly data.

use serde::Serialize;
use serde_json::json;
use sqlx::Row;

use crate::{Result, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckIssue {
    pub category: String,
    pub message: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<CheckIssue>,
}

impl CheckReport {
    fn from_issues(issues: Vec<CheckIssue>) -> Self {
        let status = if issues.is_empty() {
            CheckStatus::Ok
        } else {
            CheckStatus::Fail
        };
        Self { status, issues }
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Ok
    }
}

/// Dangling foreign keys plus team names reused across divisions of one season.
pub async fn integrity_check(store: &Store) -> Result<CheckReport> {
    let mut issues = Vec::new();

    let violations = sqlx::query("PRAGMA foreign_key_check").fetch_all(store.pool()).await?;
    for row in violations {
        let table: String = row.try_get(0)?;
        let rowid: Option<i64> = row.try_get(1)?;
        let parent: String = row.try_get(2)?;
        issues.push(CheckIssue {
            category: "foreign_key".to_string(),
            message: format!("{table} row {} references missing {parent}", rowid.unwrap_or_default()),
            details: json!({ "table": table, "rowid": rowid, "parent": parent }),
        });
    }

    let duplicates: Vec<(i64, String, i64)> = sqlx::query_as(
        "SELECT d.season, t.name, COUNT(DISTINCT t.division_id) AS divisions
         FROM team t JOIN division d ON d.division_id = t.division_id
         GROUP BY d.season, t.name
         HAVING COUNT(DISTINCT t.division_id) > 1
         ORDER BY d.season, t.name",
    )
    .fetch_all(store.pool())
    .await?;
    for (season, name, divisions) in duplicates {
        issues.push(CheckIssue {
            category: "duplicate_team".to_string(),
            message: format!("team {name:?} appears in {divisions} divisions of season {season}"),
            details: json!({ "season": season, "team": name, "divisions": divisions }),
        });
    }

    Ok(CheckReport::from_issues(issues))
}

fn is_snake_case(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn looks_plural(name: &str) -> bool {
    const SINGULAR_ENDINGS: &[&str] = &["status", "ss"];
    name.ends_with('s') && !SINGULAR_ENDINGS.iter().any(|e| name.ends_with(e))
}

/// Every table name must be snake_case and singular.
pub async fn naming_check(store: &Store) -> Result<CheckReport> {
    let mut issues = Vec::new();
    for table in store.table_names().await? {
        if !is_snake_case(&table) {
            issues.push(CheckIssue {
                category: "naming".to_string(),
                message: format!("table {table:?} is not snake_case"),
                details: json!({ "table": table, "rule": "snake_case" }),
            });
        } else if looks_plural(&table) {
            issues.push(CheckIssue {
                category: "naming".to_string(),
                message: format!("table {table:?} looks plural"),
                details: json!({ "table": table, "rule": "singular" }),
            });
        }
    }
    Ok(CheckReport::from_issues(issues))
}
