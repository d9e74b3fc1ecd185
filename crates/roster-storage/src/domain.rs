//! Upserts for league entities plus the ingest side tables. Everything here runs on a
//! caller-supplied connection so one source file's writes share a single transaction.

use chrono::Utc;
use roster_core::{Division, MatchRecord, Player, RankingRow, Team};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;

use crate::{format_timestamp, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Stable id for `(entity_type, source_key)`, allocated on first request.
pub async fn assign_id(conn: &mut SqliteConnection, entity_type: &str, source_key: &str) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO id_map (entity_type, source_key) VALUES (?, ?)")
        .bind(entity_type)
        .bind(source_key)
        .execute(&mut *conn)
        .await?;
    let id = sqlx::query_scalar("SELECT assigned_id FROM id_map WHERE entity_type = ? AND source_key = ?")
        .bind(entity_type)
        .bind(source_key)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn upsert_division(conn: &mut SqliteConnection, division: &Division) -> Result<(i64, UpsertOutcome)> {
    let key = format!("{}|{}", division.name, division.season);
    let id = assign_id(conn, "division", &key).await?;
    let inserted = sqlx::query("INSERT INTO division (division_id, name, season) VALUES (?, ?, ?) ON CONFLICT DO NOTHING")
        .bind(id)
        .bind(&division.name)
        .bind(division.season)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let outcome = if inserted > 0 {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Unchanged
    };
    Ok((id, outcome))
}

pub async fn upsert_club(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    let id = assign_id(conn, "club", name).await?;
    sqlx::query("INSERT INTO club (club_id, name) VALUES (?, ?) ON CONFLICT DO NOTHING")
        .bind(id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn upsert_team(
    conn: &mut SqliteConnection,
    division_id: i64,
    team: &Team,
) -> Result<(i64, UpsertOutcome)> {
    let club_id = upsert_club(conn, &team.club_name).await?;
    let id = assign_id(conn, "team", &format!("{division_id}|{}", team.name)).await?;
    let existed: Option<i64> = sqlx::query_scalar("SELECT team_id FROM team WHERE team_id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO team (team_id, division_id, club_id, name, team_number, roster_link)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(team_id) DO UPDATE SET
            club_id = excluded.club_id,
            team_number = excluded.team_number,
            roster_link = COALESCE(excluded.roster_link, team.roster_link)",
    )
    .bind(id)
    .bind(division_id)
    .bind(club_id)
    .bind(&team.name)
    .bind(team.team_number as i64)
    .bind(team.roster_link.as_deref())
    .execute(&mut *conn)
    .await?;
    let outcome = if existed.is_some() {
        UpsertOutcome::Unchanged
    } else {
        UpsertOutcome::Inserted
    };
    Ok((id, outcome))
}

/// Inserts a new player or refreshes `live_pz` when it changed.
pub async fn upsert_player(conn: &mut SqliteConnection, team_id: i64, player: &Player) -> Result<UpsertOutcome> {
    let existing: Option<(i64, Option<i64>)> =
        sqlx::query_as("SELECT player_id, live_pz FROM player WHERE team_id = ? AND full_name = ?")
            .bind(team_id)
            .bind(&player.full_name)
            .fetch_optional(&mut *conn)
            .await?;
    match existing {
        Some((_, live_pz)) if live_pz == player.live_pz => Ok(UpsertOutcome::Unchanged),
        Some((player_id, _)) => {
            sqlx::query("UPDATE player SET live_pz = ? WHERE player_id = ?")
                .bind(player.live_pz)
                .bind(player_id)
                .execute(&mut *conn)
                .await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            let id = assign_id(conn, "player", &format!("{team_id}|{}", player.full_name)).await?;
            sqlx::query("INSERT INTO player (player_id, team_id, full_name, live_pz) VALUES (?, ?, ?, ?)")
                .bind(id)
                .bind(team_id)
                .bind(&player.full_name)
                .bind(player.live_pz)
                .execute(&mut *conn)
                .await?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

/// Deletes the team's players whose names are not in `current`. Returns how many went.
pub async fn prune_players(conn: &mut SqliteConnection, team_id: i64, current: &[Player]) -> Result<usize> {
    let stored: Vec<(i64, String)> = sqlx::query_as("SELECT player_id, full_name FROM player WHERE team_id = ?")
        .bind(team_id)
        .fetch_all(&mut *conn)
        .await?;
    let mut removed = 0;
    for (player_id, full_name) in stored {
        if current.iter().any(|p| p.full_name == full_name) {
            continue;
        }
        sqlx::query("DELETE FROM player WHERE player_id = ?")
            .bind(player_id)
            .execute(&mut *conn)
            .await?;
        removed += 1;
    }
    Ok(removed)
}

/// Replaces the standings of one division.
pub async fn replace_ranking(conn: &mut SqliteConnection, division_id: i64, rows: &[RankingRow]) -> Result<usize> {
    sqlx::query("DELETE FROM division_ranking WHERE division_id = ?")
        .bind(division_id)
        .execute(&mut *conn)
        .await?;
    for row in rows {
        sqlx::query(
            "INSERT OR REPLACE INTO division_ranking (division_id, position, team_name, points) VALUES (?, ?, ?, ?)",
        )
        .bind(division_id)
        .bind(row.position)
        .bind(&row.team_name)
        .bind(row.points)
        .execute(&mut *conn)
        .await?;
    }
    Ok(rows.len())
}

pub async fn upsert_match(conn: &mut SqliteConnection, division_id: i64, record: &MatchRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO match_record
            (division_id, match_number, match_date, match_time, home_team, guest_team, home_score, guest_score, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(division_id, home_team, guest_team, match_date) DO UPDATE SET
            match_number = excluded.match_number,
            match_time = excluded.match_time,
            home_score = excluded.home_score,
            guest_score = excluded.guest_score,
            status = excluded.status",
    )
    .bind(division_id)
    .bind(record.match_number.as_deref())
    .bind(record.date.as_deref().unwrap_or_default())
    .bind(record.time.as_deref())
    .bind(&record.home_team)
    .bind(&record.guest_team)
    .bind(record.home_score)
    .bind(record.guest_score)
    .bind(record.status.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Upcoming kickoffs (`date`, `time`) of matches in `division` involving `team_name`.
pub async fn upcoming_matches_for_team(
    conn: &mut SqliteConnection,
    division: &Division,
    team_name: &str,
) -> Result<Vec<(String, Option<String>)>> {
    let rows = sqlx::query_as(
        "SELECT m.match_date, m.match_time FROM match_record m
         JOIN division d ON d.division_id = m.division_id
         WHERE d.name = ? AND d.season = ? AND m.status = 'upcoming'
           AND (m.home_team = ? OR m.guest_team = ?)",
    )
    .bind(&division.name)
    .bind(division.season)
    .bind(team_name)
    .bind(team_name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Replaces the rule-engine rows previously stored for `(source_file, resource)`.
pub async fn store_extracted_rows(
    conn: &mut SqliteConnection,
    source_file: &str,
    resource: &str,
    rule_version: Option<i64>,
    rows_json: &[String],
) -> Result<usize> {
    sqlx::query("DELETE FROM rule_extracted_row WHERE source_file = ? AND resource = ?")
        .bind(source_file)
        .bind(resource)
        .execute(&mut *conn)
        .await?;
    for (index, payload) in rows_json.iter().enumerate() {
        sqlx::query(
            "INSERT INTO rule_extracted_row (source_file, resource, row_index, rule_version, payload_json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source_file)
        .bind(resource)
        .bind(index as i64)
        .bind(rule_version)
        .bind(payload)
        .execute(&mut *conn)
        .await?;
    }
    Ok(rows_json.len())
}

pub async fn record_ingest_error(
    conn: &mut SqliteConnection,
    source_file: &str,
    category: &str,
    message: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO ingest_error (source_file, category, message, recorded_at) VALUES (?, ?, ?, ?)")
        .bind(source_file)
        .bind(category)
        .bind(message)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn record_apply_audit(
    conn: &mut SqliteConnection,
    rule_version: Option<i64>,
    rows_json: &str,
    gates_passed: bool,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO rule_apply_audit (rule_version, applied_at, rows_json, gates_passed) VALUES (?, ?, ?, ?)",
    )
    .bind(rule_version)
    .bind(format_timestamp(Utc::now()))
    .bind(rows_json)
    .bind(gates_passed)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}
