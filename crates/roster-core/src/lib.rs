//! Core domain records, content hashing and the source-file naming convention for rosterdb.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "roster-core";

pub const RANKING_PREFIX: &str = "ranking_table_";
pub const ROSTER_PREFIX: &str = "team_roster_";

/// Season recorded for divisions whose source does not carry one.
pub const UNKNOWN_SEASON: i64 = 0;

/// Hex sha256 of `bytes`. Source documents, rule revisions and migration bodies are all
/// identified through this one function.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Division {
    pub name: String,
    pub season: i64,
}

impl Division {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            season: UNKNOWN_SEASON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub club_name: String,
    pub team_number: u32,
    pub roster_link: Option<String>,
}

impl Team {
    pub fn from_display_name(name: &str) -> Self {
        let (club_name, team_number) = split_club_and_suffix(name);
        Self {
            name: name.trim().to_string(),
            club_name,
            team_number,
            roster_link: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub full_name: String,
    pub live_pz: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Upcoming,
    Completed,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_number: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub home_team: String,
    pub guest_team: String,
    pub home_score: Option<i64>,
    pub guest_score: Option<i64>,
    pub status: MatchStatus,
}

impl MatchRecord {
    /// Kickoff as a naive local timestamp; accepts `dd.mm.yyyy` and ISO dates, time defaults to midnight.
    pub fn kickoff(&self) -> Option<NaiveDateTime> {
        kickoff_from(self.date.as_deref()?, self.time.as_deref())
    }
}

/// Parses a schedule date (`dd.mm.yyyy` or ISO) and optional `HH:MM` time.
pub fn kickoff_from(date: &str, time: Option<&str>) -> Option<NaiveDateTime> {
    let date = date.trim();
    let date = NaiveDate::parse_from_str(date, "%d.%m.%Y")
        .or_else(|_| NaiveDate::parse_from_str(date, "%Y-%m-%d"))
        .ok()?;
    let time = time
        .and_then(|t| NaiveTime::parse_from_str(t.trim(), "%H:%M").ok())
        .unwrap_or(NaiveTime::MIN);
    Some(date.and_time(time))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingRow {
    pub position: i64,
    pub team_name: String,
    pub points: Option<i64>,
}

/// Splits a trailing team number (1..=20) off a team display name.
pub fn split_club_and_suffix(full_name: &str) -> (String, u32) {
    let tokens: Vec<&str> = full_name.split_whitespace().collect();
    if tokens.len() >= 2 {
        if let Some(number) = tokens
            .last()
            .and_then(|last| last.parse::<u32>().ok())
            .filter(|n| (1..=20).contains(n))
        {
            return (tokens[..tokens.len() - 1].join(" "), number);
        }
    }
    (tokens.join(" "), 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    RankingTable,
    TeamRoster {
        team_name: String,
        team_source_id: Option<String>,
    },
}

/// A source file whose name follows the `ranking_table_<division>.html` /
/// `team_roster_<division>_<team>_<id>.html` convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub division: String,
    pub kind: SourceKind,
}

impl SourceDocument {
    pub fn team_name(&self) -> Option<&str> {
        match &self.kind {
            SourceKind::TeamRoster { team_name, .. } => Some(team_name),
            SourceKind::RankingTable => None,
        }
    }
}

fn html_stem(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()?.strip_suffix(".html")
}

fn humanize(raw: &str) -> String {
    raw.split('_')
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classifies `paths` by the naming convention; files that do not follow it are left out.
///
/// A roster's division is the longest underscore prefix naming a ranking table in the same
/// directory, falling back to the first token.
pub fn classify_sources(paths: &[PathBuf]) -> Vec<SourceDocument> {
    let mut ranking_divisions: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();
    for path in paths {
        if let Some(raw) = html_stem(path).and_then(|s| s.strip_prefix(RANKING_PREFIX)) {
            ranking_divisions
                .entry(path.parent().map(Path::to_path_buf).unwrap_or_default())
                .or_default()
                .insert(raw.to_string());
        }
    }

    let mut out = Vec::new();
    for path in paths {
        let Some(stem) = html_stem(path) else {
            continue;
        };
        if let Some(raw) = stem.strip_prefix(RANKING_PREFIX) {
            let division = humanize(raw);
            if division.is_empty() {
                continue;
            }
            out.push(SourceDocument {
                path: path.clone(),
                division,
                kind: SourceKind::RankingTable,
            });
            continue;
        }
        let Some(rest) = stem.strip_prefix(ROSTER_PREFIX) else {
            continue;
        };
        let mut tokens: Vec<&str> = rest.split('_').filter(|t| !t.is_empty()).collect();
        let team_source_id = match tokens.last() {
            Some(last) if tokens.len() > 2 && last.chars().all(|c| c.is_ascii_digit()) => {
                let id = last.to_string();
                tokens.pop();
                Some(id)
            }
            _ => None,
        };
        if tokens.len() < 2 {
            continue;
        }
        let known = path.parent().and_then(|dir| ranking_divisions.get(dir));
        let split = known
            .and_then(|known| {
                (1..tokens.len())
                    .rev()
                    .find(|&k| known.contains(&tokens[..k].join("_")))
            })
            .unwrap_or(1);
        out.push(SourceDocument {
            path: path.clone(),
            division: tokens[..split].join(" "),
            kind: SourceKind::TeamRoster {
                team_name: tokens[split..].join(" "),
                team_source_id,
            },
        });
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}
