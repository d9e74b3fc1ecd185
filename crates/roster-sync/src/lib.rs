//! Ingestion orchestration: walk a source tree, skip what provenance says is unchanged,
//! parse the rest and write each file's rows plus its provenance in one transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDateTime, Utc};
use roster_core::{
    classify_sources, content_hash, kickoff_from, Division, MatchRecord, Player, SourceDocument, SourceKind, Team,
};
use roster_rules::legacy::{parse_ranking_page, parse_roster_page, RankingPage};
use roster_rules::{extract, ExtractionIssue, Row, RuleSet, Value};
use roster_storage::domain::{
    prune_players, record_ingest_error, replace_ranking, store_extracted_rows, upcoming_matches_for_team, upsert_division,
    upsert_match, upsert_player, upsert_team, UpsertOutcome,
};
use roster_storage::provenance::{record_or_update_at, touch_at};
use roster_storage::{EvictionPolicy, EvictionReport, ProvenanceEntry, Store, StoreError};
use roster_validation::{check_ruleset_safety, evaluate_quality_gates, GuardSettings};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod policy;

pub use policy::{NoRescrape, RescrapePolicy, UpcomingMatchWindow};

pub const CRATE_NAME: &str = "roster-sync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub ruleset_path: Option<PathBuf>,
    pub parser_version: String,
    pub disallow_expressions: bool,
    pub strict_gates: bool,
    pub evict_max_age_days: Option<i64>,
    pub evict_max_entries: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://rosterdb.sqlite?mode=rwc".to_string(),
            data_dir: PathBuf::from("./data"),
            ruleset_path: None,
            parser_version: env!("CARGO_PKG_VERSION").to_string(),
            disallow_expressions: true,
            strict_gates: false,
            evict_max_age_days: None,
            evict_max_entries: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("ROSTER_DATABASE_URL").unwrap_or(defaults.database_url),
            data_dir: std::env::var("ROSTER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            ruleset_path: std::env::var("ROSTER_RULESET").ok().map(PathBuf::from),
            parser_version: std::env::var("ROSTER_PARSER_VERSION").unwrap_or(defaults.parser_version),
            disallow_expressions: env_flag("ROSTER_DISALLOW_EXPRESSIONS", defaults.disallow_expressions),
            strict_gates: env_flag("ROSTER_STRICT_GATES", defaults.strict_gates),
            evict_max_age_days: std::env::var("ROSTER_EVICT_MAX_AGE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok()),
            evict_max_entries: std::env::var("ROSTER_EVICT_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make a run fail after files were already written.
    pub fn validate(&self) -> Result<()> {
        if let Some(days) = self.evict_max_age_days {
            if days < 0 {
                bail!("evict_max_age_days must not be negative, got {days}");
            }
            if Duration::try_days(days).is_none() {
                bail!("evict_max_age_days {days} is out of range");
            }
        }
        Ok(())
    }

    pub fn guard_settings(&self) -> GuardSettings {
        GuardSettings {
            disallow_expressions: self.disallow_expressions,
            strict_gates: self.strict_gates,
        }
    }

    /// Eviction settings for a pass that started at `protected_since`.
    pub fn eviction_policy(&self, protected_since: DateTime<Utc>) -> EvictionPolicy {
        EvictionPolicy {
            max_age_days: self.evict_max_age_days,
            max_entries: self.evict_max_entries,
            protected_since: Some(protected_since),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestError {
    pub file: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub skipped_unchanged: usize,
    pub new_files: usize,
    pub changed_files: usize,
    /// Unchanged files re-ingested because the rescrape policy asked for it.
    pub forced_refresh: usize,
    /// Recorded sources no longer present under the root.
    pub missing: usize,
    pub divisions_ingested: usize,
    pub teams_ingested: usize,
    pub players_ingested: usize,
    /// Players deleted because their roster page no longer lists them.
    pub players_removed: usize,
    pub errors: Vec<IngestError>,
    pub cancelled: bool,
    pub eviction: Option<EvictionReport>,
}

impl IngestSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            processed: 0,
            skipped_unchanged: 0,
            new_files: 0,
            changed_files: 0,
            forced_refresh: 0,
            missing: 0,
            divisions_ingested: 0,
            teams_ingested: 0,
            players_ingested: 0,
            players_removed: 0,
            errors: Vec::new(),
            cancelled: false,
            eviction: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FileCounts {
    divisions: usize,
    teams: usize,
    players: usize,
    players_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    New,
    Updated,
    Unchanged,
}

struct Candidate {
    document: SourceDocument,
    key: String,
    hash: String,
}

enum Parsed {
    Ranking(RankingPage),
    Roster {
        team: Team,
        players: Vec<Player>,
        matches: Vec<MatchRecord>,
        rule_rows: BTreeMap<String, Vec<String>>,
    },
}

async fn collect_html_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut pending = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "html") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn source_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn error_category(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<ExtractionIssue>().is_some() {
        "extraction"
    } else if err.downcast_ref::<StoreError>().is_some() {
        "database"
    } else {
        "ingest"
    }
}

/// Players named by the rule set's `player.*` column mapping, plus a `team.name` override.
fn mapped_roster(ruleset: &RuleSet, rows: &BTreeMap<String, Vec<Row>>) -> (Vec<Player>, Option<String>) {
    let mut players: Vec<Player> = Vec::new();
    let mut team_name = None;
    for (resource, fields) in &ruleset.mapping {
        let Some(rows) = rows.get(resource) else {
            continue;
        };
        let field_for = |column: &str| fields.iter().find(|(_, c)| c.as_str() == column).map(|(f, _)| f);
        let name_field = field_for("player.full_name");
        let pz_field = field_for("player.live_pz");
        let team_field = field_for("team.name");
        for row in rows {
            if let Some(team) = team_field.and_then(|f| row.get(f)).and_then(Value::key) {
                team_name.get_or_insert(team);
            }
            let Some(full_name) = name_field.and_then(|f| row.get(f)).and_then(Value::key) else {
                continue;
            };
            let live_pz = pz_field.and_then(|f| row.get(f)).and_then(Value::as_i64);
            players.push(Player { full_name, live_pz });
        }
    }
    let mut seen = HashSet::new();
    players.retain(|p| seen.insert(p.full_name.clone()));
    (players, team_name)
}

pub struct IngestionCoordinator {
    store: Store,
    config: IngestConfig,
    ruleset: Option<RuleSet>,
    policy: Box<dyn RescrapePolicy>,
}

impl IngestionCoordinator {
    pub fn new(store: Store, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            ruleset: None,
            policy: Box::new(NoRescrape),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn RescrapePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ruleset(mut self, ruleset: RuleSet) -> Self {
        self.ruleset = Some(ruleset);
        self
    }

    /// Loads the rule set named by `config.ruleset_path`, if any.
    pub fn load_configured_ruleset(self) -> Result<Self> {
        match self.config.ruleset_path.clone() {
            Some(path) => {
                let ruleset =
                    RuleSet::load(&path).with_context(|| format!("loading rule set {}", path.display()))?;
                Ok(self.with_ruleset(ruleset))
            }
            None => Ok(self),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One pass over `source_root`. Cancellation is checked between files only.
    pub async fn run(&self, source_root: &Path, cancel: &CancellationToken) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, root = %source_root.display());
        self.run_inner(run_id, source_root, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, source_root: &Path, cancel: &CancellationToken) -> Result<IngestSummary> {
        self.config.validate()?;
        let started = Utc::now();
        let mut summary = IngestSummary::new(run_id);

        let files = collect_html_files(source_root).await?;
        let mut documents = classify_sources(&files);
        documents.sort_by_key(|d| (matches!(d.kind, SourceKind::TeamRoster { .. }), d.path.clone()));

        let mut candidates = Vec::with_capacity(documents.len());
        let mut current = BTreeMap::new();
        for document in documents {
            let key = source_key(source_root, &document.path);
            match fs::read(&document.path).await {
                Ok(bytes) => {
                    let hash = content_hash(&bytes);
                    current.insert(key.clone(), hash.clone());
                    candidates.push(Candidate { document, key, hash });
                }
                Err(err) => {
                    warn!(file = %key, error = %err, "unreadable source");
                    summary.errors.push(IngestError {
                        file: key,
                        message: err.to_string(),
                    });
                }
            }
        }

        let diff = self.store.provenance().diff_against_current(&current).await?;
        summary.missing = diff.missing.len();
        let updated: BTreeSet<&String> = diff.updated.iter().collect();
        let fresh: BTreeSet<&String> = diff.new.iter().collect();

        let rule_version = match &self.ruleset {
            Some(ruleset) => {
                check_ruleset_safety(ruleset, &self.config.guard_settings())?;
                let saved = self
                    .store
                    .rule_versions()
                    .save_version(&ruleset.to_canonical_json()?)
                    .await?;
                Some(saved.version_num)
            }
            None => None,
        };

        let now_local = Local::now().naive_local();
        for candidate in &candidates {
            if cancel.is_cancelled() {
                info!("ingest cancelled between files");
                summary.cancelled = true;
                break;
            }
            let change = if fresh.contains(&candidate.key) {
                Change::New
            } else if updated.contains(&candidate.key) {
                Change::Updated
            } else {
                Change::Unchanged
            };

            if change == Change::Unchanged {
                if self.forced(candidate, now_local).await? {
                    summary.forced_refresh += 1;
                } else {
                    let mut conn = self.store.pool().acquire().await?;
                    touch_at(&mut conn, &candidate.key, Utc::now()).await?;
                    summary.skipped_unchanged += 1;
                    debug!(file = %candidate.key, "unchanged");
                    continue;
                }
            }

            match self.ingest_file(candidate, rule_version).await {
                Ok(counts) => {
                    summary.processed += 1;
                    match change {
                        Change::New => summary.new_files += 1,
                        Change::Updated => summary.changed_files += 1,
                        Change::Unchanged => {}
                    }
                    summary.divisions_ingested += counts.divisions;
                    summary.teams_ingested += counts.teams;
                    summary.players_ingested += counts.players;
                    summary.players_removed += counts.players_removed;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(file = %candidate.key, error = %message, "ingest failed; provenance left untouched");
                    let mut conn = self.store.pool().acquire().await?;
                    record_ingest_error(&mut conn, &candidate.key, error_category(&err), &message).await?;
                    summary.errors.push(IngestError {
                        file: candidate.key.clone(),
                        message,
                    });
                }
            }
        }

        if !summary.cancelled {
            let policy = self.config.eviction_policy(started);
            if !policy.is_noop() {
                summary.eviction = Some(self.store.provenance().evict(&policy).await?);
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped_unchanged,
            forced = summary.forced_refresh,
            errors = summary.errors.len(),
            cancelled = summary.cancelled,
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn forced(&self, candidate: &Candidate, now: NaiveDateTime) -> Result<bool> {
        if !self.policy.wants_schedule() {
            return Ok(false);
        }
        let kickoffs: Vec<NaiveDateTime> = match candidate.document.team_name() {
            Some(team) => {
                let mut conn = self.store.pool().acquire().await?;
                let division = Division::new(candidate.document.division.clone());
                upcoming_matches_for_team(&mut conn, &division, team)
                    .await?
                    .iter()
                    .filter_map(|(date, time)| kickoff_from(date, time.as_deref()))
                    .collect()
            }
            None => Vec::new(),
        };
        Ok(self.policy.should_rescrape(&candidate.document, &kickoffs, now))
    }

    fn parse(&self, candidate: &Candidate, html: &str) -> Result<Parsed> {
        let document = &candidate.document;
        let SourceKind::TeamRoster { team_name, .. } = &document.kind else {
            let page = parse_ranking_page(html, &document.division)
                .with_context(|| format!("parsing ranking table {}", candidate.key))?;
            return Ok(Parsed::Ranking(page));
        };

        let Some(ruleset) = &self.ruleset else {
            let page = parse_roster_page(html).with_context(|| format!("parsing roster {}", candidate.key))?;
            return Ok(Parsed::Roster {
                team: Team::from_display_name(team_name),
                players: page.players,
                matches: page.matches,
                rule_rows: BTreeMap::new(),
            });
        };

        let extraction = extract(ruleset, html).with_context(|| format!("extracting {}", candidate.key))?;
        for issue in extraction.issues() {
            warn!(file = %candidate.key, %issue, "extraction issue");
        }
        let rows = extraction.into_rows();
        if self.config.strict_gates {
            let gates = evaluate_quality_gates(ruleset, &rows, &BTreeMap::new());
            if !gates.passed {
                bail!("{} quality gate(s) failed for {}", gates.failed_count, candidate.key);
            }
        }
        let (players, mapped_team) = mapped_roster(ruleset, &rows);
        let mut rule_rows = BTreeMap::new();
        for (resource, resource_rows) in &rows {
            let encoded = resource_rows
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            rule_rows.insert(resource.clone(), encoded);
        }
        Ok(Parsed::Roster {
            team: Team::from_display_name(mapped_team.as_deref().unwrap_or(team_name)),
            players,
            matches: Vec::new(),
            rule_rows,
        })
    }

    /// Parses outside the transaction, then writes rows and provenance atomically.
    async fn ingest_file(&self, candidate: &Candidate, rule_version: Option<i64>) -> Result<FileCounts> {
        let html = fs::read_to_string(&candidate.document.path)
            .await
            .with_context(|| format!("reading {}", candidate.document.path.display()))?;
        let parsed = self.parse(candidate, &html)?;

        let mut counts = FileCounts::default();
        let mut tx = self.store.begin().await?;
        let division = Division::new(candidate.document.division.clone());
        let (division_id, outcome) = upsert_division(&mut *tx, &division).await?;
        if outcome == UpsertOutcome::Inserted {
            counts.divisions += 1;
        }

        match parsed {
            Parsed::Ranking(page) => {
                for team in &page.teams {
                    let (_, outcome) = upsert_team(&mut *tx, division_id, team).await?;
                    if outcome == UpsertOutcome::Inserted {
                        counts.teams += 1;
                    }
                }
                replace_ranking(&mut *tx, division_id, &page.standings).await?;
            }
            Parsed::Roster {
                team,
                players,
                matches,
                rule_rows,
            } => {
                let (team_id, outcome) = upsert_team(&mut *tx, division_id, &team).await?;
                if outcome == UpsertOutcome::Inserted {
                    counts.teams += 1;
                }
                for player in &players {
                    if upsert_player(&mut *tx, team_id, player).await? != UpsertOutcome::Unchanged {
                        counts.players += 1;
                    }
                }
                counts.players_removed = prune_players(&mut *tx, team_id, &players).await?;
                for record in &matches {
                    upsert_match(&mut *tx, division_id, record).await?;
                }
                for (resource, rows) in &rule_rows {
                    store_extracted_rows(&mut *tx, &candidate.key, resource, rule_version, rows).await?;
                }
            }
        }

        record_or_update_at(
            &mut *tx,
            ProvenanceEntry {
                source_file: &candidate.key,
                hash: &candidate.hash,
                parser_version: Some(&self.config.parser_version),
                rule_version,
            },
            Utc::now(),
        )
        .await?;
        tx.commit().await.context("committing ingest transaction")?;
        debug!(file = %candidate.key, ?counts, "ingested");
        Ok(counts)
    }
}
