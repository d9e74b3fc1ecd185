//! Pre-apply validation for rule sets: constraint simulation, selector overlap, orphan
//! fields and quality gates. Findings are returned as data; only the expression guard
//! and a strict apply with failing gates reject a call.

use std::collections::{BTreeMap, HashSet};

use roster_rules::{extract_document, item_positions, ExtractionIssue, Row, RuleError, RuleSet};
use roster_storage::domain::record_apply_audit;
use roster_storage::{save_version_in, Store, StoreError};
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "roster-validation";

/// Rows per resource name, as produced by extraction or supplied as a sample.
pub type SampleRows = BTreeMap<String, Vec<Row>>;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Rejected(#[from] GuardRejection),
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0} quality gate(s) below threshold")]
    GatesFailed(usize),
}

pub type Result<T, E = ValidationError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    UniqueViolation {
        resource: String,
        field: String,
        value: String,
    },
    FkOrphan {
        child_resource: String,
        fk_field: String,
        value: String,
    },
}

/// Duplicate values on `unique` fields (the first occurrence is accepted) and foreign key
/// values with no matching row in the referenced resource. Null values are never flagged.
pub fn simulate_constraints(ruleset: &RuleSet, sample_rows: &SampleRows) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (name, rule) in &ruleset.resources {
        let rows = sample_rows.get(name).map(Vec::as_slice).unwrap_or_default();
        let constraints = rule.constraints();

        for field in &constraints.unique {
            let mut seen = HashSet::new();
            for value in rows.iter().filter_map(|row| row.get(field).and_then(|v| v.key())) {
                if !seen.insert(value.clone()) {
                    issues.push(ValidationIssue::UniqueViolation {
                        resource: name.clone(),
                        field: field.clone(),
                        value,
                    });
                }
            }
        }

        for (field, target) in &constraints.foreign_keys {
            let parents: HashSet<String> = sample_rows
                .get(&target.resource)
                .into_iter()
                .flatten()
                .filter_map(|row| row.get(&target.field).and_then(|v| v.key()))
                .collect();
            for value in rows.iter().filter_map(|row| row.get(field).and_then(|v| v.key())) {
                if !parents.contains(&value) {
                    issues.push(ValidationIssue::FkOrphan {
                        child_resource: name.clone(),
                        fk_field: field.clone(),
                        value,
                    });
                }
            }
        }
    }
    issues
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlapRecord {
    pub resource_a: String,
    pub resource_b: String,
    pub count_a: usize,
    pub count_b: usize,
    pub overlap_count: usize,
    pub jaccard: f64,
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Pairs of list resources whose items hit the same DOM nodes, ordered by resource names.
pub fn detect_overlaps(ruleset: &RuleSet, html: &str) -> Result<Vec<OverlapRecord>> {
    let document = Html::parse_document(html);
    detect_overlaps_in(ruleset, &document)
}

pub fn detect_overlaps_in(ruleset: &RuleSet, document: &Html) -> Result<Vec<OverlapRecord>> {
    let mut matched = Vec::new();
    for (name, rule) in ruleset.list_resources() {
        matched.push((name, item_positions(rule, document)?));
    }

    let mut overlaps = Vec::new();
    for (i, (name_a, items_a)) in matched.iter().enumerate() {
        for (name_b, items_b) in &matched[i + 1..] {
            let overlap_count = items_a.intersection(items_b).count();
            if overlap_count == 0 {
                continue;
            }
            let union = items_a.len() + items_b.len() - overlap_count;
            overlaps.push(OverlapRecord {
                resource_a: (*name_a).clone(),
                resource_b: (*name_b).clone(),
                count_a: items_a.len(),
                count_b: items_b.len(),
                overlap_count,
                jaccard: round6(overlap_count as f64 / union as f64),
            });
        }
    }
    Ok(overlaps)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct OrphanField {
    pub resource: String,
    pub field: String,
}

/// Declared fields (or table columns) that `mapping` never sends to an output column.
pub fn compute_orphan_fields(
    ruleset: &RuleSet,
    mapping: &BTreeMap<String, BTreeMap<String, String>>,
) -> Vec<OrphanField> {
    let mut orphans = Vec::new();
    for (name, rule) in &ruleset.resources {
        let mapped = mapping.get(name);
        for field in rule.declared_fields() {
            if !mapped.is_some_and(|m| m.contains_key(field)) {
                orphans.push(OrphanField {
                    resource: name.clone(),
                    field: field.to_string(),
                });
            }
        }
    }
    orphans.sort();
    orphans
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGateResult {
    /// `resource.field`
    pub gate: String,
    pub required_coverage: f64,
    pub observed_coverage: f64,
    pub rows: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGateReport {
    pub results: Vec<QualityGateResult>,
    pub passed: bool,
    pub failed_count: usize,
}

/// Evaluates the rule set's own gates plus `thresholds` (which win on equal keys).
/// A resource without rows has coverage 0.
pub fn evaluate_quality_gates(
    ruleset: &RuleSet,
    sample_rows: &SampleRows,
    thresholds: &BTreeMap<String, f64>,
) -> QualityGateReport {
    let mut gates = ruleset.quality_gates.clone();
    gates.extend(thresholds.iter().map(|(k, v)| (k.clone(), *v)));

    let results: Vec<QualityGateResult> = gates
        .into_iter()
        .map(|(gate, required_coverage)| {
            let (resource, field) = gate.split_once('.').unwrap_or((gate.as_str(), ""));
            let rows = sample_rows.get(resource).map(Vec::as_slice).unwrap_or_default();
            let present = rows
                .iter()
                .filter(|row| row.get(field).is_some_and(|v| !v.is_null()))
                .count();
            let observed_coverage = if rows.is_empty() {
                0.0
            } else {
                present as f64 / rows.len() as f64
            };
            QualityGateResult {
                passed: observed_coverage >= required_coverage,
                required_coverage,
                observed_coverage,
                rows: rows.len(),
                gate,
            }
        })
        .collect();

    let failed_count = results.iter().filter(|r| !r.passed).count();
    QualityGateReport {
        results,
        passed: failed_count == 0,
        failed_count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    pub disallow_expressions: bool,
    /// Failing quality gates block `apply`.
    pub strict_gates: bool,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            disallow_expressions: true,
            strict_gates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("rule set uses disallowed expression transforms on {}", .fields.join(", "))]
    DisallowedExpressions { fields: Vec<String> },
}

pub fn check_ruleset_safety(ruleset: &RuleSet, settings: &GuardSettings) -> Result<(), GuardRejection> {
    if !settings.disallow_expressions {
        return Ok(());
    }
    let fields: Vec<String> = ruleset
        .expression_fields()
        .into_iter()
        .map(|(resource, field)| format!("{resource}.{field}"))
        .collect();
    if fields.is_empty() {
        Ok(())
    } else {
        Err(GuardRejection::DisallowedExpressions { fields })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub rows_by_resource: SampleRows,
    pub extraction_issues: Vec<ExtractionIssue>,
    pub constraint_issues: Vec<ValidationIssue>,
    pub overlaps: Vec<OverlapRecord>,
    pub orphan_fields: Vec<OrphanField>,
    pub quality_gates: QualityGateReport,
}

impl SimulationReport {
    pub fn ready_to_apply(&self, settings: &GuardSettings) -> bool {
        !settings.strict_gates || self.quality_gates.passed
    }
}

/// Guard, extraction and every advisory check over one document. Constraints and gates
/// run against `sample_rows` when given, otherwise against the extracted rows. No writes.
pub fn simulate(
    ruleset: &RuleSet,
    html: &str,
    sample_rows: Option<&SampleRows>,
    settings: &GuardSettings,
) -> Result<SimulationReport> {
    check_ruleset_safety(ruleset, settings)?;

    let document = Html::parse_document(html);
    let extraction = extract_document(ruleset, &document)?;
    let extraction_issues: Vec<ExtractionIssue> = extraction.issues().cloned().collect();
    for issue in &extraction_issues {
        warn!(%issue, "extraction issue");
    }
    let rows_by_resource = extraction.into_rows();
    let checked_rows = sample_rows.unwrap_or(&rows_by_resource);

    let report = SimulationReport {
        constraint_issues: simulate_constraints(ruleset, checked_rows),
        overlaps: detect_overlaps_in(ruleset, &document)?,
        orphan_fields: compute_orphan_fields(ruleset, &ruleset.mapping),
        quality_gates: evaluate_quality_gates(ruleset, checked_rows, &BTreeMap::new()),
        extraction_issues,
        rows_by_resource,
    };
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub audit_id: i64,
    pub rule_version: i64,
    pub rows: usize,
    pub gates_passed: bool,
}

/// Simulates, then records the rule version and an audit row of the extracted rows in one
/// transaction.
/// With `strict_gates`, a failing gate aborts before anything is written.
pub async fn apply(store: &Store, ruleset: &RuleSet, html: &str, settings: &GuardSettings) -> Result<ApplyOutcome> {
    let span = info_span!("rule_apply", resources = ruleset.resources.len());
    async move {
        let report = simulate(ruleset, html, None, settings)?;
        if !report.ready_to_apply(settings) {
            warn!(failed = report.quality_gates.failed_count, "strict apply blocked by quality gates");
            return Err(ValidationError::GatesFailed(report.quality_gates.failed_count));
        }

        let canonical = ruleset.to_canonical_json()?;
        let rows_json = serde_json::to_string(&report.rows_by_resource)?;
        let rows = report.rows_by_resource.values().map(Vec::len).sum();

        let mut tx = store.begin().await?;
        let saved = save_version_in(&mut *tx, &canonical).await?;
        let audit_id = record_apply_audit(&mut *tx, Some(saved.version_num), &rows_json, report.quality_gates.passed).await?;
        tx.commit().await.map_err(StoreError::from)?;

        info!(audit_id, rule_version = saved.version_num, rows, "rule set applied");
        Ok(ApplyOutcome {
            audit_id,
            rule_version: saved.version_num,
            rows,
            gates_passed: report.quality_gates.passed,
        })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_rules::Value;
    use roster_storage::MigrationManager;

    fn ruleset(json: &str) -> RuleSet {
        RuleSet::from_json(json).expect("ruleset")
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    const TEAMS_AND_PLAYERS: &str = r#"{"version": 1, "resources": {
        "teams": {"kind": "list", "selector": "ul.teams", "item_selector": "li",
                  "fields": {"name": "."}, "unique": ["name"]},
        "players": {"kind": "list", "selector": "ul.players", "item_selector": "li",
                    "fields": {"name": ".n", "team": ".t"},
                    "foreign_keys": {"team": "teams.name"}}
    }, "mapping": {"players": {"name": "player.full_name"}}}"#;

    #[test]
    fn duplicate_and_orphan_values_are_reported() {
        let rules = ruleset(TEAMS_AND_PLAYERS);
        let mut sample = SampleRows::new();
        sample.insert(
            "teams".into(),
            vec![
                row(&[("name", Value::Text("SV Ost".into()))]),
                row(&[("name", Value::Text("SV Ost".into()))]),
                row(&[("name", Value::Null)]),
            ],
        );
        sample.insert(
            "players".into(),
            vec![
                row(&[("name", Value::Text("Erika".into())), ("team", Value::Text("SV Ost".into()))]),
                row(&[("name", Value::Text("Max".into())), ("team", Value::Text("TTC Nord".into()))]),
                row(&[("name", Value::Text("Lena".into())), ("team", Value::Null)]),
            ],
        );

        let issues = simulate_constraints(&rules, &sample);
        assert_eq!(
            issues,
            vec![
                ValidationIssue::FkOrphan {
                    child_resource: "players".into(),
                    fk_field: "team".into(),
                    value: "TTC Nord".into(),
                },
                ValidationIssue::UniqueViolation {
                    resource: "teams".into(),
                    field: "name".into(),
                    value: "SV Ost".into(),
                },
            ]
        );
    }

    #[test]
    fn overlapping_item_sets_report_jaccard() {
        let rules = ruleset(
            r#"{"version": 1, "resources": {
                "a": {"kind": "list", "selector": "ul", "item_selector": "li.a", "fields": {"v": "."}},
                "b": {"kind": "list", "selector": "ul", "item_selector": "li.b", "fields": {"v": "."}},
                "c": {"kind": "list", "selector": "ol", "item_selector": "li", "fields": {"v": "."}},
                "t": {"kind": "table", "selector": "table", "columns": ["v"]}
            }}"#,
        );
        let html = r#"<ul><li class="a b">1</li><li class="a b">2</li><li class="a">3</li></ul><ol><li>x</li></ol>"#;

        let overlaps = detect_overlaps(&rules, html).expect("overlaps");
        assert_eq!(overlaps.len(), 1);
        let overlap = &overlaps[0];
        assert_eq!((overlap.resource_a.as_str(), overlap.resource_b.as_str()), ("a", "b"));
        assert_eq!((overlap.count_a, overlap.count_b, overlap.overlap_count), (3, 2, 2));
        assert!((overlap.jaccard - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn unmapped_fields_are_orphans() {
        let rules = ruleset(TEAMS_AND_PLAYERS);
        let orphans = compute_orphan_fields(&rules, &rules.mapping);
        assert_eq!(
            orphans,
            vec![
                OrphanField { resource: "players".into(), field: "team".into() },
                OrphanField { resource: "teams".into(), field: "name".into() },
            ]
        );
    }

    #[test]
    fn gate_fails_below_threshold() {
        let rules = ruleset(TEAMS_AND_PLAYERS);
        let mut sample = SampleRows::new();
        sample.insert(
            "players".into(),
            vec![
                row(&[("name", Value::Text("Erika".into())), ("team", Value::Null)]),
                row(&[("name", Value::Text("Max".into())), ("team", Value::Text("SV Ost".into()))]),
            ],
        );
        let thresholds = BTreeMap::from([
            ("players.team".to_string(), 0.75),
            ("players.name".to_string(), 1.0),
            ("teams.name".to_string(), 0.5),
        ]);

        let report = evaluate_quality_gates(&rules, &sample, &thresholds);
        assert!(!report.passed);
        assert_eq!(report.failed_count, 2);
        let team_gate = report.results.iter().find(|r| r.gate == "players.team").expect("gate");
        assert_eq!(team_gate.observed_coverage, 0.5);
        assert!(!team_gate.passed);
        let empty = report.results.iter().find(|r| r.gate == "teams.name").expect("gate");
        assert_eq!((empty.rows, empty.observed_coverage), (0, 0.0));
    }

    const WITH_EXPR: &str = r#"{"version": 1, "allow_expressions": true, "resources": {
        "players": {"kind": "list", "selector": "ul", "item_selector": "li",
                    "fields": {"name": {"selector": ".", "transforms": [{"kind": "expr", "code": "v.title()"}]}}}}}"#;

    #[test]
    fn guard_rejects_expressions_when_disallowed() {
        let rules = ruleset(WITH_EXPR);
        let err = simulate(&rules, "<ul><li>x</li></ul>", None, &GuardSettings::default()).expect_err("rejected");
        assert!(matches!(
            err,
            ValidationError::Rejected(GuardRejection::DisallowedExpressions { ref fields }) if fields == &["players.name"]
        ));

        let permissive = GuardSettings {
            disallow_expressions: false,
            ..GuardSettings::default()
        };
        let report = simulate(&rules, "<ul><li>x</li></ul>", None, &permissive).expect("simulated");
        assert!(report.rows_by_resource["players"].is_empty());
        assert!(!report.extraction_issues.is_empty());
    }

    async fn migrated() -> Store {
        let store = Store::in_memory().await.expect("store");
        MigrationManager::registered()
            .apply_pending(&store)
            .await
            .expect("migrate");
        store
    }

    #[tokio::test]
    async fn strict_apply_with_failing_gate_writes_nothing() {
        let store = migrated().await;
        let rules = ruleset(
            r#"{"version": 1, "resources": {"players": {"kind": "list", "selector": "ul", "item_selector": "li",
                "fields": {"name": ".n", "pz": ".pz"}}}, "quality_gates": {"players.pz": 0.75}}"#,
        );
        let html = r#"<ul><li><span class="n">Erika</span><span class="pz">1520</span></li><li><span class="n">Max</span></li></ul>"#;
        let strict = GuardSettings {
            strict_gates: true,
            ..GuardSettings::default()
        };

        let err = apply(&store, &rules, html, &strict).await.expect_err("blocked");
        assert!(matches!(err, ValidationError::GatesFailed(1)));
        let audits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rule_apply_audit")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(audits, 0);

        let outcome = apply(&store, &rules, html, &GuardSettings::default()).await.expect("applied");
        assert_eq!(outcome.rows, 2);
        assert!(!outcome.gates_passed);
        assert_eq!(outcome.rule_version, 1);
        let again = apply(&store, &rules, html, &GuardSettings::default()).await.expect("applied");
        assert_eq!(again.rule_version, 1);
        assert!(again.audit_id > outcome.audit_id);
    }

    #[tokio::test]
    async fn failed_audit_write_rolls_back_the_version() {
        let store = migrated().await;
        let rules = ruleset(
            r#"{"version": 1, "resources": {"players": {"kind": "list", "selector": "ul", "item_selector": "li",
                "fields": {"name": "."}}}}"#,
        );
        sqlx::query("DROP TABLE rule_apply_audit")
            .execute(store.pool())
            .await
            .expect("drop");

        let err = apply(&store, &rules, "<ul><li>Erika</li></ul>", &GuardSettings::default())
            .await
            .expect_err("audit table missing");
        assert!(matches!(err, ValidationError::Store(_)));
        assert!(store.rule_versions().list_versions().await.expect("list").is_empty());
    }
}
