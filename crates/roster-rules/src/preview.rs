//! Side-effect-free previews of a rule set over one or many documents.

use std::collections::{BTreeMap, HashSet};
use std::mem::size_of;
use std::time::Instant;

use scraper::Html;
use serde::Serialize;
use tracing::info_span;

use crate::engine::extract_document;
use crate::schema::{ResourceKind, RuleSet};
use crate::{ExtractionIssue, RuleError, Row};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub kind: ResourceKind,
    pub rows: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub rows_by_resource: BTreeMap<String, Vec<Row>>,
    pub resources: BTreeMap<String, ResourceSummary>,
    pub node_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_time_ms: Option<f64>,
    /// Estimated bytes retained: source text, parsed nodes and extracted cells.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_delta_bytes: Option<usize>,
    pub issues: Vec<ExtractionIssue>,
}

impl Preview {
    pub fn total_rows(&self) -> usize {
        self.rows_by_resource.values().map(Vec::len).sum()
    }
}

pub fn generate_preview(ruleset: &RuleSet, html: &str, capture_performance: bool) -> Result<Preview, RuleError> {
    let _span = info_span!("preview", resources = ruleset.resources.len(), bytes = html.len()).entered();
    let started = Instant::now();

    let document = Html::parse_document(html);
    let extraction = extract_document(ruleset, &document)?;
    let elapsed = started.elapsed();

    let cell_bytes: usize = extraction.resources.values().map(|r| r.cell_bytes).sum();
    let mut rows_by_resource = BTreeMap::new();
    let mut resources = BTreeMap::new();
    let mut issues = Vec::new();
    for (name, resource) in extraction.resources {
        let kind = ruleset.resource(&name)?.kind();
        resources.insert(
            name.clone(),
            ResourceSummary {
                kind,
                rows: resource.rows.len(),
                warnings: resource.issues.iter().map(ToString::to_string).collect(),
            },
        );
        issues.extend(resource.issues);
        rows_by_resource.insert(name, resource.rows);
    }

    let node_count = extraction.node_count;
    Ok(Preview {
        rows_by_resource,
        resources,
        node_count,
        parse_time_ms: capture_performance.then(|| elapsed.as_secs_f64() * 1000.0),
        memory_delta_bytes: capture_performance
            .then(|| html.len() + node_count * size_of::<scraper::Node>() + cell_bytes),
        issues,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilePreviewStats {
    pub source: String,
    pub rows: usize,
    /// Rows whose key had not been seen in an earlier document of the batch.
    pub added: usize,
    pub overlapping: usize,
    pub issues: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchPreview {
    pub files: Vec<FilePreviewStats>,
    pub unique_rows: BTreeMap<String, usize>,
    pub total_rows: usize,
    pub total_node_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_parse_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<usize>,
}

/// Previews each `(source, html)` pair and aggregates totals; rows are deduplicated
/// per resource by their JSON encoding.
pub fn generate_batch_preview<'a, I>(
    ruleset: &RuleSet,
    documents: I,
    capture_performance: bool,
) -> Result<BatchPreview, RuleError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut batch = BatchPreview::default();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for (source, html) in documents {
        let preview = generate_preview(ruleset, html, capture_performance)?;
        let mut stats = FilePreviewStats {
            source: source.to_string(),
            rows: preview.total_rows(),
            added: 0,
            overlapping: 0,
            issues: preview.issues.len(),
        };
        for (resource, rows) in &preview.rows_by_resource {
            for row in rows {
                let key = (resource.clone(), serde_json::to_string(row)?);
                if seen.insert(key) {
                    stats.added += 1;
                    *batch.unique_rows.entry(resource.clone()).or_default() += 1;
                } else {
                    stats.overlapping += 1;
                }
            }
        }

        batch.total_rows += stats.rows;
        batch.total_node_count += preview.node_count;
        if let Some(ms) = preview.parse_time_ms {
            *batch.total_parse_time_ms.get_or_insert(0.0) += ms;
        }
        if let Some(bytes) = preview.memory_delta_bytes {
            let peak = batch.peak_memory_bytes.get_or_insert(0);
            *peak = (*peak).max(bytes);
        }
        batch.files.push(stats);
    }
    Ok(batch)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldCoverage {
    pub non_null: usize,
    pub null: usize,
}

impl FieldCoverage {
    pub fn ratio(&self) -> f64 {
        let total = self.non_null + self.null;
        if total == 0 {
            0.0
        } else {
            self.non_null as f64 / total as f64
        }
    }
}

/// Per-field non-null/null counts for every resource in `preview`.
pub fn coercion_stats(preview: &Preview) -> BTreeMap<String, BTreeMap<String, FieldCoverage>> {
    preview
        .rows_by_resource
        .iter()
        .map(|(resource, rows)| {
            let mut fields: BTreeMap<String, FieldCoverage> = BTreeMap::new();
            for row in rows {
                for (field, value) in row {
                    let coverage = fields.entry(field.clone()).or_default();
                    if value.is_null() {
                        coverage.null += 1;
                    } else {
                        coverage.non_null += 1;
                    }
                }
            }
            (resource.clone(), fields)
        })
        .collect()
}
