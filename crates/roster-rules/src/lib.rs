//! Declarative HTML extraction rules plus the fixed-format parsers for legacy league pages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod engine;
pub mod legacy;
pub mod preview;
pub mod schema;
pub mod transforms;

pub use engine::{extract, extract_document, extract_resource, item_positions, Extraction, ResourceExtraction};
pub use preview::{
    coercion_stats, generate_batch_preview, generate_preview, BatchPreview, FieldCoverage,
    FilePreviewStats, Preview, ResourceSummary,
};
pub use schema::{
    FieldRule, ForeignKeyRef, ListRule, ResourceConstraints, ResourceKind, ResourceRule, RuleSet,
    TableRule,
};
pub use transforms::{apply_chain, parse_number, Transform, TransformError};

pub const CRATE_NAME: &str = "roster-rules";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("resource {resource}: {message}")]
    Invalid { resource: String, message: String },
    #[error("resource {resource} extends unknown resource {parent}")]
    UnknownParent { resource: String, parent: String },
    #[error("inheritance cycle through resource {0}")]
    InheritanceCycle(String),
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error("unknown transform {0:?}")]
    UnknownTransform(String),
    #[error("expression transform on {resource}.{field} requires allow_expressions")]
    ExpressionsDisabled { resource: String, field: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Recoverable problems met while extracting; collected, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionIssue {
    #[error("{resource}: {message}")]
    StructuralParsing { resource: String, message: String },
    #[error("{resource}: row {row} has {found} cells, expected {expected}")]
    ColumnMismatch {
        resource: String,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("{resource}.{field} (row {row}): {message}")]
    ValueExtraction {
        resource: String,
        field: String,
        row: usize,
        message: String,
    },
}

/// A typed cell. Dates serialize as ISO `YYYY-MM-DD` text, and ISO-shaped text reads
/// back as a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Date(chrono::NaiveDate),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Comparison key for uniqueness and joins; `None` for null.
    pub fn key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => parse_number(s).ok().and_then(|v| v.as_i64()),
            _ => None,
        }
    }
}

pub type Row = BTreeMap<String, Value>;

pub(crate) fn compile_selector(selector: &str) -> Result<Selector, RuleError> {
    Selector::parse(selector).map_err(|e| RuleError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Text nodes of `element`, each trimmed, joined by single spaces.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
