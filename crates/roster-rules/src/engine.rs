//! Runs a [`RuleSet`] against a parsed document.
//!
//! `scraper` only builds a DOM: scripts never run and nothing is fetched, so every
//! document (full page or isolated fragment) is handled the same way.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::debug;

use crate::schema::{FieldRule, ListRule, ResourceRule, RuleSet, TableRule, SELF_SELECTOR};
use crate::transforms::apply_chain;
use crate::{compile_selector, element_text, text_or_none, ExtractionIssue, RuleError, Row, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceExtraction {
    pub rows: Vec<Row>,
    pub issues: Vec<ExtractionIssue>,
    /// Bytes of cell text kept in `rows`.
    #[serde(skip)]
    pub cell_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extraction {
    pub resources: BTreeMap<String, ResourceExtraction>,
    pub node_count: usize,
}

impl Extraction {
    pub fn rows(&self, resource: &str) -> &[Row] {
        self.resources
            .get(resource)
            .map(|r| r.rows.as_slice())
            .unwrap_or_default()
    }

    pub fn issues(&self) -> impl Iterator<Item = &ExtractionIssue> {
        self.resources.values().flat_map(|r| r.issues.iter())
    }

    pub fn into_rows(self) -> BTreeMap<String, Vec<Row>> {
        self.resources
            .into_iter()
            .map(|(name, extraction)| (name, extraction.rows))
            .collect()
    }
}

/// Parses `html` and extracts every resource of `ruleset`.
pub fn extract(ruleset: &RuleSet, html: &str) -> Result<Extraction, RuleError> {
    let document = Html::parse_document(html);
    extract_document(ruleset, &document)
}

pub fn extract_document(ruleset: &RuleSet, document: &Html) -> Result<Extraction, RuleError> {
    let mut resources = BTreeMap::new();
    for (name, rule) in &ruleset.resources {
        resources.insert(name.clone(), run_resource(name, rule, document)?);
    }
    Ok(Extraction {
        resources,
        node_count: document.tree.nodes().count(),
    })
}

/// Runs one named resource against an isolated HTML fragment.
pub fn extract_resource(ruleset: &RuleSet, name: &str, fragment: &str) -> Result<ResourceExtraction, RuleError> {
    let rule = ruleset.resource(name)?;
    let document = Html::parse_document(fragment);
    run_resource(name, rule, &document)
}

fn run_resource(name: &str, rule: &ResourceRule, document: &Html) -> Result<ResourceExtraction, RuleError> {
    let extraction = match rule {
        ResourceRule::List(list) => extract_list(name, list, document)?,
        ResourceRule::Table(table) => extract_table(name, table, document)?,
    };
    debug!(
        resource = name,
        rows = extraction.rows.len(),
        issues = extraction.issues.len(),
        "resource extracted"
    );
    Ok(extraction)
}

fn structural(resource: &str, message: String) -> ExtractionIssue {
    ExtractionIssue::StructuralParsing {
        resource: resource.to_string(),
        message,
    }
}

fn extract_table(name: &str, rule: &TableRule, document: &Html) -> Result<ResourceExtraction, RuleError> {
    let table_selector = compile_selector(&rule.selector)?;
    let row_selector = compile_selector("tr")?;
    let mut out = ResourceExtraction::default();

    let Some(table) = document.select(&table_selector).next() else {
        out.issues
            .push(structural(name, format!("no element matches {:?}", rule.selector)));
        return Ok(out);
    };

    let mut data_row = 0;
    for tr in table.select(&row_selector) {
        let cells: Vec<(bool, Option<String>)> = tr
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|cell| matches!(cell.value().name(), "td" | "th"))
            .map(|cell| (cell.value().name() == "th", text_or_none(element_text(cell))))
            .collect();
        if cells.iter().all(|(header, _)| *header) || cells.iter().all(|(_, text)| text.is_none()) {
            continue;
        }
        let index = data_row;
        data_row += 1;

        if cells.len() != rule.columns.len() {
            out.issues.push(ExtractionIssue::ColumnMismatch {
                resource: name.to_string(),
                row: index,
                expected: rule.columns.len(),
                found: cells.len(),
            });
            if rule.strict {
                continue;
            }
        }

        let mut row = Row::new();
        for (position, column) in rule.columns.iter().enumerate() {
            let value = match cells.get(position).and_then(|(_, text)| text.clone()) {
                Some(text) => {
                    out.cell_bytes += text.len();
                    Value::Text(text)
                }
                None => Value::Null,
            };
            row.insert(column.clone(), value);
        }
        out.rows.push(row);
    }
    Ok(out)
}

/// Items under the first container `rule` matches, in document order.
fn matched_items<'a>(rule: &ListRule, document: &'a Html) -> Result<Vec<ElementRef<'a>>, RuleError> {
    let container = compile_selector(&rule.selector)?;
    let item = compile_selector(&rule.item_selector)?;
    Ok(document
        .select(&container)
        .next()
        .map(|parent| parent.select(&item).collect())
        .unwrap_or_default())
}

/// Document-order positions of the items a list rule matches; the identity used to compare
/// what two rules select.
pub fn item_positions(rule: &ListRule, document: &Html) -> Result<BTreeSet<usize>, RuleError> {
    let order: HashMap<_, usize> = document
        .tree
        .nodes()
        .enumerate()
        .map(|(index, node)| (node.id(), index))
        .collect();
    Ok(matched_items(rule, document)?
        .into_iter()
        .filter_map(|element| order.get(&element.id()).copied())
        .collect())
}

fn raw_value(element: ElementRef<'_>, field: &FieldRule) -> Option<String> {
    match &field.attr {
        Some(attr) => element.value().attr(attr).map(str::to_string),
        None => Some(element.text().collect()),
    }
}

fn extract_list(name: &str, rule: &ListRule, document: &Html) -> Result<ResourceExtraction, RuleError> {
    let mut fields: Vec<(&String, &FieldRule, Option<Selector>)> = Vec::with_capacity(rule.fields.len());
    for (field_name, field) in &rule.fields {
        let selector = if field.selector == SELF_SELECTOR {
            None
        } else {
            Some(compile_selector(&field.selector)?)
        };
        fields.push((field_name, field, selector));
    }

    let mut out = ResourceExtraction::default();
    let items = matched_items(rule, document)?;
    if items.is_empty() {
        out.issues.push(structural(
            name,
            format!("no items match {:?} within {:?}", rule.item_selector, rule.selector),
        ));
        return Ok(out);
    }

    for (index, item) in items.into_iter().enumerate() {
        let mut row = Row::new();
        let mut rejected = false;
        for (field_name, field, selector) in &fields {
            let raw = match selector {
                None => raw_value(item, field),
                Some(selector) => item.select(selector).next().and_then(|el| raw_value(el, field)),
            };
            let value = match apply_chain(raw, &field.transforms) {
                Ok(value) => value,
                Err(err) => {
                    out.issues.push(ExtractionIssue::ValueExtraction {
                        resource: name.to_string(),
                        field: field_name.to_string(),
                        row: index,
                        message: err.to_string(),
                    });
                    rejected |= rule.strict;
                    Value::Null
                }
            };
            if let Value::Text(text) = &value {
                out.cell_bytes += text.len();
            }
            row.insert(field_name.to_string(), value);
        }
        if rejected {
            debug!(resource = name, row = index, "strict resource dropped row");
            continue;
        }
        if row.values().all(Value::is_null) {
            continue;
        }
        out.rows.push(row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(json: &str) -> RuleSet {
        RuleSet::from_json(json).expect("ruleset")
    }

    const ROSTER: &str = r#"
        <html><body>
          <ul class="players">
            <li><span class="name"> Erika Muster </span><span class="pz">1 520</span><a href="/p/1">p</a></li>
            <li><span class="name">Max Beispiel</span><span class="pz">n/a</span></li>
          </ul>
          <table class="ranking">
            <tr><th>Platz</th><th>Team</th><th>Punkte</th></tr>
            <tr><td>1</td><td>SV Ost 2</td><td>18</td></tr>
            <tr><td>2</td><td>TTC Nord</td></tr>
            <tr><td></td><td></td><td></td></tr>
          </table>
        </body></html>"#;

    const RULES: &str = r#"{
        "version": 1,
        "resources": {
            "players": {"kind": "list", "selector": "ul.players", "item_selector": "li",
                "fields": {
                    "name": {"selector": ".name", "transforms": ["trim"]},
                    "live_pz": {"selector": ".pz", "transforms": ["trim", "to_number"]},
                    "profile": {"selector": "a", "attr": "href"}
                }},
            "standings": {"kind": "table", "selector": "table.ranking",
                "columns": ["position", "team", "points"]}
        }
    }"#;

    #[test]
    fn list_items_become_rows() {
        let extraction = extract(&rules(RULES), ROSTER).expect("extract");
        let players = extraction.rows("players");
        assert_eq!(players.len(), 2);
        assert_eq!(players[0]["name"], Value::Text("Erika Muster".into()));
        assert_eq!(players[0]["live_pz"], Value::Integer(1520));
        assert_eq!(players[0]["profile"], Value::Text("/p/1".into()));
        assert_eq!(players[1]["live_pz"], Value::Null);
        assert_eq!(players[1]["profile"], Value::Null);
        assert!(extraction
            .issues()
            .any(|i| matches!(i, ExtractionIssue::ValueExtraction { field, .. } if field == "live_pz")));
    }

    #[test]
    fn table_rows_skip_header_and_pad_short_rows() {
        let extraction = extract(&rules(RULES), ROSTER).expect("extract");
        let standings = extraction.rows("standings");
        assert_eq!(standings.len(), 2);
        assert_eq!(standings[0]["team"], Value::Text("SV Ost 2".into()));
        assert_eq!(standings[1]["points"], Value::Null);
        assert!(extraction.issues().any(|i| matches!(
            i,
            ExtractionIssue::ColumnMismatch { expected: 3, found: 2, .. }
        )));
    }

    #[test]
    fn strict_resources_drop_failing_rows() {
        let strict = RULES
            .replace(r#""item_selector": "li","#, r#""item_selector": "li", "strict": true,"#)
            .replace(r#""columns": ["position", "team", "points"]"#, r#""columns": ["position", "team", "points"], "strict": true"#);
        let extraction = extract(&rules(&strict), ROSTER).expect("extract");
        assert_eq!(extraction.rows("players").len(), 1);
        assert_eq!(extraction.rows("standings").len(), 1);
    }

    #[test]
    fn missing_container_is_a_structural_issue() {
        let extraction = extract(&rules(RULES), "<p>nothing here</p>").expect("extract");
        assert!(extraction.rows("players").is_empty());
        assert_eq!(extraction.issues().count(), 2);
        assert!(extraction
            .issues()
            .all(|i| matches!(i, ExtractionIssue::StructuralParsing { .. })));
    }

    #[test]
    fn fragment_matches_full_document() {
        let ruleset = rules(RULES);
        let fragment = r#"<ul class="players"><li><span class="name">Erika Muster</span><span class="pz">1 520</span><a href="/p/1">p</a></li>
            <li><span class="name">Max Beispiel</span><span class="pz">n/a</span></li></ul>"#;
        let sandboxed = extract_resource(&ruleset, "players", fragment).expect("fragment");
        let full = extract(&ruleset, ROSTER).expect("document");
        assert_eq!(sandboxed.rows, full.rows("players"));
        assert!(matches!(
            extract_resource(&ruleset, "nope", fragment),
            Err(RuleError::UnknownResource(_))
        ));
    }

    #[test]
    fn self_selector_reads_the_item() {
        let ruleset = rules(
            r#"{"version": 1, "resources": {"teams": {"kind": "list", "selector": "ul",
                "item_selector": "a", "fields": {"name": ".", "link": {"selector": ".", "attr": "href"}}}}}"#,
        );
        let rows = extract(&ruleset, r#"<ul><li><a href="/t/7">SV Ost</a></li></ul>"#)
            .expect("extract")
            .into_rows();
        assert_eq!(rows["teams"][0]["name"], Value::Text("SV Ost".into()));
        assert_eq!(rows["teams"][0]["link"], Value::Text("/t/7".into()));
    }

    #[test]
    fn row_header_cells_keep_their_column() {
        let html = r#"<table class="ranking">
            <tr><th>Platz</th><th>Team</th><th>Punkte</th></tr>
            <tr><th>1</th><td>SV Ost</td><td>18</td></tr>
        </table>"#;
        let extraction = extract(&rules(RULES), html).expect("extract");
        let standings = extraction.rows("standings");
        assert_eq!(standings.len(), 1);
        assert_eq!(standings[0]["position"], Value::Text("1".into()));
        assert_eq!(standings[0]["team"], Value::Text("SV Ost".into()));
        assert_eq!(standings[0]["points"], Value::Text("18".into()));
        assert!(!extraction
            .issues()
            .any(|i| matches!(i, ExtractionIssue::ColumnMismatch { .. })));
    }

    #[test]
    fn only_the_first_matching_table_and_container_are_read() {
        let html = r#"
            <table class="ranking"><tr><td>1</td><td>A</td><td>10</td></tr></table>
            <table class="ranking"><tr><td>9</td><td>Z</td><td>0</td></tr></table>
            <ul class="players"><li><span class="name">Erika Muster</span></li></ul>
            <ul class="players"><li><span class="name">Seite 2</span></li></ul>"#;
        let rows = extract(&rules(RULES), html).expect("extract").into_rows();
        assert_eq!(rows["standings"].len(), 1);
        assert_eq!(rows["standings"][0]["team"], Value::Text("A".into()));
        assert_eq!(rows["players"].len(), 1);
        assert_eq!(rows["players"][0]["name"], Value::Text("Erika Muster".into()));
    }

    #[test]
    fn nested_containers_do_not_duplicate_items() {
        let ruleset = rules(
            r#"{"version": 1, "resources": {"names": {"kind": "list", "selector": "div",
                "item_selector": "li", "fields": {"name": "."}}}}"#,
        );
        let html = "<div><div><ul><li>A</li><li>B</li></ul></div></div>";
        assert_eq!(extract(&ruleset, html).expect("extract").rows("names").len(), 2);
        let document = Html::parse_document(html);
        let ResourceRule::List(list) = ruleset.resource("names").expect("names") else {
            panic!("list");
        };
        assert_eq!(item_positions(list, &document).expect("positions").len(), 2);
    }
}
