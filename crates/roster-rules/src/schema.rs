//! Rule set document model: parsing, `extends` resolution and validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};

use crate::transforms::Transform;
use crate::{compile_selector, RuleError};

/// Field selector that refers to the list item itself.
pub const SELF_SELECTOR: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    List,
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRule {
    pub selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Transform>,
}

impl FieldRule {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attr: None,
            transforms: Vec::new(),
        }
    }

    /// Appends `transform` unless an identical one is already in the chain.
    pub fn push_transform(&mut self, transform: Transform) -> bool {
        if self.transforms.contains(&transform) {
            return false;
        }
        self.transforms.push(transform);
        true
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.push_transform(transform);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub resource: String,
    pub field: String,
}

impl ForeignKeyRef {
    pub fn parse(reference: &str) -> Option<Self> {
        let (resource, field) = reference.split_once('.')?;
        if resource.is_empty() || field.is_empty() {
            return None;
        }
        Some(Self {
            resource: resource.to_string(),
            field: field.to_string(),
        })
    }
}

impl fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.field)
    }
}

impl Serialize for ForeignKeyRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceConstraints {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unique: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub foreign_keys: BTreeMap<String, ForeignKeyRef>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListRule {
    pub selector: String,
    pub item_selector: String,
    pub fields: BTreeMap<String, FieldRule>,
    #[serde(skip_serializing_if = "is_false")]
    pub strict: bool,
    #[serde(flatten)]
    pub constraints: ResourceConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRule {
    pub selector: String,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub strict: bool,
    #[serde(flatten)]
    pub constraints: ResourceConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceRule {
    List(ListRule),
    Table(TableRule),
}

impl ResourceRule {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::List(_) => ResourceKind::List,
            Self::Table(_) => ResourceKind::Table,
        }
    }

    pub fn strict(&self) -> bool {
        match self {
            Self::List(rule) => rule.strict,
            Self::Table(rule) => rule.strict,
        }
    }

    pub fn constraints(&self) -> &ResourceConstraints {
        match self {
            Self::List(rule) => &rule.constraints,
            Self::Table(rule) => &rule.constraints,
        }
    }

    /// Field names in output order (columns for tables).
    pub fn declared_fields(&self) -> Vec<&str> {
        match self {
            Self::List(rule) => rule.fields.keys().map(String::as_str).collect(),
            Self::Table(rule) => rule.columns.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    pub version: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub allow_expressions: bool,
    pub resources: BTreeMap<String, ResourceRule>,
    /// resource -> field -> output column.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mapping: BTreeMap<String, BTreeMap<String, String>>,
    /// `"resource.field"` -> minimum non-null ratio.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub quality_gates: BTreeMap<String, f64>,
}

impl RuleSet {
    pub fn from_json(text: &str) -> Result<Self, RuleError> {
        let document: RuleSetDocument = serde_json::from_str(text)?;
        document.build()
    }

    pub fn from_yaml(text: &str) -> Result<Self, RuleError> {
        let document: RuleSetDocument = serde_yaml::from_str(text)?;
        document.build()
    }

    /// Loads a `.yaml`/`.yml` or JSON rule set file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Deterministic serialization with inheritance flattened; the input to rule versioning.
    pub fn to_canonical_json(&self) -> Result<String, RuleError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn resource(&self, name: &str) -> Result<&ResourceRule, RuleError> {
        self.resources
            .get(name)
            .ok_or_else(|| RuleError::UnknownResource(name.to_string()))
    }

    pub fn list_resources(&self) -> impl Iterator<Item = (&String, &ListRule)> {
        self.resources.iter().filter_map(|(name, rule)| match rule {
            ResourceRule::List(list) => Some((name, list)),
            ResourceRule::Table(_) => None,
        })
    }

    /// `(resource, field)` pairs that carry an expression transform.
    pub fn expression_fields(&self) -> Vec<(String, String)> {
        self.list_resources()
            .flat_map(|(name, rule)| {
                rule.fields
                    .iter()
                    .filter(|(_, field)| field.transforms.iter().any(Transform::is_expression))
                    .map(move |(field, _)| (name.clone(), field.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RuleSetDocument {
    version: u32,
    #[serde(default)]
    allow_expressions: bool,
    resources: BTreeMap<String, ResourceDocument>,
    #[serde(default)]
    mapping: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    quality_gates: BTreeMap<String, GateDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GateDocument {
    Threshold(f64),
    Nested(BTreeMap<String, f64>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ResourceDocument {
    List(ListDocument),
    Table(TableDocument),
}

impl ResourceDocument {
    fn extends(&self) -> Option<&str> {
        match self {
            Self::List(doc) => doc.extends.as_deref(),
            Self::Table(doc) => doc.extends.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListDocument {
    selector: Option<String>,
    item_selector: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, FieldDocument>,
    extends: Option<String>,
    strict: Option<bool>,
    #[serde(default)]
    unique: Vec<String>,
    #[serde(default)]
    foreign_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableDocument {
    selector: Option<String>,
    columns: Option<Vec<String>>,
    extends: Option<String>,
    strict: Option<bool>,
    #[serde(default)]
    unique: Vec<String>,
    #[serde(default)]
    foreign_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FieldDocument {
    Selector(String),
    Spec {
        selector: String,
        #[serde(default)]
        attr: Option<String>,
        #[serde(default)]
        transforms: Vec<TransformDocument>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TransformDocument {
    Name(String),
    Spec(Transform),
}

fn merge_unique(parent: Vec<String>, child: Vec<String>) -> Vec<String> {
    let mut out = parent;
    for name in child {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

fn merge(name: &str, parent: ResourceDocument, child: ResourceDocument) -> Result<ResourceDocument, RuleError> {
    match (parent, child) {
        (ResourceDocument::List(parent), ResourceDocument::List(child)) => {
            let mut fields = parent.fields;
            fields.extend(child.fields);
            let mut foreign_keys = parent.foreign_keys;
            foreign_keys.extend(child.foreign_keys);
            Ok(ResourceDocument::List(ListDocument {
                selector: child.selector.or(parent.selector),
                item_selector: child.item_selector.or(parent.item_selector),
                fields,
                extends: None,
                strict: child.strict.or(parent.strict),
                unique: merge_unique(parent.unique, child.unique),
                foreign_keys,
            }))
        }
        (ResourceDocument::Table(parent), ResourceDocument::Table(child)) => {
            let mut foreign_keys = parent.foreign_keys;
            foreign_keys.extend(child.foreign_keys);
            Ok(ResourceDocument::Table(TableDocument {
                selector: child.selector.or(parent.selector),
                columns: child.columns.or(parent.columns),
                extends: None,
                strict: child.strict.or(parent.strict),
                unique: merge_unique(parent.unique, child.unique),
                foreign_keys,
            }))
        }
        _ => Err(RuleError::Invalid {
            resource: name.to_string(),
            message: "extends a resource of a different kind".to_string(),
        }),
    }
}

fn resolve(
    name: &str,
    documents: &BTreeMap<String, ResourceDocument>,
    resolved: &mut BTreeMap<String, ResourceDocument>,
    visiting: &mut Vec<String>,
) -> Result<ResourceDocument, RuleError> {
    if let Some(done) = resolved.get(name) {
        return Ok(done.clone());
    }
    if visiting.iter().any(|v| v == name) {
        return Err(RuleError::InheritanceCycle(name.to_string()));
    }
    let document = documents
        .get(name)
        .ok_or_else(|| RuleError::UnknownResource(name.to_string()))?
        .clone();
    let merged = match document.extends() {
        None => document,
        Some(parent) => {
            if !documents.contains_key(parent) {
                return Err(RuleError::UnknownParent {
                    resource: name.to_string(),
                    parent: parent.to_string(),
                });
            }
            let parent = parent.to_string();
            visiting.push(name.to_string());
            let base = resolve(&parent, documents, resolved, visiting)?;
            visiting.pop();
            merge(name, base, document)?
        }
    };
    resolved.insert(name.to_string(), merged.clone());
    Ok(merged)
}

fn required(resource: &str, what: &str, value: Option<String>) -> Result<String, RuleError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RuleError::Invalid {
            resource: resource.to_string(),
            message: format!("{what} is required"),
        }),
    }
}

fn build_field(
    resource: &str,
    field: &str,
    document: FieldDocument,
    allow_expressions: bool,
) -> Result<FieldRule, RuleError> {
    let (selector, attr, transforms) = match document {
        FieldDocument::Selector(selector) => (selector, None, Vec::new()),
        FieldDocument::Spec {
            selector,
            attr,
            transforms,
        } => (selector, attr, transforms),
    };
    let selector = required(resource, &format!("selector of field {field}"), Some(selector))?;
    if selector != SELF_SELECTOR {
        compile_selector(&selector)?;
    }
    let mut rule = FieldRule {
        selector,
        attr,
        transforms: Vec::new(),
    };
    for transform in transforms {
        let transform = match transform {
            TransformDocument::Name(name) => {
                Transform::from_name(&name).ok_or(RuleError::UnknownTransform(name))?
            }
            TransformDocument::Spec(spec) => spec,
        };
        match &transform {
            Transform::ParseDate { formats } if formats.is_empty() => {
                return Err(RuleError::Invalid {
                    resource: resource.to_string(),
                    message: format!("parse_date on {field} needs at least one format"),
                });
            }
            Transform::Expr { .. } if !allow_expressions => {
                return Err(RuleError::ExpressionsDisabled {
                    resource: resource.to_string(),
                    field: field.to_string(),
                });
            }
            _ => {}
        }
        rule.push_transform(transform);
    }
    Ok(rule)
}

fn build_constraints(
    resource: &str,
    declared: &[String],
    unique: Vec<String>,
    foreign_keys: BTreeMap<String, String>,
) -> Result<ResourceConstraints, RuleError> {
    let invalid = |message: String| RuleError::Invalid {
        resource: resource.to_string(),
        message,
    };
    for field in &unique {
        if !declared.contains(field) {
            return Err(invalid(format!("unique field {field} is not declared")));
        }
    }
    let mut parsed = BTreeMap::new();
    for (field, reference) in foreign_keys {
        if !declared.contains(&field) {
            return Err(invalid(format!("foreign key field {field} is not declared")));
        }
        let target = ForeignKeyRef::parse(&reference)
            .ok_or_else(|| invalid(format!("foreign key {reference:?} must be resource.field")))?;
        parsed.insert(field, target);
    }
    Ok(ResourceConstraints {
        unique,
        foreign_keys: parsed,
    })
}

fn build_resource(name: &str, document: ResourceDocument, allow_expressions: bool) -> Result<ResourceRule, RuleError> {
    match document {
        ResourceDocument::List(doc) => {
            let selector = required(name, "selector", doc.selector)?;
            let item_selector = required(name, "item_selector", doc.item_selector)?;
            compile_selector(&selector)?;
            compile_selector(&item_selector)?;
            if doc.fields.is_empty() {
                return Err(RuleError::Invalid {
                    resource: name.to_string(),
                    message: "list resources need at least one field".to_string(),
                });
            }
            let mut fields = BTreeMap::new();
            for (field, field_doc) in doc.fields {
                let rule = build_field(name, &field, field_doc, allow_expressions)?;
                fields.insert(field, rule);
            }
            let declared: Vec<String> = fields.keys().cloned().collect();
            Ok(ResourceRule::List(ListRule {
                selector,
                item_selector,
                fields,
                strict: doc.strict.unwrap_or(false),
                constraints: build_constraints(name, &declared, doc.unique, doc.foreign_keys)?,
            }))
        }
        ResourceDocument::Table(doc) => {
            let selector = required(name, "selector", doc.selector)?;
            compile_selector(&selector)?;
            let columns = doc.columns.unwrap_or_default();
            if columns.is_empty() {
                return Err(RuleError::Invalid {
                    resource: name.to_string(),
                    message: "table resources need at least one column".to_string(),
                });
            }
            for (index, column) in columns.iter().enumerate() {
                if column.trim().is_empty() || columns[..index].contains(column) {
                    return Err(RuleError::Invalid {
                        resource: name.to_string(),
                        message: format!("column {column:?} is blank or repeated"),
                    });
                }
            }
            Ok(ResourceRule::Table(TableRule {
                constraints: build_constraints(name, &columns, doc.unique, doc.foreign_keys)?,
                selector,
                columns,
                strict: doc.strict.unwrap_or(false),
            }))
        }
    }
}

impl RuleSetDocument {
    fn build(self) -> Result<RuleSet, RuleError> {
        let mut resolved = BTreeMap::new();
        let mut resources = BTreeMap::new();
        for name in self.resources.keys() {
            let document = resolve(name, &self.resources, &mut resolved, &mut Vec::new())?;
            resources.insert(name.clone(), build_resource(name, document, self.allow_expressions)?);
        }

        for (name, rule) in &resources {
            for target in rule.constraints().foreign_keys.values() {
                let known = resources
                    .get(&target.resource)
                    .is_some_and(|r| r.declared_fields().contains(&target.field.as_str()));
                if !known {
                    return Err(RuleError::Invalid {
                        resource: name.clone(),
                        message: format!("foreign key target {target} is not a declared field"),
                    });
                }
            }
        }

        if let Some(unknown) = self.mapping.keys().find(|r| !resources.contains_key(*r)) {
            return Err(RuleError::UnknownResource(unknown.clone()));
        }

        let mut quality_gates = BTreeMap::new();
        for (key, gate) in self.quality_gates {
            match gate {
                GateDocument::Threshold(threshold) => {
                    quality_gates.insert(key, threshold);
                }
                GateDocument::Nested(fields) => {
                    for (field, threshold) in fields {
                        quality_gates.insert(format!("{key}.{field}"), threshold);
                    }
                }
            }
        }
        for (key, threshold) in &quality_gates {
            if !key.contains('.') || !(0.0..=1.0).contains(threshold) {
                return Err(RuleError::Invalid {
                    resource: key.clone(),
                    message: format!("quality gate threshold {threshold} must be in 0..=1 on resource.field"),
                });
            }
        }

        Ok(RuleSet {
            version: self.version,
            allow_expressions: self.allow_expressions,
            resources,
            mapping: self.mapping,
            quality_gates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYERS: &str = r#"{
        "version": 1,
        "resources": {
            "players": {
                "kind": "list",
                "selector": "ul.players",
                "item_selector": "li",
                "fields": {
                    "name": {"selector": ".name", "transforms": ["trim", "trim"]},
                    "live_pz": {"selector": ".pz", "transforms": [{"kind": "trim"}, {"kind": "to_number"}]},
                    "profile": {"selector": "a", "attr": "href"}
                },
                "unique": ["name"]
            },
            "standings": {
                "kind": "table",
                "selector": "table.ranking",
                "columns": ["position", "team", "points"]
            }
        },
        "mapping": {"players": {"name": "player.full_name"}},
        "quality_gates": {"players.name": 0.9, "standings": {"team": 1.0}}
    }"#;

    #[test]
    fn parses_both_resource_kinds() {
        let rules = RuleSet::from_json(PLAYERS).expect("parse");
        assert_eq!(rules.resources.len(), 2);

        let ResourceRule::List(players) = rules.resource("players").expect("players") else {
            panic!("players must be a list");
        };
        assert_eq!(players.fields["name"].transforms, vec![Transform::Trim]);
        assert_eq!(players.fields["profile"].attr.as_deref(), Some("href"));
        assert_eq!(players.constraints.unique, vec!["name"]);

        let standings = rules.resource("standings").expect("standings");
        assert_eq!(standings.kind(), ResourceKind::Table);
        assert_eq!(standings.declared_fields(), vec!["position", "team", "points"]);

        assert_eq!(rules.quality_gates["standings.team"], 1.0);
        assert_eq!(rules.quality_gates["players.name"], 0.9);
    }

    #[test]
    fn identical_transform_is_not_appended_twice() {
        let mut field = FieldRule::new(".pz");
        assert!(field.push_transform(Transform::ToNumber));
        assert!(!field.push_transform(Transform::ToNumber));
        assert!(field.push_transform(Transform::Trim));
        assert_eq!(field.transforms, vec![Transform::ToNumber, Transform::Trim]);
    }

    #[test]
    fn canonical_json_round_trips() {
        let rules = RuleSet::from_json(PLAYERS).expect("parse");
        let canonical = rules.to_canonical_json().expect("json");
        let reparsed = RuleSet::from_json(&canonical).expect("reparse");
        assert_eq!(reparsed, rules);
        assert_eq!(reparsed.to_canonical_json().expect("json"), canonical);
    }

    #[test]
    fn extends_inherits_and_overrides() {
        let rules = RuleSet::from_json(
            r#"{"version": 2, "resources": {
                "base": {"kind": "list", "selector": "ul", "item_selector": "li",
                         "fields": {"name": ".name", "club": ".club"}},
                "seniors": {"kind": "list", "extends": "base", "selector": "ul.seniors",
                            "fields": {"club": {"selector": ".verein"}}}
            }}"#,
        )
        .expect("parse");
        let ResourceRule::List(seniors) = rules.resource("seniors").expect("seniors") else {
            panic!("list");
        };
        assert_eq!(seniors.selector, "ul.seniors");
        assert_eq!(seniors.item_selector, "li");
        assert_eq!(seniors.fields["name"].selector, ".name");
        assert_eq!(seniors.fields["club"].selector, ".verein");
    }

    #[test]
    fn inheritance_cycles_and_unknown_parents_are_rejected() {
        let cycle = RuleSet::from_json(
            r#"{"version": 1, "resources": {
                "a": {"kind": "list", "extends": "b", "selector": "ul", "item_selector": "li", "fields": {"x": "b"}},
                "b": {"kind": "list", "extends": "a", "selector": "ul", "item_selector": "li", "fields": {"x": "b"}}
            }}"#,
        );
        assert!(matches!(cycle, Err(RuleError::InheritanceCycle(_))));

        let orphan = RuleSet::from_json(
            r#"{"version": 1, "resources": {
                "a": {"kind": "table", "extends": "nope", "selector": "table", "columns": ["x"]}
            }}"#,
        );
        assert!(matches!(orphan, Err(RuleError::UnknownParent { .. })));
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let cases = [
            r#"{"version": 1, "resources": {"t": {"kind": "table", "selector": "table", "columns": []}}}"#,
            r#"{"version": 1, "resources": {"t": {"kind": "table", "selector": "table", "columns": ["a", "a"]}}}"#,
            r#"{"version": 1, "resources": {"l": {"kind": "list", "selector": "ul", "fields": {"x": "b"}}}}"#,
            r#"{"version": 1, "resources": {"l": {"kind": "list", "selector": "ul", "item_selector": "li", "fields": {}}}}"#,
            r#"{"version": 1, "resources": {"l": {"kind": "list", "selector": "ul[", "item_selector": "li", "fields": {"x": "b"}}}}"#,
            r#"{"version": 1, "resources": {"l": {"kind": "list", "selector": "ul", "item_selector": "li",
                "fields": {"x": {"selector": "b", "transforms": [{"kind": "parse_date", "formats": []}]}}}}}"#,
            r#"{"version": 1, "resources": {"l": {"kind": "list", "selector": "ul", "item_selector": "li",
                "fields": {"x": "b"}, "foreign_keys": {"x": "teams.id"}}}}"#,
            r#"{"version": 1, "resources": {"l": {"kind": "list", "selector": "ul", "item_selector": "li",
                "fields": {"x": "b"}}}, "quality_gates": {"l.x": 1.5}}"#,
        ];
        for case in cases {
            assert!(RuleSet::from_json(case).is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn expressions_need_opt_in() {
        let doc = |allow: bool| {
            format!(
                r#"{{"version": 1, "allow_expressions": {allow}, "resources": {{"l": {{"kind": "list",
                    "selector": "ul", "item_selector": "li",
                    "fields": {{"x": {{"selector": "b", "transforms": [{{"kind": "expr", "code": "v * 2"}}]}}}}}}}}}}"#
            )
        };
        assert!(matches!(
            RuleSet::from_json(&doc(false)),
            Err(RuleError::ExpressionsDisabled { .. })
        ));
        let rules = RuleSet::from_json(&doc(true)).expect("allowed");
        assert_eq!(rules.expression_fields(), vec![("l".to_string(), "x".to_string())]);
    }

    #[test]
    fn yaml_documents_load_too() {
        let rules = RuleSet::from_yaml(
            "version: 3\nresources:\n  teams:\n    kind: table\n    selector: table\n    columns: [name, points]\n",
        )
        .expect("yaml");
        assert_eq!(rules.version, 3);
        assert!(rules.resource("teams").is_ok());
    }
}
