//! Value transforms applied to raw cell text, in declared order.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    Trim,
    CollapseWs,
    ToNumber,
    ParseDate { formats: Vec<String> },
    /// Carried through the document model but never executed.
    Expr { code: String },
}

impl Transform {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "trim" => Some(Self::Trim),
            "collapse_ws" => Some(Self::CollapseWs),
            "to_number" => Some(Self::ToNumber),
            _ => None,
        }
    }

    pub fn is_expression(&self) -> bool {
        matches!(self, Self::Expr { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("{0:?} is not a number")]
    NotANumber(String),
    #[error("{value:?} matches none of the date formats {formats:?}")]
    NotADate { value: String, formats: Vec<String> },
    #[error("expression transforms are not executable")]
    ExpressionNotExecutable,
}

/// Locale-tolerant number parsing: no-break and digit-group spaces are dropped, a lone
/// comma is a decimal separator, commas next to a dot are thousands separators.
/// Integers are preferred over floats.
pub fn parse_number(text: &str) -> Result<Value, TransformError> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}' && *c != '_')
        .collect();
    let normalized = if compact.contains(',') {
        if compact.contains('.') {
            compact.replace(',', "")
        } else {
            compact.replace(',', ".")
        }
    } else {
        compact
    };
    if let Ok(i) = normalized.parse::<i64>() {
        return Ok(Value::Integer(i));
    }
    match normalized.parse::<f64>() {
        Ok(f) if f.is_finite() && normalized.chars().any(|c| c.is_ascii_digit()) => Ok(Value::Float(f)),
        _ => Err(TransformError::NotANumber(text.to_string())),
    }
}

fn parse_date(text: &str, formats: &[String]) -> Result<Value, TransformError> {
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .map(Value::Date)
        .ok_or_else(|| TransformError::NotADate {
            value: text.to_string(),
            formats: formats.to_vec(),
        })
}

fn apply_one(value: Value, transform: &Transform) -> Result<Value, TransformError> {
    if let Transform::Expr { .. } = transform {
        return Err(TransformError::ExpressionNotExecutable);
    }
    let Value::Text(text) = value else {
        return Ok(value);
    };
    match transform {
        Transform::Trim => Ok(Value::Text(text.trim().to_string())),
        Transform::CollapseWs => Ok(Value::Text(
            text.split_whitespace().collect::<Vec<_>>().join(" "),
        )),
        Transform::ToNumber if text.trim().is_empty() => Ok(Value::Null),
        Transform::ToNumber => parse_number(&text),
        Transform::ParseDate { .. } if text.trim().is_empty() => Ok(Value::Null),
        Transform::ParseDate { formats } => parse_date(&text, formats),
        Transform::Expr { .. } => Err(TransformError::ExpressionNotExecutable),
    }
}

/// Runs `transforms` over `raw`. Missing input and blank text come out as `Value::Null`.
pub fn apply_chain(raw: Option<String>, transforms: &[Transform]) -> Result<Value, TransformError> {
    let mut value = match raw {
        Some(text) => Value::Text(text),
        None => Value::Null,
    };
    for transform in transforms {
        value = apply_one(value, transform)?;
    }
    Ok(match value {
        Value::Text(text) if text.trim().is_empty() => Value::Null,
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_tolerate_locale_separators() {
        assert_eq!(parse_number("1 234").unwrap(), Value::Integer(1234));
        assert_eq!(parse_number("1\u{a0}520").unwrap(), Value::Integer(1520));
        assert_eq!(parse_number("3,5").unwrap(), Value::Float(3.5));
        assert_eq!(parse_number("1,234.5").unwrap(), Value::Float(1234.5));
        assert_eq!(parse_number("-42").unwrap(), Value::Integer(-42));
        assert!(parse_number("n/a").is_err());
        assert!(parse_number("inf").is_err());
    }

    #[test]
    fn chain_runs_in_declared_order() {
        let chain = [Transform::Trim, Transform::ToNumber];
        assert_eq!(apply_chain(Some("  17 ".into()), &chain).unwrap(), Value::Integer(17));

        let collapse = [Transform::CollapseWs];
        assert_eq!(
            apply_chain(Some(" Erika \n  Muster ".into()), &collapse).unwrap(),
            Value::Text("Erika Muster".into())
        );
    }

    #[test]
    fn dates_try_each_format() {
        let chain = [
            Transform::Trim,
            Transform::ParseDate {
                formats: vec!["%Y-%m-%d".into(), "%d.%m.%Y".into()],
            },
        ];
        let value = apply_chain(Some(" 14.03.2026".into()), &chain).unwrap();
        assert_eq!(value, Value::Date(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()));
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"2026-03-14\"");
        assert!(matches!(
            apply_chain(Some("someday".into()), &chain),
            Err(TransformError::NotADate { .. })
        ));
    }

    #[test]
    fn blanks_and_missing_values_become_null() {
        assert_eq!(apply_chain(None, &[Transform::ToNumber]).unwrap(), Value::Null);
        assert_eq!(apply_chain(Some("   ".into()), &[Transform::ToNumber]).unwrap(), Value::Null);
        assert_eq!(apply_chain(Some("  ".into()), &[]).unwrap(), Value::Null);
    }

    #[test]
    fn expressions_never_run() {
        let chain = [Transform::Expr { code: "value.upper()".into() }];
        assert_eq!(
            apply_chain(Some("x".into()), &chain),
            Err(TransformError::ExpressionNotExecutable)
        );
    }
}
