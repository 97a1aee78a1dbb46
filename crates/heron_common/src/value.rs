use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use serde_json::Value as JsonValue;

/// Declared kind of a table column. Drives comparator and writer dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Int,
    Int64,
    Float,
    String,
    StringList,
    Int64List,
    Json,
}

impl ColumnKind {
    /// Kinds that sort through the permissive numeric comparison.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Int | ColumnKind::Int64 | ColumnKind::Float)
    }

    /// List kinds have no defined sort order.
    pub fn is_list(&self) -> bool {
        matches!(self, ColumnKind::StringList | ColumnKind::Int64List)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnKind::Int => "int",
            ColumnKind::Int64 => "int64",
            ColumnKind::Float => "float",
            ColumnKind::String => "string",
            ColumnKind::StringList => "stringlist",
            ColumnKind::Int64List => "int64list",
            ColumnKind::Json => "json",
        };
        write!(f, "{}", s)
    }
}

/// A single cell value. Tagged variant instead of boxed trait objects so
/// the hot numeric paths stay allocation-free.
///
/// Serializes untagged: `Int(0)` renders as `0` on the wire, lists as
/// plain JSON arrays. Integral floats render without a fraction so
/// counters read as plain integers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    StringList(Vec<String>),
    IntList(Vec<i64>),
    Json(JsonValue),
}

impl Value {
    /// Permissive numeric coercion used by the sort comparator and the
    /// stats projections. Strings parse when they look like numbers;
    /// anything without a numeric reading is 0.
    pub fn to_float(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Str(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            Value::Json(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// String rendering for sort keys and stats group keys.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::StringList(list) => list.join(","),
            Value::IntList(list) => {
                let parts: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                parts.join(",")
            }
            Value::Json(v) => v.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// List membership test used by the contact auth check and the list
    /// filter operators. Non-list values never contain anything.
    pub fn contains_entry(&self, needle: &Value) -> bool {
        match self {
            Value::StringList(list) => match needle {
                Value::Str(s) => list.iter().any(|e| e == s),
                other => {
                    let text = other.to_text();
                    list.iter().any(|e| *e == text)
                }
            },
            Value::IntList(list) => match needle {
                Value::Int(v) => list.contains(v),
                Value::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|v| list.contains(&v))
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }

    /// Empty value for a column kind, used to pad short remote rows.
    pub fn empty(kind: ColumnKind) -> Value {
        match kind {
            ColumnKind::Int | ColumnKind::Int64 => Value::Int(0),
            ColumnKind::Float => Value::Float(0.0),
            ColumnKind::String => Value::Str(String::new()),
            ColumnKind::StringList => Value::StringList(Vec::new()),
            ColumnKind::Int64List => Value::IntList(Vec::new()),
            ColumnKind::Json => Value::Json(JsonValue::Null),
        }
    }

    /// Decode a raw JSON cell from a remote peer into the declared
    /// column kind. Mismatched cells degrade to the kind's empty value
    /// rather than failing the whole row.
    pub fn from_json(kind: ColumnKind, raw: JsonValue) -> Value {
        match kind {
            ColumnKind::Int | ColumnKind::Int64 => match raw {
                JsonValue::Number(n) => Value::Int(n.as_i64().unwrap_or_else(|| {
                    n.as_f64().map(|f| f as i64).unwrap_or(0)
                })),
                JsonValue::Bool(b) => Value::Int(i64::from(b)),
                JsonValue::String(s) => Value::Int(s.trim().parse().unwrap_or(0)),
                _ => Value::Int(0),
            },
            ColumnKind::Float => match raw {
                JsonValue::Number(n) => Value::Float(n.as_f64().unwrap_or(0.0)),
                JsonValue::String(s) => Value::Float(s.trim().parse().unwrap_or(0.0)),
                _ => Value::Float(0.0),
            },
            ColumnKind::String => match raw {
                JsonValue::String(s) => Value::Str(s),
                JsonValue::Null => Value::Str(String::new()),
                other => Value::Str(other.to_string()),
            },
            ColumnKind::StringList => match raw {
                JsonValue::Array(items) => Value::StringList(
                    items
                        .into_iter()
                        .map(|v| match v {
                            JsonValue::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect(),
                ),
                _ => Value::StringList(Vec::new()),
            },
            ColumnKind::Int64List => match raw {
                JsonValue::Array(items) => Value::IntList(
                    items
                        .into_iter()
                        .map(|v| v.as_i64().unwrap_or(0))
                        .collect(),
                ),
                _ => Value::IntList(Vec::new()),
            },
            ColumnKind::Json => Value::Json(raw),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => {
                // integral floats (counters, sums over ints) go out as
                // plain integers like the upstream sites emit them
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
                    serializer.serialize_i64(*v as i64)
                } else {
                    serializer.serialize_f64(*v)
                }
            }
            Value::Str(v) => serializer.serialize_str(v),
            Value::StringList(v) => v.serialize(serializer),
            Value::IntList(v) => v.serialize(serializer),
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

/// Compare two cell values under a declared column kind. Numeric kinds
/// coerce both sides; string and json kinds compare their text form
/// without case folding. List kinds have no order and compare equal so
/// a stable sort keeps the incoming order.
pub fn cmp_values(kind: ColumnKind, a: &Value, b: &Value) -> Ordering {
    if kind.is_numeric() {
        return a
            .to_float()
            .partial_cmp(&b.to_float())
            .unwrap_or(Ordering::Equal);
    }
    match kind {
        ColumnKind::String | ColumnKind::Json => a.to_text().cmp(&b.to_text()),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_float_coercions() {
        assert_eq!(Value::Int(3).to_float(), 3.0);
        assert_eq!(Value::Float(2.5).to_float(), 2.5);
        assert_eq!(Value::Str("1.5".into()).to_float(), 1.5);
        assert_eq!(Value::Str("nope".into()).to_float(), 0.0);
        assert_eq!(Value::StringList(vec!["a".into()]).to_float(), 0.0);
    }

    #[test]
    fn test_untagged_serialization() {
        assert_eq!(serde_json::to_string(&Value::Int(5)).unwrap(), "5");
        assert_eq!(serde_json::to_string(&Value::Float(2.0)).unwrap(), "2");
        assert_eq!(serde_json::to_string(&Value::Float(2.5)).unwrap(), "2.5");
        assert_eq!(
            serde_json::to_string(&Value::Str("a".into())).unwrap(),
            "\"a\""
        );
        assert_eq!(
            serde_json::to_string(&Value::StringList(vec!["x".into(), "y".into()])).unwrap(),
            "[\"x\",\"y\"]"
        );
        assert_eq!(
            serde_json::to_string(&Value::IntList(vec![1, 2])).unwrap(),
            "[1,2]"
        );
    }

    #[test]
    fn test_contains_entry() {
        let contacts = Value::StringList(vec!["alice".into(), "bob".into()]);
        assert!(contacts.contains_entry(&Value::Str("bob".into())));
        assert!(!contacts.contains_entry(&Value::Str("carol".into())));
        let ids = Value::IntList(vec![1, 2, 3]);
        assert!(ids.contains_entry(&Value::Int(2)));
        assert!(ids.contains_entry(&Value::Str("3".into())));
        assert!(!Value::Int(1).contains_entry(&Value::Int(1)));
    }

    #[test]
    fn test_cmp_values_numeric_cross_kind() {
        assert_eq!(
            cmp_values(ColumnKind::Float, &Value::Int(2), &Value::Float(2.0)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(ColumnKind::Int, &Value::Int(1), &Value::Int(2)),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(ColumnKind::Int, &Value::Str("10".into()), &Value::Int(9)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_cmp_values_lists_are_unordered() {
        let a = Value::StringList(vec!["b".into()]);
        let b = Value::StringList(vec!["a".into()]);
        assert_eq!(cmp_values(ColumnKind::StringList, &a, &b), Ordering::Equal);
    }

    #[test]
    fn test_from_json_per_kind() {
        assert_eq!(
            Value::from_json(ColumnKind::Int, serde_json::json!(4)),
            Value::Int(4)
        );
        assert_eq!(
            Value::from_json(ColumnKind::Float, serde_json::json!("2.5")),
            Value::Float(2.5)
        );
        assert_eq!(
            Value::from_json(ColumnKind::StringList, serde_json::json!(["a", 1])),
            Value::StringList(vec!["a".into(), "1".into()])
        );
        assert_eq!(
            Value::from_json(ColumnKind::String, serde_json::json!(null)),
            Value::Str(String::new())
        );
    }
}
