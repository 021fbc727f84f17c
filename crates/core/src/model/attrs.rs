//! Opaque attribute bags.
//!
//! Raw store documents are converted into [`AttrMap`] once, at the
//! normalization boundary. Everything downstream works on the typed
//! [`Record`](crate::model::record::Record) and only reaches into a bag for
//! drill-down lookups.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type AttrMap = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AttrValue>),
    Bag(AttrMap),
}

impl AttrValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.trim().is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Bag(map) => map.is_empty(),
            Self::Bool(_) | Self::Number(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numbers, and strings that parse as numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bag(&self) -> Option<&AttrMap> {
        match self {
            Self::Bag(map) => Some(map),
            _ => None,
        }
    }

    /// Scalars render as text; bags and lists do not count as scalars.
    pub fn scalar_text(&self) -> Option<String> {
        match self {
            Self::Bool(_) | Self::Number(_) | Self::String(_) => Some(self.to_string()),
            _ => None,
        }
    }

    pub fn into_bag(self) -> Option<AttrMap> {
        match self {
            Self::Bag(map) => Some(map),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Bag(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::String(s) => f.write_str(s),
            Self::List(items) => {
                let joined = items
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                f.write_str(&joined)
            }
            Self::Bag(_) => {
                let rendered = serde_json::to_string(self).unwrap_or_default();
                f.write_str(&rendered)
            }
        }
    }
}

/// Integral values print without a fractional part so epoch counters and
/// status codes read naturally.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Resolve `path` inside `map`, treating every `.` either as part of a
/// literal key or as a nesting separator. Literal keys win, so
/// `{"service.name": "a", "service": {"name": "b"}}` resolves to `a`.
pub fn lookup<'a>(map: &'a AttrMap, path: &str) -> Option<&'a AttrValue> {
    if path.is_empty() {
        return None;
    }
    if let Some(v) = map.get(path)
        && !matches!(v, AttrValue::Null)
    {
        return Some(v);
    }

    for (idx, _) in path.match_indices('.') {
        let (head, rest) = (&path[..idx], &path[idx + 1..]);
        if let Some(AttrValue::Bag(inner)) = map.get(head)
            && let Some(found) = lookup(inner, rest)
        {
            return Some(found);
        }
    }
    None
}

/// Flatten nested bags into dotted keys, in key order. Lists and scalars
/// are leaves.
pub fn flatten(map: &AttrMap) -> Vec<(String, &AttrValue)> {
    let mut out = Vec::new();
    flatten_into(map, "", &mut out);
    out
}

fn flatten_into<'a>(map: &'a AttrMap, prefix: &str, out: &mut Vec<(String, &'a AttrValue)>) {
    for (key, value) in map {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            AttrValue::Bag(inner) if !inner.is_empty() => flatten_into(inner, &full, out),
            _ => out.push((full, value)),
        }
    }
}
