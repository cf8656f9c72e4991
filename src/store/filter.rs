//! Typed record filters rendered to the PocketBase filter syntax.

use serde_json::Value;
use std::fmt;

/// A filter over record fields.
///
/// `Eq` renders as `field = "value"`, `Contains` as `field ~ "value"`
/// (membership for relation lists, substring for text), and the combinators
/// as `||` / `&&` groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Contains(String, String),
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Self::Eq(field.to_string(), value.into())
    }

    pub fn contains(field: &str, value: impl Into<String>) -> Self {
        Self::Contains(field.to_string(), value.into())
    }

    /// Match any record whose `id` is one of `ids`.
    pub fn any_id<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::Or(ids.into_iter().map(|id| Self::eq("id", id)).collect())
    }

    /// Evaluate the filter against a JSON record.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Self::Eq(field, expected) => record
                .get(field)
                .is_some_and(|value| scalar_eq(value, expected)),
            Self::Contains(field, needle) => match record.get(field) {
                Some(Value::Array(items)) => items.iter().any(|item| scalar_eq(item, needle)),
                Some(Value::String(text)) => text.contains(needle.as_str()),
                _ => false,
            },
            Self::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Self::And(filters) => filters.iter().all(|f| f.matches(record)),
        }
    }
}

fn scalar_eq(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        Value::Null => expected.is_empty(),
        _ => false,
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(field, value) => write!(f, "{} = {}", field, quote(value)),
            Self::Contains(field, value) => write!(f, "{} ~ {}", field, quote(value)),
            Self::Or(filters) | Self::And(filters) => {
                let joiner = if matches!(self, Self::Or(_)) { " || " } else { " && " };
                let parts: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
                if parts.len() == 1 {
                    write!(f, "{}", parts[0])
                } else {
                    write!(f, "({})", parts.join(joiner))
                }
            }
        }
    }
}
