use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// A single projected cell.
///
/// Rows are dynamically typed because the column layout is discovered from
/// `system.columns` at task start (and may grow at runtime); a static row
/// struct cannot represent that.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    /// Millisecond precision is preserved end to end.
    DateTime(DateTime<Utc>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
    /// Raw JSON text for `Object('json')` columns.
    Object(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Mirrors the zero-value check used when resolving the db-key: a
    /// missing or zero field falls back to the base database.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int64(v) => *v == 0,
            Value::Float64(v) => *v == 0.0,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Float64(v) => Some(*v as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Render the value as a ClickHouse SQL literal for a `VALUES` tuple.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Float64(v) => {
                if v.is_finite() {
                    v.to_string()
                } else if v.is_nan() {
                    "nan".to_owned()
                } else if *v > 0.0 {
                    "inf".to_owned()
                } else {
                    "-inf".to_owned()
                }
            }
            Value::String(s) => quote_sql(s),
            Value::DateTime(dt) => {
                format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
            }
            Value::IntArray(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                format!("[{}]", parts.join(","))
            }
            Value::FloatArray(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                format!("[{}]", parts.join(","))
            }
            Value::StringArray(items) => {
                let parts: Vec<String> = items.iter().map(|s| quote_sql(s)).collect();
                format!("[{}]", parts.join(","))
            }
            Value::Object(raw) => quote_sql(raw),
        }
    }
}

fn quote_sql(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

impl fmt::Display for Value {
    /// Plain rendering used for db-key substitution and sorting-key hashes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::DateTime(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Object(raw) => f.write_str(raw),
            Value::IntArray(items) => write!(f, "{items:?}"),
            Value::FloatArray(items) => write!(f, "{items:?}"),
            Value::StringArray(items) => write!(f, "{items:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn string_literal_escaping() {
        assert_eq!(Value::String("plain".into()).sql_literal(), "'plain'");
        assert_eq!(
            Value::String("it's a \\ path".into()).sql_literal(),
            "'it\\'s a \\\\ path'"
        );
    }

    #[test]
    fn datetime_literal_keeps_milliseconds() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(
            Value::DateTime(dt).sql_literal(),
            "'2024-01-02 03:04:05.123'"
        );
    }

    #[test]
    fn array_literals() {
        assert_eq!(Value::IntArray(vec![1, 2, 3]).sql_literal(), "[1,2,3]");
        assert_eq!(
            Value::StringArray(vec!["aa".into(), "b'b".into()]).sql_literal(),
            "['aa','b\\'b']"
        );
        assert_eq!(Value::FloatArray(vec![]).sql_literal(), "[]");
    }

    #[test]
    fn zero_values() {
        assert!(Value::Null.is_zero());
        assert!(Value::Int64(0).is_zero());
        assert!(Value::String(String::new()).is_zero());
        assert!(!Value::Int64(7).is_zero());
        assert!(!Value::IntArray(vec![]).is_zero());
    }
}
