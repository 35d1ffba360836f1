//! Record parsers turning raw Kafka payloads into key-addressable
//! [`Metric`] views.
//!
//! Three families share one capability set: two JSON flavors ("fastjson"
//! resolves names literally, "gjson" resolves dotted paths into nested
//! objects) and a schema-driven CSV parser. Parsers are pooled per task;
//! a metric may borrow the parser's internal buffers, which the borrow
//! checker ties to the pool guard.

mod csv;
mod datetime;
mod json;

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use anyhow::{bail, Result};
use regex::Regex;
use rustc_hash::FxHashSet;

use crate::model::{ColumnWithType, TypeCode, Value};

pub use datetime::{from_unix_float, parse_datetime_str, ZERO_TIME_UNIX_SECONDS};

/// Read-only typed view over one parsed record.
///
/// Accessors take `(field, nullable)`: with `nullable == false` a missing
/// or mistyped field yields the type's zero value, otherwise
/// [`Value::Null`].
pub trait Metric {
    fn get_bool(&self, key: &str, nullable: bool) -> Value;
    fn get_int64(&self, key: &str, nullable: bool) -> Value;
    fn get_float(&self, key: &str, nullable: bool) -> Value;
    fn get_string(&self, key: &str, nullable: bool) -> Value;
    fn get_date(&self, key: &str, nullable: bool) -> Value;
    fn get_date_time(&self, key: &str, nullable: bool) -> Value;
    /// Millisecond-precision variant of [`Metric::get_date_time`].
    fn get_date_time64(&self, key: &str, nullable: bool) -> Value;
    /// Unix seconds as Int64; a missing non-nullable field yields the
    /// zero-time instant.
    fn get_elastic_date_time(&self, key: &str, nullable: bool) -> Value;
    fn get_array(&self, key: &str, typ: TypeCode) -> Value;
    fn get_object(&self, key: &str, nullable: bool) -> Value;

    /// Record top-level keys absent from `scan.known` into `scan.new`.
    /// Returns true iff at least one new key was added.
    fn get_new_keys(&self, scan: &mut NewKeyScan<'_>, partition: i32, offset: i64) -> bool;
}

/// Working set for dynamic-key detection, owned by the task per tenant.
pub struct NewKeyScan<'a> {
    pub known: &'a FxHashSet<String>,
    pub new: &'a mut BTreeMap<String, TypeCode>,
    pub warn: &'a mut FxHashSet<String>,
    pub white: Option<&'a Regex>,
    pub black: Option<&'a Regex>,
}

impl NewKeyScan<'_> {
    /// Whether a key survives the known-set and white/black filters.
    fn accepts(&self, key: &str) -> bool {
        if self.known.contains(key) || self.new.contains_key(key) {
            return false;
        }
        if let Some(white) = self.white {
            if !white.is_match(key) {
                return false;
            }
        }
        if let Some(black) = self.black {
            if black.is_match(key) {
                return false;
            }
        }
        true
    }
}

/// Project one record field according to a column definition.
pub fn get_value_by_type(metric: &dyn Metric, dim: &ColumnWithType) -> Value {
    let nullable = dim.typ.nullable;
    match dim.typ.code {
        TypeCode::Bool => metric.get_bool(&dim.source_name, nullable),
        TypeCode::Int64 => metric.get_int64(&dim.source_name, nullable),
        TypeCode::Float64 => metric.get_float(&dim.source_name, nullable),
        TypeCode::String => metric.get_string(&dim.source_name, nullable),
        TypeCode::DateTime => metric.get_date_time(&dim.source_name, nullable),
        TypeCode::Object => metric.get_object(&dim.source_name, nullable),
    }
}

/// Field path used to address a column's source field; the path-based
/// parser needs literal dots escaped.
pub fn get_source_name(parser: &str, name: &str) -> String {
    if parser == "gjson" {
        name.replace('.', "\\.")
    } else {
        name.to_owned()
    }
}

pub trait RecordParser: Send {
    fn parse<'a>(&'a mut self, bytes: &'a [u8]) -> Result<Box<dyn Metric + Send + Sync + 'a>>;
}

enum ParserKind {
    Fastjson,
    Gjson,
    Csv,
}

/// Per-task pool of reusable parsers.
pub struct ParserPool {
    kind: ParserKind,
    csv_format: Vec<String>,
    delimiter: u8,
    timezone: chrono_tz::Tz,
    time_unit: f64,
    pool: Mutex<Vec<Box<dyn RecordParser>>>,
}

impl ParserPool {
    pub fn new(
        parser: &str,
        csv_format: &[String],
        delimiter: &str,
        timezone: &str,
        time_unit: f64,
    ) -> Result<Self> {
        let kind = match parser {
            "fastjson" => ParserKind::Fastjson,
            "gjson" => ParserKind::Gjson,
            "csv" => ParserKind::Csv,
            other => bail!("unknown parser {other:?}"),
        };
        let timezone = if timezone.is_empty() {
            chrono_tz::UTC
        } else {
            timezone
                .parse()
                .map_err(|e| anyhow::anyhow!("bad timezone {timezone:?}: {e}"))?
        };
        Ok(Self {
            kind,
            csv_format: csv_format.to_vec(),
            delimiter: delimiter.as_bytes().first().copied().unwrap_or(b','),
            timezone,
            time_unit: if time_unit > 0.0 { time_unit } else { 1.0 },
            pool: Mutex::new(Vec::new()),
        })
    }

    /// Borrow a parser; it returns to the pool when the guard drops.
    pub fn get(&self) -> PooledParser<'_> {
        let parser = self.pool.lock().unwrap().pop();
        PooledParser {
            pool: self,
            parser: Some(parser.unwrap_or_else(|| self.make())),
        }
    }

    fn make(&self) -> Box<dyn RecordParser> {
        match self.kind {
            ParserKind::Fastjson => Box::new(json::JsonParser::new(
                self.timezone,
                self.time_unit,
                false,
            )),
            ParserKind::Gjson => Box::new(json::JsonParser::new(
                self.timezone,
                self.time_unit,
                true,
            )),
            ParserKind::Csv => Box::new(csv::CsvParser::new(
                self.csv_format.clone(),
                self.delimiter,
                self.timezone,
                self.time_unit,
            )),
        }
    }
}

pub struct PooledParser<'p> {
    pool: &'p ParserPool,
    parser: Option<Box<dyn RecordParser>>,
}

impl Deref for PooledParser<'_> {
    type Target = Box<dyn RecordParser>;

    fn deref(&self) -> &Self::Target {
        self.parser.as_ref().expect("parser present until drop")
    }
}

impl DerefMut for PooledParser<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.parser.as_mut().expect("parser present until drop")
    }
}

impl Drop for PooledParser<'_> {
    fn drop(&mut self) {
        if let Some(parser) = self.parser.take() {
            self.pool.lock_push(parser);
        }
    }
}

impl ParserPool {
    fn lock_push(&self, parser: Box<dyn RecordParser>) {
        self.pool.lock().unwrap().push(parser);
    }
}
