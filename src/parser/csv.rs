use anyhow::{anyhow, Result};
use chrono::DateTime;
use chrono_tz::Tz;
use rustc_hash::FxHashMap;

use crate::model::{TypeCode, Value};

use super::datetime::{from_unix_float, parse_datetime_str, ZERO_TIME_UNIX_SECONDS};
use super::{Metric, NewKeyScan, RecordParser};

/// CSV parser driven by an explicit column list.
///
/// One message carries one record; fields may be quoted with `"` and use
/// doubled-quote escapes. Values are typed lazily by the accessors.
pub struct CsvParser {
    schema: Vec<String>,
    delimiter: u8,
    timezone: Tz,
    time_unit: f64,
    fields: Vec<String>,
}

impl CsvParser {
    pub fn new(schema: Vec<String>, delimiter: u8, timezone: Tz, time_unit: f64) -> Self {
        Self {
            schema,
            delimiter,
            timezone,
            time_unit,
            fields: Vec::new(),
        }
    }
}

impl RecordParser for CsvParser {
    fn parse<'a>(&'a mut self, bytes: &'a [u8]) -> Result<Box<dyn Metric + Send + Sync + 'a>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(bytes);
        let mut record = csv::StringRecord::new();
        if !reader.read_record(&mut record)? {
            return Err(anyhow!("empty CSV record"));
        }
        self.fields.clear();
        self.fields
            .extend(record.iter().map(|f| f.to_owned()));

        let mut by_name = FxHashMap::default();
        for (i, name) in self.schema.iter().enumerate() {
            if let Some(field) = self.fields.get(i) {
                by_name.insert(name.as_str(), field.as_str());
            }
        }
        Ok(Box::new(CsvMetric {
            by_name,
            timezone: self.timezone,
            time_unit: self.time_unit,
        }))
    }
}

struct CsvMetric<'a> {
    by_name: FxHashMap<&'a str, &'a str>,
    timezone: Tz,
    time_unit: f64,
}

impl CsvMetric<'_> {
    /// An absent or empty field counts as a miss; a non-empty field that
    /// fails to parse is a type mismatch.
    fn field(&self, key: &str) -> Option<&str> {
        self.by_name
            .get(key)
            .copied()
            .filter(|f| !f.trim().is_empty())
    }

    fn datetime(&self, key: &str) -> Option<DateTime<chrono::Utc>> {
        let raw = self.field(key)?;
        if let Ok(num) = raw.trim().parse::<f64>() {
            return from_unix_float(num * self.time_unit, 1.0);
        }
        parse_datetime_str(raw, self.timezone)
    }
}

impl Metric for CsvMetric<'_> {
    fn get_bool(&self, key: &str, nullable: bool) -> Value {
        match self.field(key).map(str::trim) {
            None => miss(nullable, Value::Bool(false)),
            Some("true") | Some("1") => Value::Bool(true),
            Some("false") | Some("0") => Value::Bool(false),
            Some(_) => Value::Null,
        }
    }

    fn get_int64(&self, key: &str, nullable: bool) -> Value {
        match self.field(key).map(str::trim) {
            None => miss(nullable, Value::Int64(0)),
            Some(f) => match f
                .parse::<i64>()
                .ok()
                .or_else(|| f.parse::<f64>().ok().map(|v| v as i64))
            {
                Some(v) => Value::Int64(v),
                None => Value::Null,
            },
        }
    }

    fn get_float(&self, key: &str, nullable: bool) -> Value {
        match self.field(key).map(str::trim) {
            None => miss(nullable, Value::Float64(0.0)),
            Some(f) => match f.parse::<f64>() {
                Ok(v) => Value::Float64(v),
                Err(_) => Value::Null,
            },
        }
    }

    fn get_string(&self, key: &str, nullable: bool) -> Value {
        match self.by_name.get(key) {
            Some(f) => Value::String((*f).to_owned()),
            None => miss(nullable, Value::String(String::new())),
        }
    }

    fn get_date(&self, key: &str, nullable: bool) -> Value {
        match self.field(key) {
            None => miss(nullable, Value::DateTime(DateTime::UNIX_EPOCH)),
            Some(_) => match self.datetime(key) {
                Some(dt) => Value::DateTime(
                    dt.date_naive()
                        .and_hms_opt(0, 0, 0)
                        .map(|n| n.and_utc())
                        .unwrap_or(dt),
                ),
                None => Value::Null,
            },
        }
    }

    fn get_date_time(&self, key: &str, nullable: bool) -> Value {
        match self.field(key) {
            None => miss(nullable, Value::DateTime(DateTime::UNIX_EPOCH)),
            Some(_) => match self.datetime(key) {
                Some(dt) => Value::DateTime(dt),
                None => Value::Null,
            },
        }
    }

    fn get_date_time64(&self, key: &str, nullable: bool) -> Value {
        self.get_date_time(key, nullable)
    }

    fn get_elastic_date_time(&self, key: &str, nullable: bool) -> Value {
        match self.field(key) {
            None => miss(nullable, Value::Int64(ZERO_TIME_UNIX_SECONDS)),
            Some(_) => match self.datetime(key) {
                Some(dt) => Value::Int64(dt.timestamp()),
                None => Value::Null,
            },
        }
    }

    fn get_array(&self, key: &str, typ: TypeCode) -> Value {
        let items: Vec<&str> = match self.field(key).map(str::trim) {
            Some(raw) if raw.starts_with('[') && raw.ends_with(']') => {
                let body = &raw[1..raw.len() - 1];
                if body.trim().is_empty() {
                    Vec::new()
                } else {
                    body.split(',').map(str::trim).collect()
                }
            }
            _ => Vec::new(),
        };
        match typ {
            TypeCode::Int64 => {
                Value::IntArray(items.iter().filter_map(|s| s.parse().ok()).collect())
            }
            TypeCode::Float64 => {
                Value::FloatArray(items.iter().filter_map(|s| s.parse().ok()).collect())
            }
            _ => Value::StringArray(items.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn get_object(&self, key: &str, nullable: bool) -> Value {
        match self.field(key) {
            Some(f) => Value::Object(f.to_owned()),
            None => miss(nullable, Value::Object("{}".to_owned())),
        }
    }

    fn get_new_keys(&self, _scan: &mut NewKeyScan<'_>, _partition: i32, _offset: i64) -> bool {
        // the column list is the schema; CSV cannot introduce keys
        false
    }
}

fn miss(nullable: bool, zero: Value) -> Value {
    if nullable {
        Value::Null
    } else {
        zero
    }
}
