use anyhow::{anyhow, Result};
use chrono::DateTime;
use chrono_tz::Tz;
use serde_json::{Map, Value as Json};

use crate::model::{TypeCode, Value};

use super::datetime::{from_unix_float, parse_datetime_str, ZERO_TIME_UNIX_SECONDS};
use super::{Metric, NewKeyScan, RecordParser};

/// JSON parser backing both flavors: "fastjson" resolves field names
/// literally against the top level, "gjson" resolves dotted paths into
/// nested objects (`\.` escapes a literal dot).
///
/// The parsed document is kept on the parser so consecutive records reuse
/// its allocation; the metric borrows it.
pub struct JsonParser {
    timezone: Tz,
    time_unit: f64,
    dotted: bool,
    doc: Json,
}

impl JsonParser {
    pub fn new(timezone: Tz, time_unit: f64, dotted: bool) -> Self {
        Self {
            timezone,
            time_unit,
            dotted,
            doc: Json::Null,
        }
    }
}

impl RecordParser for JsonParser {
    fn parse<'a>(&'a mut self, bytes: &'a [u8]) -> Result<Box<dyn Metric + Send + Sync + 'a>> {
        self.doc = serde_json::from_slice(bytes)?;
        let obj = self
            .doc
            .as_object()
            .ok_or_else(|| anyhow!("record is not a JSON object"))?;
        Ok(Box::new(JsonMetric {
            obj,
            timezone: self.timezone,
            time_unit: self.time_unit,
            dotted: self.dotted,
        }))
    }
}

struct JsonMetric<'a> {
    obj: &'a Map<String, Json>,
    timezone: Tz,
    time_unit: f64,
    dotted: bool,
}

impl JsonMetric<'_> {
    fn lookup(&self, key: &str) -> Option<&Json> {
        if !self.dotted {
            return self.obj.get(key);
        }
        let mut segments = split_path(key).into_iter();
        let mut cur = self.obj.get(&segments.next()?)?;
        for seg in segments {
            cur = cur.as_object()?.get(&seg)?;
        }
        Some(cur)
    }

    fn datetime(&self, key: &str) -> Option<DateTime<chrono::Utc>> {
        match self.lookup(key)? {
            Json::Number(n) => from_unix_float(n.as_f64()?, self.time_unit),
            Json::String(s) => parse_datetime_str(s, self.timezone),
            _ => None,
        }
    }
}

impl Metric for JsonMetric<'_> {
    fn get_bool(&self, key: &str, nullable: bool) -> Value {
        match self.lookup(key) {
            None => miss(nullable, Value::Bool(false)),
            Some(v) => match v.as_bool() {
                Some(b) => Value::Bool(b),
                // present but untypable: null, dropped on non-nullable dims
                None => Value::Null,
            },
        }
    }

    fn get_int64(&self, key: &str, nullable: bool) -> Value {
        match self.lookup(key) {
            None => miss(nullable, Value::Int64(0)),
            Some(v) => match number_i64(v) {
                Some(n) => Value::Int64(n),
                None => Value::Null,
            },
        }
    }

    fn get_float(&self, key: &str, nullable: bool) -> Value {
        match self.lookup(key) {
            None => miss(nullable, Value::Float64(0.0)),
            Some(v) => match v.as_f64() {
                Some(f) => Value::Float64(f),
                None => Value::Null,
            },
        }
    }

    fn get_string(&self, key: &str, nullable: bool) -> Value {
        match self.lookup(key) {
            None => miss(nullable, Value::String(String::new())),
            Some(Json::String(s)) => Value::String(s.clone()),
            Some(Json::Null) => Value::Null,
            // scalars and compounds render as their JSON text
            Some(other) => Value::String(other.to_string()),
        }
    }

    fn get_date(&self, key: &str, nullable: bool) -> Value {
        match self.lookup(key) {
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
        match self.lookup(key) {
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
        match self.lookup(key) {
            None => miss(nullable, Value::Int64(ZERO_TIME_UNIX_SECONDS)),
            Some(_) => match self.datetime(key) {
                Some(dt) => Value::Int64(dt.timestamp()),
                None => Value::Null,
            },
        }
    }

    fn get_array(&self, key: &str, typ: TypeCode) -> Value {
        let items = self.lookup(key).and_then(Json::as_array);
        match typ {
            TypeCode::Int64 => Value::IntArray(
                items
                    .map(|a| a.iter().filter_map(number_i64).collect())
                    .unwrap_or_default(),
            ),
            TypeCode::Float64 => Value::FloatArray(
                items
                    .map(|a| a.iter().filter_map(Json::as_f64).collect())
                    .unwrap_or_default(),
            ),
            _ => Value::StringArray(
                items
                    .map(|a| {
                        a.iter()
                            .map(|v| match v {
                                Json::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
        }
    }

    fn get_object(&self, key: &str, nullable: bool) -> Value {
        match self.lookup(key) {
            None => miss(nullable, Value::Object("{}".to_owned())),
            Some(v @ Json::Object(_)) => Value::Object(v.to_string()),
            Some(_) => Value::Null,
        }
    }

    fn get_new_keys(&self, scan: &mut NewKeyScan<'_>, partition: i32, offset: i64) -> bool {
        let mut found = false;
        for (key, val) in self.obj {
            if !scan.accepts(key) {
                continue;
            }
            match infer_type(val, self.timezone) {
                Some(code) => {
                    scan.new.insert(key.clone(), code);
                    found = true;
                }
                None => {
                    if scan.warn.insert(key.clone()) {
                        log::warn!(
                            "unsupported value for new key {key} (partition {partition}, offset {offset})"
                        );
                    }
                }
            }
        }
        found
    }
}

fn miss(nullable: bool, zero: Value) -> Value {
    if nullable {
        Value::Null
    } else {
        zero
    }
}

fn number_i64(v: &Json) -> Option<i64> {
    let n = v.as_number()?;
    n.as_i64()
        .or_else(|| n.as_u64().map(|u| u as i64))
        .or_else(|| n.as_f64().map(|f| f as i64))
}

fn infer_type(val: &Json, tz: Tz) -> Option<TypeCode> {
    match val {
        Json::Bool(_) => Some(TypeCode::Bool),
        Json::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(TypeCode::Int64)
            } else {
                Some(TypeCode::Float64)
            }
        }
        Json::String(s) => {
            if parse_datetime_str(s, tz).is_some() {
                Some(TypeCode::DateTime)
            } else {
                Some(TypeCode::String)
            }
        }
        Json::Object(_) => Some(TypeCode::Object),
        // null and array values cannot become columns
        Json::Null | Json::Array(_) => None,
    }
}

fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut cur = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            '.' => segments.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    segments.push(cur);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParserPool;
    use std::collections::BTreeMap;
    use rustc_hash::FxHashSet;

    const SAMPLE: &[u8] = br#"{
        "its": 1536813227,
        "percent": 0.11,
        "channel": "ws",
        "success": 0,
        "date1": "2019-12-16",
        "time_sec_rfc3339": "2019-12-16T12:10:30Z",
        "time_ms_rfc3339": "2019-12-16T12:10:30.123+08:00",
        "time_sec_clickhouse": "2019-12-16 12:10:30",
        "time_ms_clickhouse": "2019-12-16 12:10:30.123",
        "array_int": [1, 2, 3],
        "array_float": [1.1, 2.2, 3.3],
        "array_string": ["aa", "bb", "cc"],
        "array_empty": [],
        "bool_true": true,
        "bool_false": false,
        "mp": {"i": [1, 2, 3], "s": "nested"}
    }"#;

    fn pool(parser: &str) -> ParserPool {
        ParserPool::new(parser, &[], ",", "UTC", 1.0).unwrap()
    }

    #[test]
    fn typed_accessors() {
        let pool = pool("fastjson");
        let mut parser = pool.get();
        let metric = parser.parse(SAMPLE).unwrap();

        assert_eq!(metric.get_int64("its", false), Value::Int64(1536813227));
        assert_eq!(metric.get_float("percent", false), Value::Float64(0.11));
        assert_eq!(metric.get_string("channel", false), Value::String("ws".into()));
        assert_eq!(metric.get_bool("bool_true", false), Value::Bool(true));
        assert_eq!(metric.get_bool("bool_false", false), Value::Bool(false));

        // misses: zero when not nullable, null when nullable
        assert_eq!(metric.get_int64("missing", false), Value::Int64(0));
        assert_eq!(metric.get_int64("missing", true), Value::Null);
        assert_eq!(metric.get_string("missing", false), Value::String(String::new()));
        assert_eq!(metric.get_string("missing", true), Value::Null);

        // present but mistyped: null regardless of nullability
        assert_eq!(metric.get_bool("its", false), Value::Null);
        assert_eq!(metric.get_int64("channel", false), Value::Null);
    }

    #[test]
    fn datetime_accessors() {
        let pool = pool("fastjson");
        let mut parser = pool.get();
        let metric = parser.parse(SAMPLE).unwrap();

        let expect_sec = 1_576_498_230i64;
        for key in ["time_sec_rfc3339", "time_sec_clickhouse"] {
            match metric.get_date_time(key, false) {
                Value::DateTime(dt) => assert_eq!(dt.timestamp(), expect_sec, "{key}"),
                other => panic!("{key}: {other:?}"),
            }
        }
        match metric.get_date_time64("time_ms_clickhouse", false) {
            Value::DateTime(dt) => {
                assert_eq!(dt.timestamp(), expect_sec);
                assert_eq!(dt.timestamp_subsec_millis(), 123);
            }
            other => panic!("{other:?}"),
        }
        match metric.get_date_time("time_ms_rfc3339", false) {
            Value::DateTime(dt) => assert_eq!(dt.timestamp(), expect_sec - 8 * 3600),
            other => panic!("{other:?}"),
        }
        match metric.get_date("date1", false) {
            Value::DateTime(dt) => assert_eq!(dt.to_rfc3339(), "2019-12-16T00:00:00+00:00"),
            other => panic!("{other:?}"),
        }
        // numeric timestamp scaled by time_unit
        assert_eq!(
            metric.get_elastic_date_time("its", false),
            Value::Int64(1536813227)
        );
        assert_eq!(
            metric.get_elastic_date_time("missing", false),
            Value::Int64(ZERO_TIME_UNIX_SECONDS)
        );
    }

    #[test]
    fn array_accessors() {
        let pool = pool("fastjson");
        let mut parser = pool.get();
        let metric = parser.parse(SAMPLE).unwrap();

        assert_eq!(
            metric.get_array("array_int", TypeCode::Int64),
            Value::IntArray(vec![1, 2, 3])
        );
        assert_eq!(
            metric.get_array("array_float", TypeCode::Float64),
            Value::FloatArray(vec![1.1, 2.2, 3.3])
        );
        assert_eq!(
            metric.get_array("array_string", TypeCode::String),
            Value::StringArray(vec!["aa".into(), "bb".into(), "cc".into()])
        );
        assert_eq!(
            metric.get_array("array_empty", TypeCode::Int64),
            Value::IntArray(vec![])
        );
    }

    #[test]
    fn object_accessor() {
        let pool = pool("fastjson");
        let mut parser = pool.get();
        let metric = parser.parse(SAMPLE).unwrap();
        match metric.get_object("mp", false) {
            Value::Object(raw) => {
                let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
                assert_eq!(parsed["s"], "nested");
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(metric.get_object("missing", true), Value::Null);
    }

    #[test]
    fn flavors_agree_on_top_level_keys() {
        let fast = pool("fastjson");
        let path = pool("gjson");
        let mut p1 = fast.get();
        let mut p2 = path.get();
        let m1 = p1.parse(SAMPLE).unwrap();
        let m2 = p2.parse(SAMPLE).unwrap();
        for key in ["its", "percent", "channel", "bool_true", "missing"] {
            assert_eq!(m1.get_string(key, true), m2.get_string(key, true), "{key}");
            assert_eq!(m1.get_int64(key, true), m2.get_int64(key, true), "{key}");
        }
    }

    #[test]
    fn dotted_paths_only_for_gjson() {
        let body = br#"{"mp": {"i": 7}, "a.b": 9}"#;
        let fast = pool("fastjson");
        let path = pool("gjson");
        let mut p1 = fast.get();
        let mut p2 = path.get();
        let m1 = p1.parse(body).unwrap();
        let m2 = p2.parse(body).unwrap();

        // navigation into nested objects
        assert_eq!(m2.get_int64("mp.i", false), Value::Int64(7));
        assert_eq!(m1.get_int64("mp.i", false), Value::Int64(0));
        // escaped dot addresses the literal key
        assert_eq!(m2.get_int64("a\\.b", false), Value::Int64(9));
        assert_eq!(m1.get_int64("a.b", false), Value::Int64(9));
    }

    #[test]
    fn new_key_scan() {
        let body = br#"{
            "a": 1, "b": "x",
            "c": 2.5,
            "d": null,
            "e": "2021-01-02 21:06:00",
            "f": true,
            "g": {"h": 1},
            "arr": [1]
        }"#;
        let pool = pool("fastjson");
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();

        let known: FxHashSet<String> = ["a", "b", ""].iter().map(|s| s.to_string()).collect();
        let mut new = BTreeMap::new();
        let mut warn = FxHashSet::default();
        let mut scan = NewKeyScan {
            known: &known,
            new: &mut new,
            warn: &mut warn,
            white: None,
            black: None,
        };
        assert!(metric.get_new_keys(&mut scan, 0, 42));
        assert_eq!(new.get("c"), Some(&TypeCode::Float64));
        assert_eq!(new.get("e"), Some(&TypeCode::DateTime));
        assert_eq!(new.get("f"), Some(&TypeCode::Bool));
        assert_eq!(new.get("g"), Some(&TypeCode::Object));
        assert!(!new.contains_key("a"));
        assert!(!new.contains_key("d"));
        assert!(warn.contains("d"));
        assert!(warn.contains("arr"));
    }

    #[test]
    fn new_key_scan_respects_filters() {
        let body = br#"{"keep_me": 1, "drop_me": 2, "other": 3}"#;
        let pool = pool("fastjson");
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();

        let known = FxHashSet::default();
        let mut new = BTreeMap::new();
        let mut warn = FxHashSet::default();
        let white = regex::Regex::new("^(keep|drop)").unwrap();
        let black = regex::Regex::new("^drop").unwrap();
        let mut scan = NewKeyScan {
            known: &known,
            new: &mut new,
            warn: &mut warn,
            white: Some(&white),
            black: Some(&black),
        };
        assert!(metric.get_new_keys(&mut scan, 0, 0));
        assert_eq!(new.len(), 1);
        assert!(new.contains_key("keep_me"));
    }

    #[test]
    fn non_object_record_is_an_error() {
        let pool = pool("fastjson");
        let mut parser = pool.get();
        assert!(parser.parse(b"[1,2,3]").is_err());
        assert!(parser.parse(b"not json").is_err());
    }
}
