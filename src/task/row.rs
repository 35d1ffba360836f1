use log::warn;
use regex::Regex;
use xxhash_rust::xxh64::xxh64;

use crate::db::clickhouse::schema::SHARDING_KEY_COLUMN;
use crate::model::{ColumnWithType, InputMessage, Row, TypeCode, Value};
use crate::parser::{get_value_by_type, Metric};
use crate::util::substitute_db_key;

/// Resolve the tenant database for a record: substitute the db-key
/// column's value into the template, falling back to the base database
/// when the field is missing or zero.
pub fn resolve_db_key(
    metric: &dyn Metric,
    key_dim: Option<&ColumnWithType>,
    base_db: &str,
    template: &str,
) -> String {
    if let Some(dim) = key_dim {
        let val = get_value_by_type(metric, dim);
        if !val.is_zero() {
            return substitute_db_key(template, &dim.source_name, &val.to_string());
        }
    }
    base_db.to_owned()
}

/// Project a non-Prometheus record into a row following `dims`.
///
/// `__kafka*` columns are filled from message metadata and
/// `__shardingkey` with the hash of the sorting-key tuple. Returns `None`
/// when a non-nullable column would receive null (the record is dropped).
pub fn build_plain_row(
    metric: &dyn Metric,
    msg: &InputMessage,
    dims: &[ColumnWithType],
    sorting_keys: &[ColumnWithType],
    task_name: &str,
) -> Option<Row> {
    let sharding_val = if sorting_keys.is_empty() {
        0u64
    } else {
        let joined = sorting_keys
            .iter()
            .map(|dim| get_value_by_type(metric, dim).to_string())
            .collect::<Vec<_>>()
            .join(".");
        xxh64(joined.as_bytes(), 0)
    };

    let mut row = Row::with_capacity(dims.len());
    for dim in dims {
        if dim.name.starts_with("__kafka") {
            row.push(kafka_meta_value(&dim.name, msg));
        } else if dim.name == SHARDING_KEY_COLUMN {
            row.push(Value::Int64(sharding_val as i64));
        } else {
            let val = get_value_by_type(metric, dim);
            if dim.not_nullable() && val.is_null() {
                warn!(
                    "null value for non-nullable column {} (task {task_name}, topic {}, partition {}, offset {})",
                    dim.name, msg.topic, msg.partition, msg.offset
                );
                return None;
            }
            row.push(val);
        }
    }
    Some(row)
}

fn kafka_meta_value(name: &str, msg: &InputMessage) -> Value {
    if name.ends_with("_topic") {
        Value::String(msg.topic.clone())
    } else if name.ends_with("_partition") {
        Value::Int64(msg.partition as i64)
    } else if name.ends_with("_offset") {
        Value::Int64(msg.offset)
    } else if name.ends_with("_key") {
        Value::String(String::from_utf8_lossy(&msg.key).into_owned())
    } else if name.ends_with("_timestamp") {
        match msg.timestamp {
            Some(ts) => Value::DateTime(ts),
            None => Value::Null,
        }
    } else {
        Value::Null
    }
}

/// Everything the Prometheus projection needs besides the metric itself.
pub struct SeriesRowLayout<'a> {
    pub dims: &'a [ColumnWithType],
    /// Index of the series id column; dims beyond it belong to the
    /// series table.
    pub idx_ser_id: usize,
    pub num_dims: usize,
    /// Label holding the metric name, excluded from the labels JSON.
    pub name_key: &'a str,
    pub labels_blacklist: Option<&'a Regex>,
    /// With non-nullable dynamic columns, empty strings are not real
    /// labels.
    pub skip_empty_labels: bool,
}

/// Project a Prometheus-flavored record.
///
/// The row is `[metric dims..., series_id]`; when `new_series` is set it
/// extends to `[..., mgmt_id, labels, label strings...]` so the writer
/// can feed the series table. The labels JSON deliberately excludes the
/// name key and `le` so it can group histogram buckets.
pub fn build_series_row(
    metric: &dyn Metric,
    layout: &SeriesRowLayout<'_>,
    sid: i64,
    mid: i64,
    new_series: bool,
) -> Row {
    let mut row = Row::with_capacity(if new_series {
        layout.num_dims + 2
    } else {
        layout.idx_ser_id + 1
    });
    for dim in &layout.dims[..layout.idx_ser_id] {
        row.push(get_value_by_type(metric, dim));
    }
    row.push(Value::Int64(sid));
    if !new_series {
        return row;
    }

    row.push(Value::Int64(mid));
    row.push(Value::Null); // labels, patched below
    let mut labels = Vec::new();
    for dim in &layout.dims[layout.idx_ser_id + 3..layout.num_dims] {
        let val = get_value_by_type(metric, dim);
        if let Value::String(s) = &val {
            let keep = dim.typ.code == TypeCode::String
                && dim.name != layout.name_key
                && dim.name != "le"
                && layout
                    .labels_blacklist
                    .map_or(true, |re| !re.is_match(&dim.name))
                && !(layout.skip_empty_labels && s.is_empty());
            if keep {
                labels.push(format!(
                    "{}: {}",
                    serde_json::to_string(&dim.name).unwrap_or_default(),
                    serde_json::to_string(s).unwrap_or_default()
                ));
            }
        }
        row.push(val);
    }
    row[layout.idx_ser_id + 2] = Value::String(format!("{{{}}}", labels.join(", ")));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnType;
    use crate::parser::ParserPool;

    fn msg(value: &[u8]) -> InputMessage {
        InputMessage {
            topic: "app_logs".into(),
            partition: 3,
            offset: 42,
            key: b"k1".to_vec(),
            value: value.to_vec(),
            timestamp: None,
        }
    }

    fn col(name: &str, code: TypeCode) -> ColumnWithType {
        ColumnWithType::new(name, ColumnType::plain(code), name)
    }

    fn nullable_col(name: &str, code: TypeCode) -> ColumnWithType {
        ColumnWithType::new(
            name,
            ColumnType {
                code,
                nullable: true,
            },
            name,
        )
    }

    #[test]
    fn log_pipeline_row_binds_in_dim_order() {
        // schema of the log-pipeline scenario
        let dims = vec![
            col("level", TypeCode::String),
            col("timestamp", TypeCode::DateTime),
            col("message", TypeCode::String),
            col("path", TypeCode::String),
            col("row_number", TypeCode::Int64),
            col("ip", TypeCode::String),
            col("hostname", TypeCode::String),
            col("region", TypeCode::String),
        ];
        let body = br#"{"level":"INFO","timestamp":"2024-01-02T03:04:05.123Z","message":"hi",
            "path":"/var/log/a.log","row_number":7,"ip":"10.0.0.1","hostname":"h1","region":"US"}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();
        let row = build_plain_row(&*metric, &msg(body), &dims, &[], "t").unwrap();

        assert_eq!(row.len(), 8);
        assert_eq!(row[0], Value::String("INFO".into()));
        match &row[1] {
            Value::DateTime(dt) => {
                assert_eq!(dt.timestamp_subsec_millis(), 123);
                assert_eq!(dt.to_rfc3339(), "2024-01-02T03:04:05.123+00:00");
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(row[2], Value::String("hi".into()));
        assert_eq!(row[4], Value::Int64(7));
        assert_eq!(row[7], Value::String("US".into()));
    }

    #[test]
    fn kafka_metadata_columns() {
        let dims = vec![
            col("__kafka_topic", TypeCode::String),
            col("__kafka_partition", TypeCode::Int64),
            col("__kafka_offset", TypeCode::Int64),
            col("__kafka_key", TypeCode::String),
        ];
        let body = br#"{"x":1}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();
        let row = build_plain_row(&*metric, &msg(body), &dims, &[], "t").unwrap();
        assert_eq!(row[0], Value::String("app_logs".into()));
        assert_eq!(row[1], Value::Int64(3));
        assert_eq!(row[2], Value::Int64(42));
        assert_eq!(row[3], Value::String("k1".into()));
    }

    #[test]
    fn null_on_non_nullable_drops_the_row() {
        let body = br#"{"note":"n","ts":"garbage"}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();

        // a missing non-nullable String projects its zero value, kept
        let dims = vec![col("level", TypeCode::String), nullable_col("note", TypeCode::String)];
        assert!(build_plain_row(&*metric, &msg(body), &dims, &[], "t").is_some());

        // an unparseable timestamp on a non-nullable column drops the row
        let dims = vec![col("ts", TypeCode::DateTime)];
        assert!(build_plain_row(&*metric, &msg(body), &dims, &[], "t").is_none());

        // the same mismatch on a nullable column keeps the row with null
        let dims = vec![nullable_col("ts", TypeCode::DateTime)];
        let row = build_plain_row(&*metric, &msg(body), &dims, &[], "t").unwrap();
        assert_eq!(row[0], Value::Null);
    }

    #[test]
    fn sharding_key_column_hashes_sorting_tuple() {
        let dims = vec![col(SHARDING_KEY_COLUMN, TypeCode::Int64)];
        let sorting = vec![col("hostname", TypeCode::String), col("row_number", TypeCode::Int64)];
        let body = br#"{"hostname":"h1","row_number":7}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();
        let row = build_plain_row(&*metric, &msg(body), &dims, &sorting, "t").unwrap();
        assert_eq!(row[0], Value::Int64(xxh64(b"h1.7", 0) as i64));
    }

    fn prom_layout(dims: &[ColumnWithType]) -> SeriesRowLayout<'_> {
        SeriesRowLayout {
            dims,
            idx_ser_id: 2,
            num_dims: dims.len(),
            name_key: "__name__",
            labels_blacklist: None,
            skip_empty_labels: false,
        }
    }

    fn prom_dims() -> Vec<ColumnWithType> {
        vec![
            col("timestamp", TypeCode::DateTime),
            col("value", TypeCode::Float64),
            col("__series_id__", TypeCode::Int64),
            col("__mgmt_id__", TypeCode::Int64),
            col("labels", TypeCode::String),
            col("__name__", TypeCode::String),
            col("device", TypeCode::String),
        ]
    }

    #[test]
    fn new_series_row_carries_series_columns_and_labels() {
        let dims = prom_dims();
        let layout = prom_layout(&dims);
        let body = br#"{"__series_id__":42,"__mgmt_id__":100,"__name__":"cpu",
            "timestamp":1700000000000,"value":0.75,"device":"sda"}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 0.001).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();
        let row = build_series_row(&*metric, &layout, 42, 100, true);

        assert_eq!(row.len(), 7);
        match &row[0] {
            Value::DateTime(dt) => assert_eq!(dt.timestamp(), 1_700_000_000),
            other => panic!("{other:?}"),
        }
        assert_eq!(row[1], Value::Float64(0.75));
        assert_eq!(row[2], Value::Int64(42));
        assert_eq!(row[3], Value::Int64(100));
        // the labels JSON excludes the name key; only the set of pairs is
        // asserted
        match &row[4] {
            Value::String(labels) => {
                let parsed: serde_json::Value = serde_json::from_str(labels).unwrap();
                let obj = parsed.as_object().unwrap();
                assert_eq!(obj.len(), 1);
                assert_eq!(obj["device"], "sda");
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(row[5], Value::String("cpu".into()));
        assert_eq!(row[6], Value::String("sda".into()));
    }

    #[test]
    fn known_series_row_is_metric_prefix_only() {
        let dims = prom_dims();
        let layout = prom_layout(&dims);
        let body = br#"{"__series_id__":42,"__mgmt_id__":100,"timestamp":1700000000,"value":0.5}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();
        let row = build_series_row(&*metric, &layout, 42, 100, false);
        assert_eq!(row.len(), 3);
        assert_eq!(row[2], Value::Int64(42));
    }

    #[test]
    fn labels_exclude_le_and_blacklist() {
        let mut dims = prom_dims();
        dims.push(col("le", TypeCode::String));
        dims.push(col("secret", TypeCode::String));
        let blacklist = Regex::new("^secret$").unwrap();
        let layout = SeriesRowLayout {
            dims: &dims,
            idx_ser_id: 2,
            num_dims: dims.len(),
            name_key: "__name__",
            labels_blacklist: Some(&blacklist),
            skip_empty_labels: false,
        };
        let body = br#"{"__series_id__":1,"__mgmt_id__":2,"__name__":"lat","le":"0.5",
            "secret":"x","device":"sdb","timestamp":1,"value":2}"#;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();
        let mut parser = pool.get();
        let metric = parser.parse(body).unwrap();
        let row = build_series_row(&*metric, &layout, 1, 2, true);
        match &row[4] {
            Value::String(labels) => {
                let parsed: serde_json::Value = serde_json::from_str(labels).unwrap();
                let obj = parsed.as_object().unwrap();
                assert!(obj.contains_key("device"));
                assert!(!obj.contains_key("le"));
                assert!(!obj.contains_key("secret"));
                assert!(!obj.contains_key("__name__"));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn db_key_resolution() {
        let mut tenant = col("tenant", TypeCode::String);
        tenant.is_db_key = true;
        let pool = ParserPool::new("fastjson", &[], ",", "UTC", 1.0).unwrap();

        {
            let mut parser = pool.get();
            let metric = parser.parse(br#"{"tenant":"acme"}"#).unwrap();
            assert_eq!(
                resolve_db_key(&*metric, Some(&tenant), "base", "${tenant}_db"),
                "acme_db"
            );
            // no db-key column: always the base database
            assert_eq!(resolve_db_key(&*metric, None, "base", "${tenant}_db"), "base");
        }
        {
            // a zero value falls back to the base database
            let mut parser = pool.get();
            let metric = parser.parse(br#"{"tenant":""}"#).unwrap();
            assert_eq!(
                resolve_db_key(&*metric, Some(&tenant), "base", "${tenant}_db"),
                "base"
            );
        }
        {
            let mut parser = pool.get();
            let metric = parser.parse(br#"{"tenant":"acme.eu"}"#).unwrap();
            assert_eq!(
                resolve_db_key(&*metric, Some(&tenant), "base", "${tenant}_db"),
                "acme_eu_db"
            );
        }
    }
}
