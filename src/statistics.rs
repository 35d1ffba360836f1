//! Prometheus counter families for the ingestion pipeline.
//!
//! Registered against the default registry; the process exposes or pushes
//! them through external glue, the core only increments.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

pub static CONSUME_MSGS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_consume_msgs_total",
        "total num of consumed msgs",
        &["task"]
    )
    .expect("register sluice_consume_msgs_total")
});

pub static PARSE_MSGS_ERROR_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_parse_msgs_error_total",
        "total num of msgs with parse failure",
        &["task"]
    )
    .expect("register sluice_parse_msgs_error_total")
});

pub static FLUSH_MSGS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_flush_msgs_total",
        "total num of rows flushed to clickhouse",
        &["task", "db"]
    )
    .expect("register sluice_flush_msgs_total")
});

pub static FLUSH_MSGS_ERROR_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_flush_msgs_error_total",
        "total num of rows which failed to flush (counted per attempt)",
        &["task"]
    )
    .expect("register sluice_flush_msgs_error_total")
});

pub static DROP_MSGS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_drop_msgs_total",
        "total num of rows dropped on a null non-nullable column",
        &["task"]
    )
    .expect("register sluice_drop_msgs_total")
});

pub static WRITE_SERIES_ALLOW_NEW: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_write_series_allow_new",
        "series writes admitted for a previously unseen series id",
        &["task"]
    )
    .expect("register sluice_write_series_allow_new")
});

pub static WRITE_SERIES_ALLOW_CHANGED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_write_series_allow_changed",
        "series writes admitted for a changed series definition",
        &["task"]
    )
    .expect("register sluice_write_series_allow_changed")
});

pub static WRITE_SERIES_DROP_QUOTA: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_write_series_drop_quota",
        "series writes dropped by the per-window quota",
        &["task"]
    )
    .expect("register sluice_write_series_drop_quota")
});

pub static WRITE_SERIES_DROP_UNCHANGED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_write_series_drop_unchanged",
        "series writes dropped because the definition is unchanged",
        &["task"]
    )
    .expect("register sluice_write_series_drop_unchanged")
});

pub static WRITE_SERIES_SUCCEED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sluice_write_series_succeed",
        "series rows written to the series table",
        &["task"]
    )
    .expect("register sluice_write_series_succeed")
});

pub static RECORD_POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sluice_record_pool_size",
        "records buffered between consumers and writers"
    )
    .expect("register sluice_record_pool_size")
});

pub static WRITING_POOL_BACKLOG: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "sluice_writing_pool_backlog",
        "batches submitted to shard executors and not yet written",
        &["task"]
    )
    .expect("register sluice_writing_pool_backlog")
});

pub static WRITING_DURATIONS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sluice_writing_durations",
        "writing durations in seconds",
        &["task", "table"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("register sluice_writing_durations")
});
