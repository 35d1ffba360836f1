use std::sync::atomic::AtomicI64;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use crate::statistics;
use crate::util::WaitGroup;

use super::column::ColumnWithType;
use super::value::Value;

pub type Row = Vec<Value>;

/// Sharding column index meaning "hash of the offset".
pub const OFFSET_SHARDING: i32 = -1;

/// Per-tenant schema snapshot plus the INSERT templates built from it.
///
/// Once `new_key` is false the layout fields are frozen; a changed layout
/// is expressed as a fresh instance swapped into the consumer's map.
#[derive(Debug)]
pub struct DbState {
    pub db: String,
    pub dims: Vec<ColumnWithType>,
    pub num_dims: usize,
    /// Position of the series id column for Prometheus tasks, -1 otherwise.
    pub idx_ser_id: i32,
    /// Index of the sharding column, -1 for offset-based sharding.
    pub sharding_col_seq: i32,
    pub prepare_sql: String,
    pub prom_ser_sql: String,
    /// True until the tenant's schema has been ensured on the server.
    pub new_key: bool,
    pub buf_length: AtomicI64,
    pub processed: AtomicI64,
}

impl DbState {
    /// Clone the base layout for a newly observed tenant key. The dims are
    /// deep-copied so later schema changes on one tenant cannot leak into
    /// another, and the INSERT templates stay empty until the schema has
    /// been ensured.
    pub fn tenant_clone(&self, db: String) -> DbState {
        DbState {
            db,
            dims: self.dims.clone(),
            num_dims: self.num_dims,
            idx_ser_id: self.idx_ser_id,
            sharding_col_seq: self.sharding_col_seq,
            prepare_sql: String::new(),
            prom_ser_sql: String::new(),
            new_key: true,
            buf_length: AtomicI64::new(0),
            processed: AtomicI64::new(0),
        }
    }
}

/// One Kafka record handed to a task.
#[derive(Debug, Clone)]
pub struct InputMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A projected row together with its shard assignment.
#[derive(Debug)]
pub struct MsgRow {
    pub shard: usize,
    pub row: Row,
}

/// A shard-local batch in flight towards ClickHouse. The wait group is
/// shared with the flush epoch that produced the batch, so the consumer
/// can gate offset commits and schema changes on its completion.
pub struct Batch {
    pub group_id: String,
    pub shard: usize,
    pub batch_idx: i64,
    pub rows: Vec<Row>,
    pub real_size: usize,
    pub wg: WaitGroup,
}

/// Upper bound on re-emitted series definitions per reset window.
pub const WR_SERIES_QUOTA: i32 = 16384;

const QUOTA_RESET_WINDOW: Duration = Duration::from_secs(10);

struct SeriesQuotaInner {
    bm_series: FxHashMap<i64, i64>,
    wr_series: i32,
    next_reset_quota: Instant,
}

/// Admission policy for series-definition rows, shared process-wide by
/// every task that targets the same series table.
///
/// Fresh series are always admitted; re-definitions (same series id, new
/// mgmt id) are capped at [`WR_SERIES_QUOTA`] per window so a tenant that
/// churns series metadata cannot monopolize the series table.
pub struct SeriesQuota {
    inner: RwLock<SeriesQuotaInner>,
}

impl SeriesQuota {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SeriesQuotaInner {
                bm_series: FxHashMap::default(),
                wr_series: 0,
                next_reset_quota: Instant::now() + QUOTA_RESET_WINDOW,
            }),
        }
    }

    pub fn allow_write_series(&self, sid: i64, mid: i64, task: &str) -> bool {
        self.allow_write_series_at(sid, mid, task, Instant::now())
    }

    fn allow_write_series_at(&self, sid: i64, mid: i64, task: &str, now: Instant) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.bm_series.get(&sid) {
            None => {
                log::debug!("found new series sid={sid} mid={mid}");
                statistics::WRITE_SERIES_ALLOW_NEW
                    .with_label_values(&[task])
                    .inc();
                true
            }
            Some(&known_mid) if known_mid != mid => {
                let allowed = if inner.wr_series < WR_SERIES_QUOTA {
                    inner.wr_series += 1;
                    true
                } else if now > inner.next_reset_quota {
                    inner.next_reset_quota = now + QUOTA_RESET_WINDOW;
                    inner.wr_series = 1;
                    true
                } else {
                    false
                };
                if allowed {
                    statistics::WRITE_SERIES_ALLOW_CHANGED
                        .with_label_values(&[task])
                        .inc();
                } else {
                    statistics::WRITE_SERIES_DROP_QUOTA
                        .with_label_values(&[task])
                        .inc();
                }
                allowed
            }
            Some(_) => {
                statistics::WRITE_SERIES_DROP_UNCHANGED
                    .with_label_values(&[task])
                    .inc();
                false
            }
        }
    }

    /// Record successfully written series rows. Re-definitions release
    /// their window slot once durable.
    pub fn record_written<I: IntoIterator<Item = (i64, i64)>>(&self, pairs: I) {
        let mut inner = self.inner.write().unwrap();
        for (sid, mid) in pairs {
            if inner.bm_series.contains_key(&sid) && inner.wr_series > 0 {
                inner.wr_series -= 1;
            }
            inner.bm_series.insert(sid, mid);
        }
    }

    pub fn known_series(&self) -> usize {
        self.inner.read().unwrap().bm_series.len()
    }

    pub fn window_writes(&self) -> i32 {
        self.inner.read().unwrap().wr_series
    }
}

impl Default for SeriesQuota {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnType, ColumnWithType, TypeCode};

    #[test]
    fn tenant_clone_starts_without_templates() {
        let base = DbState {
            db: "default".into(),
            dims: vec![ColumnWithType::new(
                "a",
                ColumnType::plain(TypeCode::Int64),
                "a",
            )],
            num_dims: 1,
            idx_ser_id: -1,
            sharding_col_seq: OFFSET_SHARDING,
            prepare_sql: "INSERT INTO `default`.`t` (`a`)".into(),
            prom_ser_sql: String::new(),
            new_key: false,
            buf_length: AtomicI64::new(0),
            processed: AtomicI64::new(0),
        };
        let clone = base.tenant_clone("acme_db".into());
        assert!(clone.new_key);
        // the INSERT template stays empty until the schema is ensured
        assert!(clone.prepare_sql.is_empty());
        assert_eq!(clone.dims, base.dims);
        // deep copy: mutating the clone's dims cannot alias the base
        let mut dims = clone.dims;
        dims.push(ColumnWithType::new(
            "b",
            ColumnType::plain(TypeCode::String),
            "b",
        ));
        assert_eq!(base.dims.len(), 1);
    }

    #[test]
    fn new_series_always_admitted() {
        let quota = SeriesQuota::new();
        assert!(quota.allow_write_series(42, 100, "t"));
        // still unknown until the write lands
        assert!(quota.allow_write_series(42, 100, "t"));
        quota.record_written([(42, 100)]);
        assert_eq!(quota.known_series(), 1);
    }

    #[test]
    fn unchanged_definition_dropped() {
        let quota = SeriesQuota::new();
        quota.record_written([(42, 100)]);
        assert!(!quota.allow_write_series(42, 100, "t"));
    }

    #[test]
    fn changed_definition_admitted_within_quota() {
        let quota = SeriesQuota::new();
        quota.record_written([(42, 100)]);
        assert!(quota.allow_write_series(42, 101, "t"));
        assert_eq!(quota.window_writes(), 1);
        // durable write releases the slot and records the new mapping
        quota.record_written([(42, 101)]);
        assert_eq!(quota.window_writes(), 0);
        assert!(!quota.allow_write_series(42, 101, "t"));
    }

    #[test]
    fn quota_exhaustion_resets_after_window() {
        let quota = SeriesQuota::new();
        quota.record_written([(1, 1)]);
        {
            let mut inner = quota.inner.write().unwrap();
            inner.wr_series = WR_SERIES_QUOTA;
        }
        let now = Instant::now();
        assert!(!quota.allow_write_series_at(1, 2, "t", now));
        // once the window elapses, the next admission resets the counter
        let later = now + QUOTA_RESET_WINDOW + Duration::from_secs(1);
        assert!(quota.allow_write_series_at(1, 2, "t", later));
        assert_eq!(quota.window_writes(), 1);
        assert!(quota.window_writes() <= WR_SERIES_QUOTA);
    }
}
