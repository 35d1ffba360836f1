//! The task runtime: per-topic parsing, projection, shard routing and the
//! dynamic-schema control path.

pub mod consumer;
pub mod row;
pub mod sharder;
pub mod sinker;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{error, warn};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Settings, TaskSettings};
use crate::db::clickhouse::pool::ShardConnPool;
use crate::db::ClickHouseSink;
use crate::model::{DbState, InputMessage, MsgRow, TypeCode, Value};
use crate::parser::{Metric, NewKeyScan, ParserPool};
use crate::statistics;
use crate::util::{LogThrottle, RecordGate, WaitGroup};

pub use consumer::Consumer;
pub use sinker::Sinker;

use row::{build_plain_row, build_series_row, resolve_db_key, SeriesRowLayout};
use sharder::{Sharder, ShardingPolicy};

/// Tenant states of one consumer group, shared with its tasks.
pub type DbMap = RwLock<HashMap<String, Arc<DbState>>>;

/// Outcome of feeding one message into a task.
#[derive(Debug, PartialEq, Eq)]
pub enum PutResult {
    Continue,
    /// A shard buffer reached its size; the consumer should cut an epoch.
    FlushRequested,
    /// First sighting of new keys for this tenant; the consumer must
    /// flush, drain and apply the schema change before going on.
    SchemaChange { db: String },
}

/// Dynamic-key working set per tenant database.
struct ColKeys {
    known: FxHashSet<String>,
    new: BTreeMap<String, TypeCode>,
    warn: FxHashSet<String>,
    cnt_new_keys: i32,
}

/// One ingestion task: owns the parser pool, the sharder and the
/// ClickHouse writer for a single topic.
pub struct Task {
    cfg: Arc<Settings>,
    task_cfg: Arc<TaskSettings>,
    sink: Arc<ClickHouseSink>,
    pool: ParserPool,
    sharder: Sharder,
    db_map: Arc<DbMap>,
    gate: Arc<RecordGate>,
    white_list: Option<Regex>,
    black_list: Option<Regex>,
    lbl_blk_list: Option<Regex>,
    col_keys: Mutex<FxHashMap<String, ColKeys>>,
    parse_log_throttle: LogThrottle,
}

impl Task {
    pub async fn new(
        cfg: Arc<Settings>,
        task_cfg: Arc<TaskSettings>,
        conn_pool: Arc<ShardConnPool>,
        db_map: Arc<DbMap>,
        gate: Arc<RecordGate>,
    ) -> Result<Arc<Self>> {
        let pool = ParserPool::new(
            &task_cfg.parser,
            &task_cfg.csv_format,
            &task_cfg.delimiter,
            &task_cfg.timezone,
            task_cfg.time_unit,
        )
        .with_context(|| format!("task {}: bad parser config", task_cfg.name))?;

        let sink = ClickHouseSink::new(
            cfg.clone(),
            task_cfg.clone(),
            conn_pool,
            gate.clone(),
            |state, schema| {
                state.sharding_col_seq = ShardingPolicy::locate(&schema.sharding_key, &state.dims)
                    .unwrap_or(crate::model::OFFSET_SHARDING);
            },
        )
        .await?;

        let base = sink.base();
        let policy = ShardingPolicy::new(
            &sink.schema.sharding_key,
            sink.schema.sharding_stripe,
            &base.dims,
            sink.num_shards(),
        )
        .with_context(|| format!("task {}: bad sharding config", task_cfg.name))?;
        let sharder = Sharder::new(
            policy,
            sink.num_shards(),
            task_cfg.buffer_size,
            task_cfg.name.clone(),
        );

        let task = Self {
            white_list: compile_regex(&task_cfg.dynamic_schema.white_list)?,
            black_list: compile_regex(&task_cfg.dynamic_schema.black_list)?,
            lbl_blk_list: compile_regex(&task_cfg.prom_labels_black_list)?,
            sink: Arc::new(sink),
            pool,
            sharder,
            db_map,
            gate,
            col_keys: Mutex::new(FxHashMap::default()),
            parse_log_throttle: LogThrottle::new(Duration::from_secs(10)),
            cfg,
            task_cfg,
        };
        task.db_map
            .write()
            .unwrap()
            .insert(base.db.clone(), base.clone());
        task.seed_col_keys(&base);
        Ok(Arc::new(task))
    }

    pub fn name(&self) -> &str {
        &self.task_cfg.name
    }

    pub fn topic(&self) -> &str {
        &self.task_cfg.topic
    }

    pub fn settings(&self) -> &Arc<TaskSettings> {
        &self.task_cfg
    }

    /// Parse, project, route and buffer one Kafka record.
    pub async fn put(&self, msg: &InputMessage) -> Result<PutResult> {
        statistics::CONSUME_MSGS_TOTAL
            .with_label_values(&[&self.task_cfg.name])
            .inc();

        let mut parser = self.pool.get();
        let metric = match parser.parse(&msg.value) {
            Ok(metric) => metric,
            Err(e) => {
                statistics::PARSE_MSGS_ERROR_TOTAL
                    .with_label_values(&[&self.task_cfg.name])
                    .inc();
                if self.parse_log_throttle.allow() {
                    error!(
                        "task {}: failed to parse message (topic {}, partition {}, offset {}): {e:#}",
                        self.task_cfg.name, msg.topic, msg.partition, msg.offset
                    );
                }
                return Ok(PutResult::Continue);
            }
        };

        let schema = &self.sink.schema;
        let db = resolve_db_key(
            &*metric,
            schema.key_dim.as_ref(),
            &schema.base_db,
            &self.cfg.clickhouse.db_key,
        );

        let state = {
            let map = self.db_map.read().unwrap();
            map.get(&db).cloned()
        };
        let state = match state {
            Some(state) => state,
            // first sight of this tenant key; schema is ensured below
            None => Arc::new(self.sink.base().tenant_clone(db.clone())),
        };

        let row = if state.idx_ser_id >= 0 {
            let sid = int_of(metric.get_int64(&schema.series_meta.dim_ser_id, false));
            let mid = int_of(metric.get_int64(&schema.series_meta.dim_mgmt_id, false));
            let new_series = self.sink.allow_write_series(sid, mid);
            let layout = SeriesRowLayout {
                dims: &state.dims,
                idx_ser_id: state.idx_ser_id as usize,
                num_dims: state.num_dims,
                name_key: &schema.series_meta.name_key,
                labels_blacklist: self.lbl_blk_list.as_ref(),
                skip_empty_labels: self.task_cfg.dynamic_schema.not_nullable,
            };
            Some(build_series_row(&*metric, &layout, sid, mid, new_series))
        } else {
            build_plain_row(
                &*metric,
                msg,
                &state.dims,
                &schema.sorting_keys,
                &self.task_cfg.name,
            )
        };
        let Some(row) = row else {
            statistics::DROP_MSGS_TOTAL
                .with_label_values(&[&self.task_cfg.name])
                .inc();
            return Ok(PutResult::Continue);
        };
        state.buf_length.fetch_add(1, Ordering::Relaxed);
        state.processed.fetch_add(1, Ordering::Relaxed);

        let state = if state.new_key {
            let mut ensured = schema
                .ensure_schema(&db)
                .await
                .with_context(|| format!("task {}: failed to ensure schema of {db}", self.task_cfg.name))?;
            ensured.sharding_col_seq = ShardingPolicy::locate(&schema.sharding_key, &ensured.dims)
                .unwrap_or(crate::model::OFFSET_SHARDING);
            let ensured = Arc::new(ensured);
            self.db_map
                .write()
                .unwrap()
                .insert(db.clone(), ensured.clone());
            self.seed_col_keys(&ensured);
            ensured
        } else {
            state
        };

        let mut found_new = false;
        if self.task_cfg.dynamic_schema.enable {
            let mut col_keys = self.col_keys.lock().unwrap();
            let entry = col_keys
                .entry(db.clone())
                .or_insert_with(|| self.col_keys_of(&state));
            let mut scan = NewKeyScan {
                known: &entry.known,
                new: &mut entry.new,
                warn: &mut entry.warn,
                white: self.white_list.as_ref(),
                black: self.black_list.as_ref(),
            };
            found_new = metric.get_new_keys(&mut scan, msg.partition, msg.offset);
        }
        // accessors may borrow the parser; release it only after the last
        // read of `metric`
        drop(metric);
        drop(parser);

        if found_new {
            let mut col_keys = self.col_keys.lock().unwrap();
            if let Some(entry) = col_keys.get_mut(&db) {
                entry.cnt_new_keys += 1;
                if entry.cnt_new_keys == 1 {
                    warn!(
                        "task {}: new keys detected for {db}, schema change required",
                        self.task_cfg.name
                    );
                    return Ok(PutResult::SchemaChange { db });
                }
            }
        }

        // rows are parked until the pending schema change rebuilds the task
        let pending = {
            let col_keys = self.col_keys.lock().unwrap();
            col_keys.get(&db).is_some_and(|e| e.cnt_new_keys > 0)
        };
        if pending {
            return Ok(PutResult::Continue);
        }

        let shard = self
            .sharder
            .calc_shard(&row, msg.offset, msg.partition, state.sharding_col_seq);
        self.gate.inc(1).await;
        statistics::RECORD_POOL_SIZE.inc();
        let full = self.sharder.put_element(&db, MsgRow { shard, row });
        Ok(if full {
            PutResult::FlushRequested
        } else {
            PutResult::Continue
        })
    }

    /// Cut all shard buffers into batches on `wg` and hand them to the
    /// writer.
    pub async fn flush(&self, wg: &WaitGroup) -> usize {
        let batches = self.sharder.flush(wg);
        let mut rows = 0;
        for (db, batch) in batches {
            let state = {
                let map = self.db_map.read().unwrap();
                map.get(&db).cloned()
            };
            match state {
                Some(state) => {
                    rows += batch.real_size;
                    self.sink.send(batch, state).await;
                }
                None => {
                    // tenant state was removed by a schema change; these
                    // rows are re-consumed after the restart
                    warn!(
                        "task {}: dropping {} buffered rows of removed tenant {db}",
                        self.task_cfg.name, batch.real_size
                    );
                    self.gate.dec(batch.real_size as i64);
                    statistics::RECORD_POOL_SIZE.sub(batch.real_size as i64);
                    batch.wg.done();
                }
            }
        }
        rows
    }

    /// Wait for every in-flight batch of this task's writer.
    pub async fn drain(&self) {
        self.sink.drain().await;
    }

    /// Apply the collected new keys as DDL and retire the tenant state.
    /// The task must be rebuilt (re-introspected) afterwards.
    pub async fn apply_schema_change(&self, db: &str) -> Result<usize> {
        let new_keys = {
            let mut col_keys = self.col_keys.lock().unwrap();
            match col_keys.get_mut(db) {
                Some(entry) => std::mem::take(&mut entry.new),
                None => BTreeMap::new(),
            }
        };
        let state = {
            let map = self.db_map.read().unwrap();
            map.get(db)
                .cloned()
                .ok_or_else(|| anyhow!("no state for tenant {db}"))?
        };
        let added = self.sink.schema.change_schema(&state, &new_keys).await?;
        self.db_map.write().unwrap().remove(db);
        Ok(added)
    }

    /// Drop buffered rows (restart path); the consumer re-reads them from
    /// the uncommitted offsets.
    pub fn discard_buffers(&self) {
        let dropped = self.sharder.clear();
        if dropped > 0 {
            statistics::RECORD_POOL_SIZE.sub(dropped as i64);
        }
    }

    fn seed_col_keys(&self, state: &DbState) {
        let mut col_keys = self.col_keys.lock().unwrap();
        col_keys.insert(state.db.clone(), self.col_keys_of(state));
    }

    fn col_keys_of(&self, state: &DbState) -> ColKeys {
        let mut known: FxHashSet<String> = state
            .dims
            .iter()
            .map(|dim| dim.source_name.clone())
            .collect();
        for name in &self.task_cfg.exclude_columns {
            known.insert(name.clone());
        }
        // a column name is never the empty string
        known.insert(String::new());
        ColKeys {
            known,
            new: BTreeMap::new(),
            warn: FxHashSet::default(),
            cnt_new_keys: 0,
        }
    }
}

fn int_of(value: Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

fn compile_regex(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Regex::new(pattern)?))
    }
}
