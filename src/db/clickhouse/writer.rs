use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info};
use once_cell::sync::Lazy;
use tokio::sync::Notify;

use crate::config::{Settings, TaskSettings};
use crate::model::{Batch, DbState, Row, SeriesQuota, Value};
use crate::statistics;
use crate::util::RecordGate;

use super::pool::{ReplicaConn, ShardConn, ShardConnPool};
use super::schema::SchemaManager;

const RETRY_BASE_DELAY: Duration = Duration::from_secs(10);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Series quotas are process-global so two tasks feeding the same series
/// table share one admission window.
static SERIES_QUOTAS: Lazy<Mutex<HashMap<String, Arc<SeriesQuota>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn series_quota_for(key: &str) -> Arc<SeriesQuota> {
    let mut quotas = SERIES_QUOTAS.lock().unwrap();
    quotas
        .entry(key.to_owned())
        .or_insert_with(|| Arc::new(SeriesQuota::new()))
        .clone()
}

/// Batch writer for one task: accepts row batches, serialises them through
/// the shard executors, retries with backoff across replicas, and tracks
/// in-flight batches for the drain barrier.
pub struct ClickHouseSink {
    cfg: Arc<Settings>,
    task: Arc<TaskSettings>,
    pub schema: SchemaManager,
    pool: Arc<ShardConnPool>,
    gate: Arc<RecordGate>,
    series_quota: Option<Arc<SeriesQuota>>,
    base: Arc<DbState>,
    flying: Mutex<i64>,
    drained: Notify,
}

impl ClickHouseSink {
    /// Introspect the schema and assemble the writer. `adjust` runs on the
    /// freshly built base state before it is frozen (the task stores the
    /// sharding column index there).
    pub async fn new(
        cfg: Arc<Settings>,
        task: Arc<TaskSettings>,
        pool: Arc<ShardConnPool>,
        gate: Arc<RecordGate>,
        adjust: impl FnOnce(&mut DbState, &SchemaManager),
    ) -> Result<Self> {
        let (schema, mut base) = SchemaManager::new(cfg.clone(), task.clone(), pool.clone()).await?;
        adjust(&mut base, &schema);
        let series_quota = match schema.series_quota_key(&base.db) {
            key if key.is_empty() => None,
            key => Some(series_quota_for(&key)),
        };
        Ok(Self {
            cfg,
            task,
            schema,
            pool,
            gate,
            series_quota,
            base: Arc::new(base),
            flying: Mutex::new(0),
            drained: Notify::new(),
        })
    }

    pub fn base(&self) -> Arc<DbState> {
        self.base.clone()
    }

    pub fn num_shards(&self) -> usize {
        self.pool.num_shards()
    }

    /// Admission check for one series definition row.
    pub fn allow_write_series(&self, sid: i64, mid: i64) -> bool {
        match &self.series_quota {
            Some(quota) => quota.allow_write_series(sid, mid, &self.task.name),
            None => false,
        }
    }

    /// Hand a batch to its shard executor. The batch's wait group is
    /// released even if the executor is gone.
    pub async fn send(self: &Arc<Self>, batch: Batch, state: Arc<DbState>) {
        let sc = self.pool.shard_conn(batch.batch_idx);
        let real_size = batch.real_size as i64;
        let wg = batch.wg.clone();
        {
            let mut flying = self.flying.lock().unwrap();
            *flying += 1;
        }
        statistics::WRITING_POOL_BACKLOG
            .with_label_values(&[&self.task.name])
            .inc();

        let this = self.clone();
        let job = Box::pin(this.loop_write(batch, sc.clone(), state));
        if let Err(e) = sc.submit(job).await {
            error!("task {}: {e:#}", self.task.name);
            // the job never ran; undo its accounting
            wg.done();
            self.finish_batch(real_size);
        }
    }

    /// Wait until every in-flight batch of this writer has completed.
    /// Called before schema changes and on shutdown.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let flying = self.flying.lock().unwrap();
                if *flying == 0 {
                    return;
                }
                debug!(
                    "task {}: draining, {} flying batches",
                    self.task.name, *flying
                );
            }
            notified.await;
        }
    }

    fn finish_batch(&self, real_size: i64) {
        self.gate.dec(real_size);
        statistics::RECORD_POOL_SIZE.sub(real_size);
        statistics::WRITING_POOL_BACKLOG
            .with_label_values(&[&self.task.name])
            .dec();
        let mut flying = self.flying.lock().unwrap();
        *flying -= 1;
        if *flying == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Retry a batch until it lands or the attempt budget is exhausted.
    /// Exhaustion is fatal: a lost batch would break the at-least-once
    /// contract, so the process exits and the orchestrator restarts it.
    async fn loop_write(self: Arc<Self>, batch: Batch, sc: Arc<ShardConn>, state: Arc<DbState>) {
        let times = self.cfg.clickhouse.retry_times;
        let mut attempt: u32 = 0;
        let mut db_ver = 0usize;
        loop {
            match self.write(&batch, &sc, &mut db_ver, &state).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    statistics::FLUSH_MSGS_ERROR_TOTAL
                        .with_label_values(&[&self.task.name])
                        .inc_by(batch.real_size as u64);
                    error!(
                        "task {}: flush batch failed (group {}, try {attempt}): {e:#}",
                        self.task.name, batch.group_id
                    );
                    if times > 0 && attempt >= times as u32 {
                        error!(
                            "task {}: write retries exhausted after {attempt} attempts, aborting",
                            self.task.name
                        );
                        std::process::exit(1);
                    }
                    let delay = RETRY_BASE_DELAY
                        .saturating_mul(attempt)
                        .min(RETRY_MAX_DELAY);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        batch.wg.done();
        self.finish_batch(batch.real_size as i64);
    }

    async fn write(
        &self,
        batch: &Batch,
        sc: &ShardConn,
        db_ver: &mut usize,
        state: &DbState,
    ) -> Result<()> {
        if batch.rows.is_empty() {
            return Ok(());
        }
        let (conn, ver) = sc.next_good_replica(*db_ver)?;
        *db_ver = ver;
        debug!(
            "task {}: writing batch via {} (ver {ver})",
            self.task.name,
            conn.addr()
        );

        // row[..idx_ser_id+1] feeds the metric table, row[idx_ser_id..]
        // the series table
        let num_cols = if self.task.prometheus_schema {
            state.idx_ser_id as usize + 1
        } else {
            state.num_dims
        };
        if self.task.prometheus_schema {
            self.write_series(batch, state, &conn).await?;
        }

        let begin = Instant::now();
        let (stmt, num_bad) = self.render_insert(&state.prepare_sql, &batch.rows, 0, num_cols);
        info!(
            "task {}: write {} rows x {num_cols} cols to {} via {}",
            self.task.name,
            batch.rows.len(),
            state.db,
            conn.addr()
        );
        if let Err(e) = conn.client().query(&stmt).execute().await {
            conn.mark_failed();
            return Err(e).context("metric insert failed");
        }
        conn.mark_ok();
        statistics::WRITING_DURATIONS
            .with_label_values(&[&self.task.name, &self.schema.table_name])
            .observe(begin.elapsed().as_secs_f64());
        if num_bad > 0 {
            statistics::PARSE_MSGS_ERROR_TOTAL
                .with_label_values(&[&self.task.name])
                .inc_by(num_bad as u64);
        }
        statistics::FLUSH_MSGS_TOTAL
            .with_label_values(&[&self.task.name, &state.db])
            .inc_by(batch.real_size as u64);
        Ok(())
    }

    /// Insert the series slice of full-length rows, then publish the
    /// sid -> mid mapping so later duplicates are dropped by the quota.
    async fn write_series(&self, batch: &Batch, state: &DbState, conn: &ReplicaConn) -> Result<()> {
        let idx = state.idx_ser_id as usize;
        let series_rows: Vec<&Row> = batch
            .rows
            .iter()
            // prefix-only rows carry no series columns
            .filter(|row| row.len() == state.num_dims)
            .collect();
        if series_rows.is_empty() {
            return Ok(());
        }

        let begin = Instant::now();
        let (stmt, num_bad) =
            self.render_insert_refs(&state.prom_ser_sql, &series_rows, idx, state.num_dims);
        if let Err(e) = conn.client().query(&stmt).execute().await {
            conn.mark_failed();
            return Err(e).context("series insert failed");
        }
        conn.mark_ok();

        if let Some(quota) = &self.series_quota {
            quota.record_written(series_rows.iter().filter_map(|row| {
                match (row.get(idx), row.get(idx + 1)) {
                    (Some(Value::Int64(sid)), Some(Value::Int64(mid))) => Some((*sid, *mid)),
                    _ => None,
                }
            }));
        }
        info!(
            "task {}: wrote {} series rows",
            self.task.name,
            series_rows.len()
        );
        statistics::WRITE_SERIES_SUCCEED
            .with_label_values(&[&self.task.name])
            .inc_by(series_rows.len() as u64);
        if num_bad > 0 {
            statistics::PARSE_MSGS_ERROR_TOTAL
                .with_label_values(&[&self.task.name])
                .inc_by(num_bad as u64);
        }
        statistics::WRITING_DURATIONS
            .with_label_values(&[&self.task.name, &self.schema.series_tbl])
            .observe(begin.elapsed().as_secs_f64());
        Ok(())
    }

    fn render_insert(
        &self,
        template: &str,
        rows: &[Row],
        begin: usize,
        end: usize,
    ) -> (String, usize) {
        let refs: Vec<&Row> = rows.iter().collect();
        self.render_insert_refs(template, &refs, begin, end)
    }

    fn render_insert_refs(
        &self,
        template: &str,
        rows: &[&Row],
        begin: usize,
        end: usize,
    ) -> (String, usize) {
        let settings = if self.cfg.clickhouse.async_insert {
            let mut clause = " SETTINGS async_insert = 1".to_owned();
            for (k, v) in &self.cfg.clickhouse.async_settings {
                clause.push_str(&format!(", {k} = {v}"));
            }
            clause
        } else {
            String::new()
        };
        render_insert(template, rows, begin, end, &settings)
    }
}

/// Expand an INSERT template into a full statement with literal tuples
/// for the columns `[begin, end)` of each row. Rows too short for the
/// slice are counted and skipped.
fn render_insert(
    template: &str,
    rows: &[&Row],
    begin: usize,
    end: usize,
    settings: &str,
) -> (String, usize) {
    let head = match template.find(" VALUES") {
        Some(pos) => &template[..pos],
        None => template,
    };
    let mut stmt = String::with_capacity(head.len() + rows.len() * 64);
    stmt.push_str(head);
    stmt.push_str(settings);
    stmt.push_str(" VALUES ");

    let mut num_bad = 0usize;
    let mut first = true;
    for row in rows {
        if row.len() < end {
            num_bad += 1;
            continue;
        }
        if !first {
            stmt.push(',');
        }
        first = false;
        stmt.push('(');
        for (i, value) in row[begin..end].iter().enumerate() {
            if i > 0 {
                stmt.push(',');
            }
            stmt.push_str(&value.sql_literal());
        }
        stmt.push(')');
    }
    (stmt, num_bad)
}
