use std::sync::Mutex;

use anyhow::{bail, Result};
use rustc_hash::FxHashMap;
use xxhash_rust::xxh64::xxh64;

use crate::model::{Batch, ColumnWithType, MsgRow, Row, TypeCode, Value};
use crate::util::{get_shift, WaitGroup};

/// Routes a row to a shard by the value of one column.
///
/// The column index lives on the per-tenant state (layouts differ across
/// tenants after dynamic schema changes); the policy carries the stripe
/// and shard count and dispatches on the value's type: strings hash,
/// numerics and times divide by the stripe.
pub struct ShardingPolicy {
    stripe: u64,
    shards: usize,
}

impl ShardingPolicy {
    /// Build the policy for a configured sharding key, validating it
    /// against the base dims. `None` when no key is configured.
    pub fn new(
        key: &str,
        stripe: u64,
        dims: &[ColumnWithType],
        num_shards: usize,
    ) -> Result<Option<Self>> {
        if key.is_empty() {
            return Ok(None);
        }
        let Some(dim) = dims.iter().find(|d| d.name == key) else {
            bail!("sharding key {key:?} is not a column of the target table");
        };
        let stripe = match dim.typ.code {
            TypeCode::String => 1,
            TypeCode::Int64 | TypeCode::Float64 | TypeCode::DateTime => {
                if stripe == 0 {
                    bail!("sharding key {key:?} requires a shardingStripe");
                }
                stripe
            }
            other => bail!("sharding key {key:?} has unsupported type {other:?}"),
        };
        Ok(Some(Self {
            stripe,
            shards: num_shards,
        }))
    }

    /// Locate the sharding column in a concrete layout.
    pub fn locate(key: &str, dims: &[ColumnWithType]) -> Option<i32> {
        dims.iter().position(|d| d.name == key).map(|i| i as i32)
    }

    /// Shard for the value at `col_seq`; `None` falls back to the
    /// offset-based formula.
    pub fn calc(&self, row: &Row, col_seq: usize) -> Option<usize> {
        let shards = self.shards as i64;
        let shard = match &row[col_seq] {
            Value::String(s) => (xxh64(s.as_bytes(), 0) % self.shards as u64) as i64,
            Value::Int64(v) => v.div_euclid(self.stripe as i64).rem_euclid(shards),
            Value::Float64(v) => ((*v / self.stripe as f64) as i64).rem_euclid(shards),
            Value::DateTime(dt) => dt
                .timestamp()
                .div_euclid(self.stripe as i64)
                .rem_euclid(shards),
            Value::Bool(b) => i64::from(*b).div_euclid(self.stripe as i64).rem_euclid(shards),
            _ => return None,
        };
        Some(shard as usize)
    }
}

/// Shard-local row buffers for one task, keyed by tenant database.
///
/// `put_element` reports when any buffer reaches the configured size so
/// the consumer can cut a flush epoch; the periodic flusher and the
/// dynamic-schema barrier flush through the same path.
pub struct Sharder {
    policy: Option<ShardingPolicy>,
    shards: usize,
    off_shift: u32,
    buffer_size: usize,
    group_id: String,
    buffers: Mutex<FxHashMap<String, Vec<Vec<Row>>>>,
}

impl Sharder {
    pub fn new(
        policy: Option<ShardingPolicy>,
        shards: usize,
        buffer_size: usize,
        group_id: String,
    ) -> Self {
        Self {
            policy,
            shards,
            off_shift: get_shift(buffer_size),
            buffer_size,
            group_id,
            buffers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards
    }

    /// Shard for a row: by sharding column when the policy applies and
    /// the column index is in range, otherwise by offset arithmetic.
    pub fn calc_shard(&self, row: &Row, offset: i64, partition: i32, col_seq: i32) -> usize {
        if let Some(policy) = &self.policy {
            if col_seq >= 0 && (col_seq as usize) < row.len() {
                if let Some(shard) = policy.calc(row, col_seq as usize) {
                    return shard;
                }
            }
        }
        self.offset_shard(offset, partition)
    }

    fn offset_shard(&self, offset: i64, partition: i32) -> usize {
        let mixed = offset.wrapping_mul(partition as i64 + 1) >> self.off_shift;
        mixed.rem_euclid(self.shards as i64) as usize
    }

    /// Append a routed row. Returns true when its buffer reached the
    /// configured size and a flush is due.
    pub fn put_element(&self, db: &str, msg_row: MsgRow) -> bool {
        let mut buffers = self.buffers.lock().unwrap();
        let shards = buffers
            .entry(db.to_owned())
            .or_insert_with(|| vec![Vec::new(); self.shards]);
        let buf = &mut shards[msg_row.shard];
        buf.push(msg_row.row);
        buf.len() >= self.buffer_size
    }

    pub fn buffered(&self) -> usize {
        let buffers = self.buffers.lock().unwrap();
        buffers
            .values()
            .flat_map(|shards| shards.iter())
            .map(Vec::len)
            .sum()
    }

    /// Cut every non-empty buffer into a batch registered on `wg`.
    /// Returns `(db, batch)` pairs; the caller resolves each db to its
    /// state and hands the batch to the writer.
    pub fn flush(&self, wg: &WaitGroup) -> Vec<(String, Batch)> {
        let mut out = Vec::new();
        let mut buffers = self.buffers.lock().unwrap();
        for (db, shards) in buffers.iter_mut() {
            for (shard, buf) in shards.iter_mut().enumerate() {
                if buf.is_empty() {
                    continue;
                }
                let rows = std::mem::take(buf);
                wg.add(1);
                out.push((
                    db.clone(),
                    Batch {
                        group_id: self.group_id.clone(),
                        shard,
                        batch_idx: shard as i64,
                        real_size: rows.len(),
                        rows,
                        wg: wg.clone(),
                    },
                ));
            }
        }
        out
    }

    /// Discard all buffered rows (consumer restart path). Returns the
    /// number of rows dropped.
    pub fn clear(&self) -> usize {
        let mut buffers = self.buffers.lock().unwrap();
        let dropped = buffers
            .values()
            .flat_map(|shards| shards.iter())
            .map(Vec::len)
            .sum();
        buffers.clear();
        dropped
    }
}
