use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clickhouse::Client;
use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::ClickHouseSettings;

/// Backlog of batches a single shard executor will buffer before
/// submission suspends the flusher.
const EXECUTOR_QUEUE: usize = 32;

const COOLDOWN_BASE: Duration = Duration::from_secs(1);
const COOLDOWN_CAP: Duration = Duration::from_secs(60);

/// One ClickHouse replica endpoint with its health state.
///
/// Failures put the replica into an exponential cool-down; it is
/// re-probed once the cool-down expires on the next rotation.
pub struct ReplicaConn {
    addr: String,
    client: Client,
    health: Mutex<ReplicaHealth>,
}

#[derive(Default)]
struct ReplicaHealth {
    fails: u32,
    down_until: Option<Instant>,
}

impl ReplicaConn {
    fn new(addr: String, client: Client) -> Self {
        Self {
            addr,
            client,
            health: Mutex::new(ReplicaHealth::default()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn mark_ok(&self) {
        let mut health = self.health.lock().unwrap();
        health.fails = 0;
        health.down_until = None;
    }

    pub fn mark_failed(&self) {
        let mut health = self.health.lock().unwrap();
        health.fails = health.fails.saturating_add(1);
        let cooldown = COOLDOWN_BASE
            .saturating_mul(1u32 << (health.fails - 1).min(6))
            .min(COOLDOWN_CAP);
        health.down_until = Some(Instant::now() + cooldown);
        warn!(
            "replica {} marked unhealthy for {:?} (fail #{})",
            self.addr, cooldown, health.fails
        );
    }

    fn available(&self, now: Instant) -> bool {
        match self.health.lock().unwrap().down_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

pub type WriteJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The ordered replica list of one shard plus its serial write executor.
pub struct ShardConn {
    shard: usize,
    replicas: Vec<Arc<ReplicaConn>>,
    /// Monotonic replica version; `version % len` is the active replica.
    cursor: AtomicUsize,
    jobs: mpsc::Sender<WriteJob>,
}

impl ShardConn {
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Enqueue a write on this shard's executor (FIFO within the shard).
    pub async fn submit(&self, job: WriteJob) -> Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("shard {} executor is gone", self.shard))
    }

    /// Replica versions start at 1 and map onto the replica list in
    /// order, so version 1 is the first configured replica.
    fn replica_at(&self, ver: usize) -> &Arc<ReplicaConn> {
        &self.replicas[(ver - 1) % self.replicas.len()]
    }

    /// Pick a healthy replica, rotating past cooled-down ones.
    ///
    /// `last_ver` is the version the caller last wrote through; a
    /// different returned version tells a retrying caller the replica
    /// flipped underneath it.
    pub fn next_good_replica(&self, last_ver: usize) -> Result<(Arc<ReplicaConn>, usize)> {
        let n = self.replicas.len();
        let now = Instant::now();
        let cur = self.cursor.load(Ordering::SeqCst);
        if cur != last_ver {
            let replica = self.replica_at(cur);
            if replica.available(now) {
                return Ok((replica.clone(), cur));
            }
        }
        for step in 1..=n {
            let ver = cur + step;
            let replica = self.replica_at(ver);
            if replica.available(now) {
                self.cursor.store(ver, Ordering::SeqCst);
                info!(
                    "shard {} rotating to replica {} (ver {})",
                    self.shard,
                    replica.addr(),
                    ver
                );
                return Ok((replica.clone(), ver));
            }
        }
        bail!("shard {}: no healthy replica", self.shard)
    }
}

/// Per-shard ordered replica connections for the whole process.
pub struct ShardConnPool {
    shards: Vec<Arc<ShardConn>>,
}

impl ShardConnPool {
    pub fn new(settings: &ClickHouseSettings) -> Result<Self> {
        let scheme = if settings.secure { "https" } else { "http" };
        let mut shards = Vec::with_capacity(settings.hosts.len());
        for (shard, replicas) in settings.hosts.iter().enumerate() {
            let mut conns = Vec::with_capacity(replicas.len());
            for host in replicas {
                let addr = format!("{scheme}://{host}:{}", settings.port);
                url::Url::parse(&addr).with_context(|| format!("bad replica address {addr}"))?;
                let client = Client::default()
                    .with_url(addr.clone())
                    .with_user(settings.username.clone())
                    .with_password(settings.password.clone())
                    .with_database(settings.db.clone())
                    .with_validation(false);
                conns.push(Arc::new(ReplicaConn::new(addr, client)));
            }
            let (tx, mut rx) = mpsc::channel::<WriteJob>(EXECUTOR_QUEUE);
            // serialises writes within the shard; drains whatever is
            // queued once all senders are gone
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
            });
            shards.push(Arc::new(ShardConn {
                shard,
                replicas: conns,
                cursor: AtomicUsize::new(1),
                jobs: tx,
            }));
        }
        if shards.is_empty() {
            bail!("clickhouse.hosts is empty");
        }
        Ok(Self { shards })
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_conn(&self, batch_idx: i64) -> Arc<ShardConn> {
        let idx = batch_idx.rem_euclid(self.shards.len() as i64) as usize;
        self.shards[idx].clone()
    }

    /// Verify every shard answers `SELECT 1`, retrying briefly so a
    /// restart does not flap on a transient hiccup.
    pub async fn ping(&self) -> Result<()> {
        for shard in &self.shards {
            let mut last_err = None;
            let mut ok = false;
            for attempt in 0..3u32 {
                let (replica, _) = shard.next_good_replica(0)?;
                match replica.client().query("SELECT 1").fetch_one::<u8>().await {
                    Ok(_) => {
                        replica.mark_ok();
                        ok = true;
                        break;
                    }
                    Err(e) => {
                        replica.mark_failed();
                        last_err = Some(e);
                        tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                    }
                }
            }
            if !ok {
                bail!(
                    "shard {} is unreachable: {}",
                    shard.shard(),
                    last_err.map(|e| e.to_string()).unwrap_or_default()
                );
            }
        }
        info!("connected to all {} clickhouse shard(s)", self.shards.len());
        Ok(())
    }
}
