use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use log::{error, info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as KafkaConsumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{KafkaSettings, Settings, TaskSettings};
use crate::db::clickhouse::pool::ShardConnPool;
use crate::model::{DbState, InputMessage};
use crate::util::{RecordGate, WaitGroup};

use super::{DbMap, PutResult, Task};

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// All offsets covered by one flush, committed once its batches land.
struct FlushEpoch {
    wg: WaitGroup,
    /// `(topic, partition) -> next offset to commit`.
    offsets: Vec<((String, i32), i64)>,
}

enum SessionEnd {
    Stopped,
    /// Schema changed; rebuild tasks and rejoin the group.
    Restart,
}

/// Tracks partition revocations signalled by the broker; the poll loop
/// flushes and drains when it observes the flag.
struct GroupContext {
    group: String,
    revoked: Arc<AtomicBool>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(
                "group {}: partitions revoked: {}",
                self.group,
                partitions.count()
            );
            self.revoked.store(true, Ordering::SeqCst);
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!(
                "group {}: partitions assigned: {}",
                self.group,
                partitions.count()
            );
        }
    }
}

/// Drives one Kafka consumer group and dispatches records to its tasks.
///
/// State machine: Stopped -> Running -> Stopping -> Stopped, driven by
/// config reloads, broker rebalances and dynamic-schema restarts.
pub struct Consumer {
    cfg: Arc<Settings>,
    group: String,
    task_cfgs: Vec<Arc<TaskSettings>>,
    conn_pool: Arc<ShardConnPool>,
    gate: Arc<RecordGate>,
    tasks: RwLock<Vec<Arc<Task>>>,
    /// Tenant states per task, preserved across restarts.
    db_maps: Mutex<HashMap<String, Arc<DbMap>>>,
    state: AtomicU8,
    cancel: Mutex<CancellationToken>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(
        cfg: Arc<Settings>,
        group: String,
        task_cfgs: Vec<Arc<TaskSettings>>,
        conn_pool: Arc<ShardConnPool>,
        gate: Arc<RecordGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            group,
            task_cfgs,
            conn_pool,
            gate,
            tasks: RwLock::new(Vec::new()),
            db_maps: Mutex::new(HashMap::new()),
            state: AtomicU8::new(STATE_STOPPED),
            cancel: Mutex::new(CancellationToken::new()),
            handle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn task_settings(&self) -> &[Arc<TaskSettings>] {
        &self.task_cfgs
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => "running",
            STATE_STOPPING => "stopping",
            _ => "stopped",
        }
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<Task>> {
        let tasks = self.tasks.read().unwrap();
        tasks.iter().find(|t| t.name() == name).cloned()
    }

    /// Snapshot of the tenant states of one task.
    pub fn db_states(&self, task_name: &str) -> HashMap<String, Arc<DbState>> {
        let db_maps = self.db_maps.lock().unwrap();
        match db_maps.get(task_name) {
            Some(map) => map.read().unwrap().clone(),
            None => HashMap::new(),
        }
    }

    /// Initialize the tasks and spawn the poll loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let tasks = self.build_tasks().await?;
        *self.tasks.write().unwrap() = tasks;
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = token.clone();

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(token).await });
        *self.handle.lock().await = Some(handle);
        info!("group {}: started with {} task(s)", self.group, self.task_cfgs.len());
        Ok(())
    }

    /// Stop polling, drain outstanding batches, commit final offsets and
    /// leave the group.
    pub async fn stop(&self) {
        if self.state.swap(STATE_STOPPING, Ordering::SeqCst) == STATE_STOPPED {
            self.state.store(STATE_STOPPED, Ordering::SeqCst);
            return;
        }
        self.cancel.lock().unwrap().cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        info!("group {}: stopped", self.group);
    }

    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    async fn build_tasks(self: &Arc<Self>) -> Result<Vec<Arc<Task>>> {
        let mut tasks = Vec::with_capacity(self.task_cfgs.len());
        for task_cfg in &self.task_cfgs {
            let db_map = {
                let mut db_maps = self.db_maps.lock().unwrap();
                db_maps
                    .entry(task_cfg.name.clone())
                    .or_insert_with(|| Arc::new(DbMap::default()))
                    .clone()
            };
            let task = Task::new(
                self.cfg.clone(),
                task_cfg.clone(),
                self.conn_pool.clone(),
                db_map,
                self.gate.clone(),
            )
            .await
            .with_context(|| format!("group {}: failed to init task {}", self.group, task_cfg.name))?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            match self.poll_session(&token).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Restart) => {
                    info!("group {}: rebuilding tasks after schema change", self.group);
                    match self.build_tasks().await {
                        Ok(tasks) => *self.tasks.write().unwrap() = tasks,
                        Err(e) => {
                            // a half-applied schema cannot be recovered in
                            // process; the orchestrator restarts us
                            error!("group {}: task rebuild failed: {e:#}", self.group);
                            std::process::exit(1);
                        }
                    }
                    self.gate.reset();
                }
                Err(e) => {
                    if token.is_cancelled() {
                        break;
                    }
                    error!("group {}: consume session failed: {e:#}", self.group);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
    }

    /// One join-poll-commit session against the broker. Ends on stop or
    /// on a dynamic-schema restart.
    async fn poll_session(&self, token: &CancellationToken) -> Result<SessionEnd> {
        let tasks: Vec<Arc<Task>> = self.tasks.read().unwrap().clone();
        let revoked = Arc::new(AtomicBool::new(false));
        let context = GroupContext {
            group: self.group.clone(),
            revoked: revoked.clone(),
        };
        let consumer: StreamConsumer<GroupContext> =
            kafka_client_config(&self.cfg.kafka, &self.group)
                .create_with_context(context)
                .context("failed to create kafka consumer")?;
        let topics: Vec<&str> = tasks.iter().map(|t| t.topic()).collect();
        consumer
            .subscribe(&topics)
            .with_context(|| format!("failed to subscribe to {topics:?}"))?;
        let consumer = Arc::new(consumer);

        // epochs are committed strictly in cut order, which keeps the
        // committed offset monotonic per partition
        let (epoch_tx, epoch_rx) = mpsc::channel::<FlushEpoch>(64);
        let committer = tokio::spawn(committer_loop(consumer.clone(), epoch_rx, self.group.clone()));

        // periodic flusher per task
        let flush_token = token.child_token();
        let (flush_tx, mut flush_rx) = mpsc::channel::<usize>(tasks.len().max(1));
        for (idx, task) in tasks.iter().enumerate() {
            let interval = Duration::from_secs(task.settings().flush_interval);
            let tx = flush_tx.clone();
            let child = flush_token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = child.cancelled() => break,
                        _ = ticker.tick() => {
                            if tx.send(idx).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        drop(flush_tx);

        let mut offsets: HashMap<(String, i32), i64> = HashMap::new();
        let end = loop {
            if revoked.swap(false, Ordering::SeqCst) {
                // partitions are moving away: get our writes durable and
                // offsets committed before someone else re-reads them
                self.cut_epoch(&tasks, &mut offsets, &epoch_tx).await?;
                for task in &tasks {
                    task.drain().await;
                }
            }

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    self.cut_epoch(&tasks, &mut offsets, &epoch_tx).await?;
                    for task in &tasks {
                        task.drain().await;
                    }
                    break SessionEnd::Stopped;
                }

                Some(_task_idx) = flush_rx.recv() => {
                    self.cut_epoch(&tasks, &mut offsets, &epoch_tx).await?;
                }

                polled = consumer.recv() => {
                    // copy out of the zero-copy message before awaiting
                    let input = match polled {
                        Ok(msg) => to_input_message(&msg),
                        Err(e) => {
                            warn!("group {}: kafka receive error: {e}", self.group);
                            continue;
                        }
                    };
                    let Some(task) = tasks.iter().find(|t| t.topic() == input.topic) else {
                        continue;
                    };
                    match task.put(&input).await? {
                        PutResult::Continue => {
                            note_offset(&mut offsets, &input);
                        }
                        PutResult::FlushRequested => {
                            note_offset(&mut offsets, &input);
                            self.cut_epoch(&tasks, &mut offsets, &epoch_tx).await?;
                        }
                        PutResult::SchemaChange { db } => {
                            // the triggering record is not committed; it is
                            // re-consumed once the task is rebuilt
                            info!(
                                "group {}: draining for schema change of {db} (task {})",
                                self.group,
                                task.name()
                            );
                            self.cut_epoch(&tasks, &mut offsets, &epoch_tx).await?;
                            for t in &tasks {
                                t.drain().await;
                            }
                            if let Err(e) = task.apply_schema_change(&db).await {
                                // continuing would leave rows and schema out
                                // of step
                                error!(
                                    "group {}: schema change for {db} failed: {e:#}",
                                    self.group
                                );
                                std::process::exit(1);
                            }
                            break SessionEnd::Restart;
                        }
                    }
                }
            }
        };

        flush_token.cancel();
        for task in &tasks {
            task.discard_buffers();
        }
        drop(epoch_tx);
        let _ = committer.await;
        Ok(end)
    }

    /// Flush every task's buffers into batches and queue their offsets
    /// for commit once the batches land.
    async fn cut_epoch(
        &self,
        tasks: &[Arc<Task>],
        offsets: &mut HashMap<(String, i32), i64>,
        epoch_tx: &mpsc::Sender<FlushEpoch>,
    ) -> Result<()> {
        let wg = WaitGroup::new();
        let mut rows = 0usize;
        for task in tasks {
            rows += task.flush(&wg).await;
        }
        if rows == 0 && offsets.is_empty() {
            return Ok(());
        }
        let epoch = FlushEpoch {
            wg,
            offsets: offsets.drain().collect(),
        };
        epoch_tx
            .send(epoch)
            .await
            .map_err(|_| anyhow::anyhow!("offset committer is gone"))?;
        Ok(())
    }
}

fn note_offset(offsets: &mut HashMap<(String, i32), i64>, msg: &InputMessage) {
    let next = msg.offset + 1;
    offsets
        .entry((msg.topic.clone(), msg.partition))
        .and_modify(|cur| {
            if *cur < next {
                *cur = next;
            }
        })
        .or_insert(next);
}

async fn committer_loop(
    consumer: Arc<StreamConsumer<GroupContext>>,
    mut epoch_rx: mpsc::Receiver<FlushEpoch>,
    group: String,
) {
    while let Some(epoch) = epoch_rx.recv().await {
        epoch.wg.wait().await;
        if epoch.offsets.is_empty() {
            continue;
        }
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), next) in &epoch.offsets {
            if let Err(e) = tpl.add_partition_offset(topic, *partition, Offset::Offset(*next)) {
                warn!("group {group}: bad offset for {topic}/{partition}: {e}");
            }
        }
        if let Err(e) = consumer.commit(&tpl, CommitMode::Async) {
            warn!("group {group}: offset commit failed: {e}");
        }
    }
}

fn to_input_message(msg: &rdkafka::message::BorrowedMessage<'_>) -> InputMessage {
    let timestamp = msg
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis);
    InputMessage {
        topic: msg.topic().to_owned(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()).unwrap_or_default(),
        value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        timestamp,
    }
}

/// Translate the Kafka settings into a librdkafka client config.
fn kafka_client_config(kafka: &KafkaSettings, group: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &kafka.brokers)
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set(
            "heartbeat.interval.ms",
            kafka.properties.heartbeat_interval.to_string(),
        )
        .set(
            "session.timeout.ms",
            kafka.properties.session_timeout.to_string(),
        )
        .set(
            "max.poll.interval.ms",
            kafka.properties.max_poll_interval.to_string(),
        )
        .set(
            "socket.timeout.ms",
            kafka.properties.request_timeout_overhead.to_string(),
        );

    let security = match (kafka.sasl.enable, kafka.tls.enable) {
        (true, true) => "sasl_ssl",
        (true, false) => "sasl_plaintext",
        (false, true) => "ssl",
        (false, false) => "plaintext",
    };
    config.set("security.protocol", security);

    if kafka.sasl.enable {
        config.set("sasl.mechanism", &kafka.sasl.mechanism);
        if kafka.sasl.mechanism == "GSSAPI" {
            config
                .set("sasl.kerberos.service.name", &kafka.sasl.gssapi.service_name)
                .set("sasl.kerberos.principal", &kafka.sasl.gssapi.username)
                .set("sasl.kerberos.keytab", &kafka.sasl.gssapi.key_tab_path);
        } else {
            config
                .set("sasl.username", &kafka.sasl.username)
                .set("sasl.password", &kafka.sasl.password);
        }
    }
    if kafka.tls.enable {
        if !kafka.tls.ca_cert_files.is_empty() {
            config.set("ssl.ca.location", &kafka.tls.ca_cert_files);
        }
        if !kafka.tls.client_cert_file.is_empty() {
            config.set("ssl.certificate.location", &kafka.tls.client_cert_file);
        }
        if !kafka.tls.client_key_file.is_empty() {
            config.set("ssl.key.location", &kafka.tls.client_key_file);
        }
        if kafka.tls.insecure_skip_verify {
            config.set("enable.ssl.certificate.verification", "false");
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, partition: i32, offset: i64) -> InputMessage {
        InputMessage {
            topic: topic.into(),
            partition,
            offset,
            key: Vec::new(),
            value: Vec::new(),
            timestamp: None,
        }
    }

    #[test]
    fn offsets_track_highest_per_partition() {
        let mut offsets = HashMap::new();
        note_offset(&mut offsets, &msg("t", 0, 5));
        note_offset(&mut offsets, &msg("t", 0, 3));
        note_offset(&mut offsets, &msg("t", 1, 1));
        assert_eq!(offsets[&("t".to_owned(), 0)], 6);
        assert_eq!(offsets[&("t".to_owned(), 1)], 2);
    }

    #[tokio::test]
    async fn epochs_commit_in_fifo_order() {
        // model of the committer ordering: epochs whose batches finish
        // late still gate later epochs
        let (tx, mut rx) = mpsc::channel::<FlushEpoch>(8);
        let committed = Arc::new(Mutex::new(Vec::new()));

        let sink = committed.clone();
        let committer = tokio::spawn(async move {
            while let Some(epoch) = rx.recv().await {
                epoch.wg.wait().await;
                let mut done = sink.lock().unwrap();
                for (key, next) in epoch.offsets {
                    done.push((key, next));
                }
            }
        });

        let wg1 = WaitGroup::new();
        wg1.add(1);
        tx.send(FlushEpoch {
            wg: wg1.clone(),
            offsets: vec![(("t".into(), 0), 10)],
        })
        .await
        .unwrap();

        let wg2 = WaitGroup::new();
        tx.send(FlushEpoch {
            wg: wg2,
            offsets: vec![(("t".into(), 0), 20)],
        })
        .await
        .unwrap();

        // epoch 2 is already complete, epoch 1 is not; nothing commits yet
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(committed.lock().unwrap().is_empty());

        wg1.done();
        drop(tx);
        committer.await.unwrap();

        let done = committed.lock().unwrap();
        assert_eq!(done.len(), 2);
        // strictly increasing per partition
        assert_eq!(done[0].1, 10);
        assert_eq!(done[1].1, 20);
    }

    #[test]
    fn kafka_config_maps_security_settings() {
        let mut kafka = KafkaSettings::default();
        kafka.sasl.enable = true;
        kafka.sasl.mechanism = "SCRAM-SHA-256".into();
        kafka.sasl.username = "u".into();
        kafka.tls.enable = true;
        let config = kafka_client_config(&kafka, "g1");
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("group.id"), Some("g1"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("sasl.username"), Some("u"));
    }
}
