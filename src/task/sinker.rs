use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigSource, Settings, TaskSettings};
use crate::db::clickhouse::pool::ShardConnPool;
use crate::util::RecordGate;

use super::Consumer;

/// Owns the configuration lifecycle: builds consumer groups from the
/// current snapshot, and on reload stops removed groups, starts added
/// ones and restarts groups whose task set changed.
pub struct Sinker {
    source: Arc<dyn ConfigSource>,
    current: Mutex<Option<Arc<Settings>>>,
    runtime: Mutex<Option<SharedRuntime>>,
    consumers: tokio::sync::Mutex<HashMap<String, Arc<Consumer>>>,
    token: CancellationToken,
}

/// Process-wide pieces rebuilt only when the ClickHouse or Kafka
/// sections change.
#[derive(Clone)]
struct SharedRuntime {
    conn_pool: Arc<ShardConnPool>,
    gate: Arc<RecordGate>,
}

impl Sinker {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            current: Mutex::new(None),
            runtime: Mutex::new(None),
            consumers: tokio::sync::Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
        }
    }

    /// Load the initial snapshot and start all consumer groups.
    pub async fn init(&self) -> Result<()> {
        let update = self.source.load()?;
        self.apply(update.settings).await
    }

    /// Follow configuration updates until `close` is called.
    pub async fn run(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(4);
        self.source.clone().subscribe(tx, self.token.clone());
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                update = rx.recv() => {
                    let Some(update) = update else { break };
                    info!("applying config version {}", update.version);
                    if let Err(e) = self.apply(update.settings).await {
                        error!("failed to apply new config: {e:#}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop every consumer group and shut down.
    pub async fn close(&self) {
        self.token.cancel();
        let mut consumers = self.consumers.lock().await;
        for (group, consumer) in consumers.drain() {
            info!("stopping consumer group {group}");
            consumer.stop().await;
        }
    }

    pub fn current_config(&self) -> Option<Arc<Settings>> {
        self.current.lock().unwrap().clone()
    }

    pub async fn consumer(&self, group: &str) -> Option<Arc<Consumer>> {
        self.consumers.lock().await.get(group).cloned()
    }

    async fn apply(&self, new_cfg: Arc<Settings>) -> Result<()> {
        let prev = self.current.lock().unwrap().clone();

        // connection-level changes invalidate every consumer
        let full_restart = match &prev {
            Some(prev) => {
                prev.clickhouse != new_cfg.clickhouse
                    || prev.kafka != new_cfg.kafka
                    || prev.record_pool_size != new_cfg.record_pool_size
            }
            None => true,
        };

        let mut consumers = self.consumers.lock().await;
        if full_restart {
            for (group, consumer) in consumers.drain() {
                info!("stopping consumer group {group} for connection change");
                consumer.stop().await;
            }
            let conn_pool = Arc::new(
                ShardConnPool::new(&new_cfg.clickhouse).context("bad clickhouse settings")?,
            );
            conn_pool.ping().await?;
            *self.runtime.lock().unwrap() = Some(SharedRuntime {
                conn_pool,
                gate: Arc::new(RecordGate::new(new_cfg.record_pool_size)),
            });
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap()
            .clone()
            .expect("runtime initialized above");

        let groups = group_tasks(&new_cfg.tasks);

        // stop groups that disappeared
        let removed: Vec<String> = consumers
            .keys()
            .filter(|name| !groups.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(consumer) = consumers.remove(&name) {
                info!("stopping removed consumer group {name}");
                consumer.stop().await;
            }
        }

        for (name, task_cfgs) in groups {
            match consumers.get(&name) {
                Some(existing) if task_sets_equal(existing.task_settings(), &task_cfgs) => {
                    // unchanged group keeps running
                }
                Some(existing) => {
                    info!("restarting consumer group {name} for changed tasks");
                    existing.stop().await;
                    consumers.remove(&name);
                    let consumer = Consumer::new(
                        new_cfg.clone(),
                        name.clone(),
                        task_cfgs,
                        runtime.conn_pool.clone(),
                        runtime.gate.clone(),
                    );
                    consumer.start().await?;
                    consumers.insert(name, consumer);
                }
                None => {
                    info!("starting consumer group {name}");
                    let consumer = Consumer::new(
                        new_cfg.clone(),
                        name.clone(),
                        task_cfgs,
                        runtime.conn_pool.clone(),
                        runtime.gate.clone(),
                    );
                    consumer.start().await?;
                    consumers.insert(name, consumer);
                }
            }
        }

        *self.current.lock().unwrap() = Some(new_cfg);
        Ok(())
    }
}

fn group_tasks(tasks: &[Arc<TaskSettings>]) -> HashMap<String, Vec<Arc<TaskSettings>>> {
    let mut groups: HashMap<String, Vec<Arc<TaskSettings>>> = HashMap::new();
    for task in tasks {
        groups
            .entry(task.consumer_group.clone())
            .or_default()
            .push(task.clone());
    }
    groups
}

fn task_sets_equal(a: &[Arc<TaskSettings>], b: &[Arc<TaskSettings>]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(left, right)| left == right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, group: &str) -> Arc<TaskSettings> {
        Arc::new(TaskSettings {
            name: name.into(),
            topic: name.into(),
            consumer_group: group.into(),
            table_name: name.into(),
            ..TaskSettings::default()
        })
    }

    #[test]
    fn tasks_group_by_consumer_group() {
        let tasks = vec![task("a", "g1"), task("b", "g1"), task("c", "g2")];
        let groups = group_tasks(&tasks);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["g1"].len(), 2);
        assert_eq!(groups["g2"].len(), 1);
    }

    #[test]
    fn task_set_diffing() {
        let a = vec![task("a", "g1")];
        assert!(task_sets_equal(&a, &[task("a", "g1")]));
        assert!(!task_sets_equal(&a, &[task("b", "g1")]));
        assert!(!task_sets_equal(&a, &[]));

        let mut changed = TaskSettings::clone(&a[0]);
        changed.buffer_size *= 2;
        assert!(!task_sets_equal(&a, &[Arc::new(changed)]));
    }
}
