use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::Settings;

/// A new configuration snapshot pushed by a source.
#[derive(Clone)]
pub struct ConfigUpdate {
    pub settings: Arc<Settings>,
    pub version: u64,
}

/// Abstract registry the fleet shares its configuration through.
///
/// Remote transports implement this outside the core; the in-tree
/// implementation reads a local JSON file and polls it for changes.
pub trait ConfigSource: Send + Sync + 'static {
    /// Fetch the current snapshot and its version.
    fn load(&self) -> Result<ConfigUpdate>;

    /// Stream subsequent snapshots into `tx` until cancelled. Only
    /// versions newer than the last delivered one are sent.
    fn subscribe(self: Arc<Self>, tx: mpsc::Sender<ConfigUpdate>, token: CancellationToken);

    /// Announce this process for fleet workload assignment.
    fn register(&self, host: &str, port: u16) -> Result<()>;
}

/// Config source backed by a local JSON file, reloaded on mtime change.
pub struct LocalFileSource {
    path: PathBuf,
    poll_interval: Duration,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(10),
        }
    }

    fn mtime_version(&self) -> u64 {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl ConfigSource for LocalFileSource {
    fn load(&self) -> Result<ConfigUpdate> {
        let path = self.path.display().to_string();
        let settings = Settings::from_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?;
        Ok(ConfigUpdate {
            settings: Arc::new(settings),
            version: self.mtime_version(),
        })
    }

    fn subscribe(self: Arc<Self>, tx: mpsc::Sender<ConfigUpdate>, token: CancellationToken) {
        tokio::spawn(async move {
            let mut last_version = self.mtime_version();
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,

                    _ = ticker.tick() => {
                        let version = self.mtime_version();
                        if version <= last_version {
                            continue;
                        }
                        match self.load() {
                            Ok(update) => {
                                last_version = update.version;
                                info!(
                                    "config file {} changed, version {}",
                                    self.path.display(),
                                    update.version
                                );
                                if tx.send(update).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to reload config: {e:#}");
                            }
                        }
                    }
                }
            }
        });
    }

    fn register(&self, host: &str, port: u16) -> Result<()> {
        // A local file carries no fleet registry; log for parity with
        // remote sources.
        info!("local config source: register {host}:{port} is a no-op");
        Ok(())
    }
}
