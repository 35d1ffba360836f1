use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use simple_logger::SimpleLogger;
use sluice::{LocalFileSource, Sinker};

#[derive(Parser)]
#[command(
    name = "sluice",
    author,
    version,
    about = "Streams JSON and CSV records from Kafka into ClickHouse tables."
)]
struct SluiceArgs {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "/etc/sluice.json")]
    local_cfg_file: String,

    /// One of trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SluiceArgs::parse();
    let level = args
        .log_level
        .parse()
        .unwrap_or(log::LevelFilter::Info);
    SimpleLogger::new().with_level(level).init()?;

    let source = Arc::new(LocalFileSource::new(&args.local_cfg_file));
    let sinker = Arc::new(Sinker::new(source));
    // a broken bootstrap exits non-zero so the orchestrator restarts us
    sinker.init().await?;

    let watcher = {
        let sinker = sinker.clone();
        tokio::spawn(async move {
            if let Err(e) = sinker.run().await {
                error!("config watcher failed: {e:#}");
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    sinker.close().await;
    let _ = watcher.await;
    info!("bye");
    Ok(())
}
