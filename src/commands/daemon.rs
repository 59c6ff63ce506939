use anyhow::Result;
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::commands::open_engine;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run the periodic sync loop in the foreground until Ctrl+C.
pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let engine = open_engine(config_file, true).await?;

    // One forced sweep on startup so records left over from the last run are
    // corrected before the first tick.
    let report = engine.registry().sync_all(true).await;
    let installs = engine.registry().list().len();

    if std::io::stdout().is_terminal() {
        println!(
            "  {} watching {} installs ({} corrected at startup)",
            "appkeeper".bold(),
            installs.to_string().cyan(),
            report.corrected
        );
    } else {
        println!(
            "  appkeeper watching {} installs ({} corrected at startup)",
            installs, report.corrected
        );
    }

    engine.spawn_sync_loop();
    tokio::signal::ctrl_c().await.ok();
    eprintln!("\nShutting down...");

    if !engine.shutdown(SHUTDOWN_GRACE).await {
        warn!("Shutdown timed out -- some operations were abandoned mid-way");
    }
    Ok(())
}
