pub mod handlers;

use crate::presentation::cli::{Cli, Commands, SnapshotCommands};
use clap::Parser;
use spool_core::config::SpoolConfig;
use spool_core::error::Result;
use tracing::debug;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SpoolConfig::load(path)?,
        None => SpoolConfig::default(),
    };
    debug!(?config, "configuration loaded");
    match cli.command {
        Commands::Simulate {
            dir,
            chunks,
            chunk_size,
            flaky,
            broken,
            crash_after,
            recover,
        } => {
            let plan = handlers::SimulationPlan {
                chunks,
                chunk_size,
                flaky,
                broken,
                crash_after,
                recover,
            };
            handlers::handle_simulate(&config, dir, plan).await
        }
        Commands::Snapshot(cmd) => match cmd {
            SnapshotCommands::Show { dir } => handlers::handle_snapshot_show(&config, dir),
            SnapshotCommands::Clear { dir } => handlers::handle_snapshot_clear(&config, dir),
        },
        Commands::Backoff { retries } => handlers::handle_backoff(&config, retries),
    }
}
