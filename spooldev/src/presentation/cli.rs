use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "spooldev CLI (alpha)", long_about = None)]
pub struct Cli {
    /// JSON config file; missing fields take their defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Print the persisted session, if any
    Show {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Delete the persisted session and its spooled chunks
    Clear {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a synthetic session against an in-memory remote
    Simulate {
        /// state directory for the snapshot and chunk spool
        #[arg(long)]
        dir: PathBuf,

        #[arg(long, default_value_t = 8)]
        chunks: u32,

        #[arg(long, default_value_t = 64 * 1024)]
        chunk_size: usize,

        /// INDEX:K fails chunk INDEX for its first K attempts (repeatable)
        #[arg(long = "flaky", value_parser = parse_flaky)]
        flaky: Vec<(u32, u32)>,

        /// chunk index whose uploads never succeed (repeatable)
        #[arg(long = "broken")]
        broken: Vec<u32>,

        /// abandon the session after this many chunks, leaving the snapshot on disk
        #[arg(long)]
        crash_after: Option<u32>,

        /// after a crash, run recovery and finish the upload
        #[arg(long)]
        recover: bool,
    },

    #[command(subcommand)]
    /// Inspect or clear the persisted session
    Snapshot(SnapshotCommands),

    /// Print the retry backoff schedule
    Backoff {
        /// override the configured max_retries
        #[arg(long)]
        retries: Option<u32>,
    },
}

fn parse_flaky(s: &str) -> Result<(u32, u32), String> {
    let (index, times) = s
        .split_once(':')
        .ok_or_else(|| format!("expected INDEX:K, got {s:?}"))?;
    let index = index
        .parse()
        .map_err(|e| format!("bad chunk index {index:?}: {e}"))?;
    let times = times
        .parse()
        .map_err(|e| format!("bad failure count {times:?}: {e}"))?;
    Ok((index, times))
}
