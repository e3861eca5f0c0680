//! Nitro Torrent CLI - Command-line host for the session engine
//!
//! Every invocation restores the session from resume data, applies one
//! command and flushes state again; `run` keeps the session alive.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use nitro_torrent_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "nitro-torrent")]
#[command(about = "A BitTorrent download engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level; `RUST_LOG` takes precedence
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory holding resume data
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Port for incoming peer connections
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    let options = commands::SessionOptions {
        state_dir: cli.state_dir,
        port: cli.port,
    };
    commands::handle_command(cli.command, options).await
}
