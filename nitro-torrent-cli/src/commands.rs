//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Subcommand, ValueEnum};
use nitro_torrent_core::torrent::parsing::BencodeTorrentParser;
use nitro_torrent_core::torrent::{DEFAULT_PIECE_SIZE, TorrentCreator};
use nitro_torrent_core::{
    EngineConfig, PeerSnapshot, SessionHandle, TorrentSnapshot, TorrentStatus,
    spawn_default_session,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Add a torrent from a magnet link or a .torrent file
    Add {
        /// Magnet link or path to torrent file
        source: String,
        /// Download directory
        #[arg(short, long, default_value = "downloads")]
        output: PathBuf,
    },
    /// Restore the session and transfer until interrupted
    Run {
        /// Stop once every torrent is seeding
        #[arg(long)]
        exit_on_complete: bool,
        /// Extra peer to try for every torrent (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
    },
    /// List torrents in the session
    List {
        #[arg(long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },
    /// Show connected peers of a torrent
    Peers {
        /// Torrent id (hex info-hash)
        id: String,
    },
    /// Pause a torrent
    Pause { id: String },
    /// Resume a paused torrent
    Resume { id: String },
    /// Cancel a torrent, keeping its files
    Cancel { id: String },
    /// Remove a torrent and its downloaded files
    Delete { id: String },
    /// Print the contents of a .torrent file
    Info { torrent: PathBuf },
    /// Create a .torrent file from a file or directory
    Create {
        /// Content to describe
        path: PathBuf,
        /// Where to write the torrent file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Piece size in bytes
        #[arg(long, default_value_t = DEFAULT_PIECE_SIZE)]
        piece_size: u32,
        /// Announce URL (repeatable)
        #[arg(long = "tracker")]
        trackers: Vec<String>,
        /// Mark the torrent private
        #[arg(long)]
        private: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Json,
    Table,
}

/// Session settings shared by every command.
pub struct SessionOptions {
    pub state_dir: Option<PathBuf>,
    pub port: Option<u16>,
}

impl SessionOptions {
    fn config(&self, listen: bool) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(dir) = &self.state_dir {
            config.storage.state_dir = dir.clone();
        }
        if let Some(port) = self.port {
            config.network.listen_port = Some(port);
        }
        if !listen {
            config.network.listen_port = None;
        }
        config
    }

    async fn open(&self, listen: bool, peers: Vec<SocketAddr>) -> anyhow::Result<SessionHandle> {
        spawn_default_session(self.config(listen), peers)
            .await
            .context("failed to start session")
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first failure of the command, with context
pub async fn handle_command(command: Commands, options: SessionOptions) -> anyhow::Result<()> {
    match command {
        Commands::Info { torrent } => return show_info(&torrent).await,
        Commands::Create {
            path,
            output,
            piece_size,
            trackers,
            private,
        } => return create_torrent(&path, output, piece_size, trackers, private).await,
        Commands::Run {
            exit_on_complete,
            peers,
        } => {
            let session = options.open(true, peers).await?;
            let result = run_session(&session, exit_on_complete).await;
            session.shutdown().await?;
            return result;
        }
        _ => {}
    }

    let session = options.open(false, Vec::new()).await?;
    let result = session_command(&session, command).await;
    session.shutdown().await?;
    result
}

async fn session_command(session: &SessionHandle, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Add { source, output } => {
            let id = if source.starts_with("magnet:") {
                session.add_magnet_link(&source, output).await?
            } else {
                session.add_torrent_file(&source, output).await?
            };
            println!("{id}");
        }
        Commands::List { format } => {
            let torrents = session.get_torrents().await;
            match format {
                ListFormat::Json => println!("{}", serde_json::to_string_pretty(&torrents)?),
                ListFormat::Table => print_torrents(&torrents),
            }
        }
        Commands::Peers { id } => {
            // Freshly restored swarms need a moment to connect
            tokio::time::sleep(Duration::from_secs(3)).await;
            print_peers(&session.get_torrent_peers(&id).await?);
        }
        Commands::Pause { id } => session.pause_torrent(&id).await?,
        Commands::Resume { id } => session.resume_torrent(&id).await?,
        Commands::Cancel { id } => session.cancel_torrent(&id).await?,
        Commands::Delete { id } => session.delete_torrent(&id).await?,
        Commands::Run { .. } | Commands::Info { .. } | Commands::Create { .. } => {}
    }
    Ok(())
}

async fn run_session(session: &SessionHandle, exit_on_complete: bool) -> anyhow::Result<()> {
    if let Some(addr) = session.listen_addr() {
        println!("Listening on {addr}");
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, saving state");
                return Ok(());
            }
            _ = ticker.tick() => {
                let torrents = session.get_torrents().await;
                print_torrents(&torrents);
                if exit_on_complete && !torrents.is_empty() && torrents.iter().all(is_finished) {
                    println!("All torrents complete");
                    return Ok(());
                }
            }
        }
    }
}

fn is_finished(torrent: &TorrentSnapshot) -> bool {
    matches!(
        torrent.status,
        TorrentStatus::Seeding | TorrentStatus::Canceled | TorrentStatus::Error
    )
}

fn print_torrents(torrents: &[TorrentSnapshot]) {
    if torrents.is_empty() {
        println!("No torrents");
        return;
    }
    println!(
        "{:<40}  {:<11}  {:>6}  {:>10}  {:>10}  {:>5}  NAME",
        "ID", "STATUS", "DONE", "DOWN/s", "UP/s", "PEERS"
    );
    for torrent in torrents {
        println!(
            "{:<40}  {:<11}  {:>5.1}%  {:>10}  {:>10}  {:>5}  {}",
            torrent.id,
            torrent.status,
            torrent.progress * 100.0,
            format_bytes(torrent.download_rate),
            format_bytes(torrent.upload_rate),
            torrent.peer_count,
            torrent.name
        );
        if let Some(error) = &torrent.error {
            println!("    error: {error}");
        }
    }
}

fn print_peers(peers: &[PeerSnapshot]) {
    if peers.is_empty() {
        println!("No peers");
        return;
    }
    println!(
        "{:<22}  {:<20}  {:>6}  {:>10}  {:>10}  FLAGS",
        "ENDPOINT", "CLIENT", "HAS", "DOWN/s", "UP/s"
    );
    for peer in peers {
        println!(
            "{:<22}  {:<20}  {:>5.1}%  {:>10}  {:>10}  {}",
            peer.endpoint,
            peer.client,
            peer.progress * 100.0,
            format_bytes(peer.download_rate),
            format_bytes(peer.upload_rate),
            peer.flags
        );
    }
}

async fn show_info(path: &Path) -> anyhow::Result<()> {
    let metainfo = BencodeTorrentParser::new()
        .parse_torrent_file(path)
        .await
        .with_context(|| format!("cannot parse {}", path.display()))?;
    let info = &metainfo.info;

    println!("Name:       {}", info.name);
    println!("Info hash:  {}", info.info_hash);
    println!("Size:       {} ({} bytes)", format_bytes(info.total_length), info.total_length);
    println!(
        "Pieces:     {} x {}",
        info.piece_count(),
        format_bytes(u64::from(info.piece_length))
    );
    println!("Private:    {}", if info.private { "yes" } else { "no" });
    for tracker in &metainfo.trackers {
        println!("Tracker:    {tracker}");
    }
    println!("Files:");
    for file in &info.files {
        println!("  {:>10}  {}", format_bytes(file.length), file.path.display());
    }
    Ok(())
}

async fn create_torrent(
    path: &Path,
    output: Option<PathBuf>,
    piece_size: u32,
    trackers: Vec<String>,
    private: bool,
) -> anyhow::Result<()> {
    if piece_size == 0 {
        bail!("piece size must be positive");
    }
    let bytes = TorrentCreator::with_piece_size(piece_size)
        .with_trackers(trackers)
        .private(private)
        .create_from_path(path)
        .await?;

    let output = match output {
        Some(output) => output,
        None => {
            let name = path
                .file_name()
                .context("content path has no file name")?
                .to_string_lossy();
            PathBuf::from(format!("{name}.torrent"))
        }
    };
    tokio::fs::write(&output, &bytes)
        .await
        .with_context(|| format!("cannot write {}", output.display()))?;

    let metainfo = BencodeTorrentParser::new().parse_torrent_data(&bytes)?;
    println!("{}  {}", metainfo.info.info_hash, output.display());
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = TestCli::parse_from([
            "nitro-torrent",
            "run",
            "--exit-on-complete",
            "--peer",
            "127.0.0.1:6881",
        ]);
        match cli.command {
            Commands::Run {
                exit_on_complete,
                peers,
            } => {
                assert!(exit_on_complete);
                assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_list_format() {
        let cli = TestCli::parse_from(["nitro-torrent", "list", "--format", "json"]);
        assert!(matches!(
            cli.command,
            Commands::List {
                format: ListFormat::Json
            }
        ));
    }
}
