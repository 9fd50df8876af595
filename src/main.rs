use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};
use peer_tracker::utils::setup_logging;
use peer_tracker::{Console, PeerAgent, PeerConfig, PeerConsole, Result, Tracker, TrackerConfig};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "peer-tracker")]
#[command(about = "A file tracker and the peers that share files through it")]
#[command(version)]
struct Cli {
    /// Default log level (RUST_LOG overrides per module)
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker with its operator console
    Tracker {
        /// Port to listen on for peer control connections
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(short, long)]
        bind: Option<String>,
        /// Seconds to wait for a PONG
        #[arg(long)]
        ping_timeout: Option<u64>,
        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a peer and its interactive console
    Peer {
        /// Unique name of this peer
        #[arg(short = 'n', long)]
        hostname: Option<String>,
        /// Tracker address (host:port)
        #[arg(short, long)]
        tracker: Option<String>,
        /// Port to serve transfers on
        #[arg(short = 'p', long)]
        transfer_port: Option<u16>,
        /// Shared folder for downloads
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level);

    match cli.command {
        Commands::Tracker {
            port,
            bind,
            ping_timeout,
            config,
        } => {
            let mut config = match config {
                Some(path) => TrackerConfig::from_json_file(&path)?,
                None => TrackerConfig::default(),
            };
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(secs) = ping_timeout {
                config.ping_timeout_secs = secs;
            }
            config.validate()?;

            run_tracker(config).await?;
        }
        Commands::Peer {
            hostname,
            tracker,
            transfer_port,
            dir,
            config,
        } => {
            let mut config = match config {
                Some(path) => PeerConfig::from_json_file(&path)?,
                None => PeerConfig::default(),
            };
            if let Some(hostname) = hostname {
                config.hostname = hostname;
            }
            if let Some(tracker) = tracker {
                config.tracker_addr = tracker;
            }
            if let Some(port) = transfer_port {
                config.transfer_port = port;
            }
            if let Some(dir) = dir {
                config.shared_dir = dir;
            }
            config.validate()?;

            run_peer(config).await?;
        }
    }

    Ok(())
}

async fn run_tracker(config: TrackerConfig) -> Result<()> {
    let ping_timeout = config.ping_timeout();
    let tracker = Tracker::bind(config).await?;
    let shutdown = tracker.shutdown_token();
    let console = Console::new(tracker.registry(), shutdown.clone(), ping_timeout);

    // The tracker keeps running if stdin closes.
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = console.run(stdin, tokio::io::stdout()).await {
            warn!("Console stopped: {}", e);
        }
    });

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            ctrl_c.cancel();
        }
    });

    tracker.run().await
}

async fn run_peer(config: PeerConfig) -> Result<()> {
    let agent = PeerAgent::start(config).await?;
    let shutdown = CancellationToken::new();

    {
        let console = PeerConsole::new(&agent, shutdown.clone());
        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            result = console.run(stdin, tokio::io::stdout()) => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                shutdown.cancel();
            }
        }
    }

    agent.shutdown().await;
    Ok(())
}
