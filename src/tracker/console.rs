use log::{info, warn};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::network::Transport;
use crate::tracker::Registry;
use crate::utils::{P2PError, Result};

const HELP: &str = "\
Available tracker commands:
  discover <hostname>  : list files published by a peer
  ping <hostname>      : check whether a peer answers on its control connection
  list                 : list registered peers
  files                : list all published files
  quit                 : shut down the tracker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Discover(String),
    Ping(String),
    List,
    Files,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(None);
        };

        let host = |parts: &mut std::str::SplitWhitespace<'_>, usage: &str| {
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| P2PError::ParseError(format!("usage: {}", usage)))
        };

        let command = match cmd.to_ascii_lowercase().as_str() {
            "discover" => ConsoleCommand::Discover(host(&mut parts, "discover <hostname>")?),
            "ping" => ConsoleCommand::Ping(host(&mut parts, "ping <hostname>")?),
            "list" => ConsoleCommand::List,
            "files" => ConsoleCommand::Files,
            "help" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => {
                return Err(P2PError::ParseError(format!("unknown command '{}'", other)));
            }
        };
        Ok(Some(command))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingStatus {
    Reachable(Duration),
    Unreachable(String),
    UnknownHost,
}

/// Operator console acting directly on the registry.
pub struct Console {
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    ping_timeout: Duration,
}

impl Console {
    pub fn new(registry: Arc<Registry>, shutdown: CancellationToken, ping_timeout: Duration) -> Self {
        Self {
            registry,
            shutdown,
            ping_timeout,
        }
    }

    /// Filenames published by `hostname`, each flagged with whether the
    /// host is the file's origin.
    pub async fn discover(&self, hostname: &str) -> Result<Vec<(String, bool)>> {
        self.registry
            .files_of(hostname)
            .await
            .ok_or_else(|| P2PError::UnknownHost(hostname.to_string()))
    }

    /// Pings the peer over its existing control connection. A failed ping
    /// is reported but leaves the registration in place.
    pub async fn ping(&self, hostname: &str) -> PingStatus {
        let Some(record) = self.registry.peer_info(hostname).await else {
            return PingStatus::UnknownHost;
        };

        match record.control.ping(self.ping_timeout).await {
            Ok(rtt) => PingStatus::Reachable(rtt),
            Err(e) => {
                warn!("Ping to '{}' failed: {}", hostname, e);
                PingStatus::Unreachable(e.to_string())
            }
        }
    }

    pub fn quit(&self) {
        info!("Shutdown requested from console");
        self.shutdown.cancel();
    }

    /// Runs one command line and renders its output. The boolean is true
    /// once `quit` was issued.
    pub async fn execute(&self, line: &str) -> (String, bool) {
        let command = match ConsoleCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return (String::new(), false),
            Err(P2PError::ParseError(msg)) => return (msg, false),
            Err(e) => return (e.to_string(), false),
        };

        let mut out = String::new();
        match command {
            ConsoleCommand::Discover(hostname) => match self.discover(&hostname).await {
                Ok(files) => {
                    let _ = writeln!(out, "Files shared by '{}':", hostname);
                    if files.is_empty() {
                        out.push_str("  (no files)");
                    }
                    for (filename, origin) in files {
                        let mark = if origin { " (origin)" } else { "" };
                        let _ = writeln!(out, "  - {}{}", filename, mark);
                    }
                }
                Err(_) => {
                    let _ = write!(out, "unknown host '{}'", hostname);
                }
            },
            ConsoleCommand::Ping(hostname) => {
                let _ = match self.ping(&hostname).await {
                    PingStatus::Reachable(rtt) => {
                        write!(out, "'{}' is reachable (rtt {:.1?})", hostname, rtt)
                    }
                    PingStatus::Unreachable(reason) => {
                        write!(out, "'{}' is unreachable: {}", hostname, reason)
                    }
                    PingStatus::UnknownHost => write!(out, "unknown host '{}'", hostname),
                };
            }
            ConsoleCommand::List => {
                let peers = self.registry.all_peers().await;
                let _ = writeln!(out, "Registered peers ({}):", peers.len());
                if peers.is_empty() {
                    out.push_str("  (none)");
                }
                for peer in peers {
                    let _ = writeln!(out, "  - {}", peer);
                }
            }
            ConsoleCommand::Files => {
                let files = self.registry.all_files().await;
                let _ = writeln!(out, "Available files ({}):", files.len());
                if files.is_empty() {
                    out.push_str("  (none)");
                }
                for (filename, hosts) in files {
                    let origin = hosts.first().cloned().unwrap_or_default();
                    let _ = writeln!(
                        out,
                        "  - {} (origin: {}, available on: {})",
                        filename,
                        origin,
                        hosts.join(", ")
                    );
                }
            }
            ConsoleCommand::Help => out.push_str(HELP),
            ConsoleCommand::Quit => {
                self.quit();
                out.push_str("Shutting down tracker...");
                return (out, true);
            }
        }

        (out.trim_end().to_string(), false)
    }

    /// Reads commands until `quit`, end of input, or tracker shutdown.
    pub async fn run<R, W>(&self, mut input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        output.write_all(format!("{}\n", HELP).as_bytes()).await?;
        output.flush().await?;

        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = Transport::read_line(&mut input, 1024) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Console input error: {}", e);
                    continue;
                }
            };

            let (text, quit) = self.execute(&line).await;
            if !text.is_empty() {
                output.write_all(format!("{}\n", text).as_bytes()).await?;
                output.flush().await?;
            }
            if quit {
                break;
            }
        }
        Ok(())
    }
}
