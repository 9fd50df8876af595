use log::warn;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::PeerAgent;
use crate::core::FileLocation;
use crate::network::Transport;
use crate::transfer::TransferProgress;
use crate::utils::{P2PError, Result};

/// Fetch progress is shown each time a transfer crosses another quarter.
const PROGRESS_STEP: u64 = 25;

const HELP: &str = "\
Available peer commands:
  publish <path> [name] : share a local file, optionally under another name
  unpublish <name>      : stop sharing a file
  query <name>          : show which peers have a file
  fetch <name>          : download a file from another peer
  mine                  : files this peer has published
  peers                 : hostnames registered with the tracker
  discover <hostname>   : files published by another peer
  list                  : files in the shared folder
  quit                  : unregister and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Publish { path: PathBuf, name: String },
    Unpublish(String),
    Query(String),
    Fetch(String),
    Mine,
    Peers,
    Discover(String),
    List,
    Help,
    Quit,
}

impl PeerCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(None);
        };

        let arg = |parts: &mut std::str::SplitWhitespace<'_>, usage: &str| {
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| P2PError::ParseError(format!("usage: {}", usage)))
        };

        let command = match cmd.to_ascii_lowercase().as_str() {
            "publish" => {
                let path = arg(&mut parts, "publish <path> [name]")?;
                let name = match parts.next() {
                    Some(name) => name.to_string(),
                    None => default_name(Path::new(&path))?,
                };
                PeerCommand::Publish {
                    path: PathBuf::from(path),
                    name,
                }
            }
            "unpublish" => PeerCommand::Unpublish(arg(&mut parts, "unpublish <name>")?),
            "query" => PeerCommand::Query(arg(&mut parts, "query <name>")?),
            "fetch" => PeerCommand::Fetch(arg(&mut parts, "fetch <name>")?),
            "mine" => PeerCommand::Mine,
            "peers" => PeerCommand::Peers,
            "discover" => PeerCommand::Discover(arg(&mut parts, "discover <hostname>")?),
            "list" | "ls" => PeerCommand::List,
            "help" => PeerCommand::Help,
            "quit" | "exit" => PeerCommand::Quit,
            other => {
                return Err(P2PError::ParseError(format!("unknown command '{}'", other)));
            }
        };
        Ok(Some(command))
    }
}

/// Published name for a path when none is given: its final component.
fn default_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| P2PError::ParseError(format!("cannot derive a name from '{}'", path.display())))
}

/// Interactive front end for a [`PeerAgent`].
///
/// Progress lines produced while a command runs are queued and written by
/// [`PeerConsole::run`] as they arrive.
pub struct PeerConsole<'a> {
    agent: &'a PeerAgent,
    shutdown: CancellationToken,
    updates_tx: mpsc::UnboundedSender<String>,
    updates_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl<'a> PeerConsole<'a> {
    pub fn new(agent: &'a PeerAgent, shutdown: CancellationToken) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            agent,
            shutdown,
            updates_tx,
            updates_rx: Mutex::new(updates_rx),
        }
    }

    /// Runs one command line and renders its output. The boolean is true
    /// once `quit` was issued.
    pub async fn execute(&self, line: &str) -> (String, bool) {
        let command = match PeerCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return (String::new(), false),
            Err(P2PError::ParseError(msg)) => return (msg, false),
            Err(e) => return (e.to_string(), false),
        };

        if command == PeerCommand::Quit {
            self.shutdown.cancel();
            return ("Leaving the network...".to_string(), true);
        }

        let out = match self.render(command).await {
            Ok(out) => out,
            Err(e) => format!("error: {}", e),
        };
        (out.trim_end().to_string(), false)
    }

    async fn render(&self, command: PeerCommand) -> Result<String> {
        let mut out = String::new();
        match command {
            PeerCommand::Publish { path, name } => {
                let size = self.agent.publish(&path, &name).await?;
                let _ = write!(out, "Published '{}' ({} bytes)", name, size);
            }
            PeerCommand::Unpublish(name) => {
                self.agent.unpublish(&name).await?;
                let _ = write!(out, "Unpublished '{}'", name);
            }
            PeerCommand::Query(name) => {
                let locations = self.agent.query(&name).await?;
                if locations.is_empty() {
                    let _ = write!(out, "No peer has '{}'", name);
                }
                for location in locations {
                    let _ = writeln!(out, "  - {}", location);
                }
            }
            PeerCommand::Fetch(name) => {
                let last = std::sync::Mutex::new((String::new(), 0u64));
                let on_progress = |peer: &FileLocation, progress: TransferProgress| {
                    let step = progress.percent() / PROGRESS_STEP * PROGRESS_STEP;
                    let Ok(mut last) = last.lock() else {
                        return;
                    };
                    if last.0 != peer.hostname {
                        *last = (peer.hostname.clone(), 0);
                    }
                    if step > last.1 {
                        last.1 = step;
                        let _ = self.updates_tx.send(format!(
                            "  {}: {}% ({}/{} bytes)",
                            peer.hostname, step, progress.received, progress.total
                        ));
                    }
                };
                let report = self.agent.fetch_with_progress(&name, &on_progress).await?;
                if report.candidates.is_empty() {
                    let _ = write!(out, "No other peer has '{}'", name);
                }
                for attempt in &report.attempts {
                    let _ = match &attempt.result {
                        Ok(outcome) => writeln!(
                            out,
                            "  {}: ok, {} bytes saved to {}",
                            attempt.peer.hostname,
                            outcome.bytes,
                            outcome.path.display()
                        ),
                        Err(e) => writeln!(out, "  {}: failed: {}", attempt.peer.hostname, e),
                    };
                }
                if !report.candidates.is_empty() && report.succeeded().is_none() {
                    let _ = write!(out, "Could not fetch '{}' from any peer", name);
                }
            }
            PeerCommand::Mine => {
                let files = self.agent.list_mine().await?;
                let _ = writeln!(out, "Published by '{}' ({}):", self.agent.hostname(), files.len());
                for file in files {
                    let _ = writeln!(out, "  - {}", file);
                }
            }
            PeerCommand::Peers => {
                let peers = self.agent.list_peers().await?;
                let _ = writeln!(out, "Registered peers ({}):", peers.len());
                for peer in peers {
                    let _ = writeln!(out, "  - {}", peer);
                }
            }
            PeerCommand::Discover(hostname) => {
                let files = self.agent.discover(&hostname).await?;
                let _ = writeln!(out, "Files shared by '{}':", hostname);
                if files.is_empty() {
                    out.push_str("  (no files)");
                }
                for file in files {
                    let _ = writeln!(out, "  - {}", file);
                }
            }
            PeerCommand::List => {
                let files = self.agent.list_local().await?;
                let _ = writeln!(out, "Local files in {}:", self.agent.shared_dir().display());
                if files.is_empty() {
                    out.push_str("  (empty)");
                }
                for file in files {
                    let _ = writeln!(out, "  - {} ({} bytes)", file.name, file.size);
                }
            }
            PeerCommand::Help => out.push_str(HELP),
            PeerCommand::Quit => {}
        }
        Ok(out)
    }

    /// Reads commands until `quit`, end of input, or `shutdown` fires.
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
                line = Transport::read_line(&mut input, 4096) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Console input error: {}", e);
                    continue;
                }
            };

            let (text, quit) = {
                let mut updates = self.updates_rx.lock().await;
                while updates.try_recv().is_ok() {}

                let command = self.execute(&line);
                tokio::pin!(command);
                let done = loop {
                    tokio::select! {
                        biased;
                        Some(update) = updates.recv() => {
                            output.write_all(format!("{}\n", update).as_bytes()).await?;
                            output.flush().await?;
                        }
                        done = &mut command => break done,
                    }
                };
                while let Ok(update) = updates.try_recv() {
                    output.write_all(format!("{}\n", update).as_bytes()).await?;
                }
                done
            };
            if !text.is_empty() {
                output.write_all(format!("{}\n", text).as_bytes()).await?;
                output.flush().await?;
            }
            if quit {
                break;
            }
            if !self.agent.is_connected() {
                output.write_all(b"Lost connection to the tracker\n").await?;
                output.flush().await?;
                break;
            }
        }
        Ok(())
    }
}
