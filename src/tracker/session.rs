use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::core::{Reply, ReplyError, Request};
use crate::network::{ControlHandle, Transport, run_writer};
use crate::tracker::Registry;
use crate::utils::{P2PError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered { hostname: String },
    Closed,
}

/// Protocol state of one control connection.
///
/// Owns no socket: it turns request lines into replies and registry
/// mutations, which keeps it usable without a network in tests.
pub struct Session {
    registry: Arc<Registry>,
    control: Arc<ControlHandle>,
    address: IpAddr,
    state: SessionState,
}

impl Session {
    pub fn new(registry: Arc<Registry>, control: Arc<ControlHandle>) -> Self {
        let address = control.remote_addr().ip();
        Self {
            registry,
            control,
            address,
            state: SessionState::Unregistered,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn hostname(&self) -> Option<&str> {
        match &self.state {
            SessionState::Registered { hostname } => Some(hostname),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Handles one request line. Returns the reply to send, if any: a
    /// `PONG` answering a tracker PING gets none.
    pub async fn handle_line(&mut self, line: &str) -> Option<Reply> {
        if self.is_closed() {
            return None;
        }

        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed command from {}: {}", self.control.remote_addr(), e);
                let detail = match e {
                    P2PError::ParseError(detail) => detail,
                    other => other.to_string(),
                };
                return Some(Reply::error(ReplyError::Parse, detail));
            }
        };

        debug!("{} <- {}", self.control.remote_addr(), request);

        if let Request::Pong = request {
            if !self.control.resolve_pong().await {
                debug!("Unsolicited PONG from {}", self.control.remote_addr());
            }
            return None;
        }

        let hostname = match (&self.state, &request) {
            (_, Request::Register { .. }) => None,
            (SessionState::Registered { hostname }, _) => Some(hostname.clone()),
            _ => return Some(Reply::not_registered()),
        };

        let reply = match (request, hostname) {
            (
                Request::Register {
                    hostname,
                    transfer_port,
                },
                _,
            ) => self.register(hostname, transfer_port).await,
            (Request::Unregister, Some(hostname)) => {
                self.registry
                    .deregister_connection(&hostname, self.control.id())
                    .await;
                self.state = SessionState::Closed;
                Reply::Ok
            }
            (Request::Publish { filename, size }, Some(hostname)) => {
                match self.registry.publish(&hostname, &filename, size).await {
                    Ok(()) => Reply::Ok,
                    Err(_) => Reply::not_registered(),
                }
            }
            (Request::Unpublish { filename }, Some(hostname)) => {
                self.registry.unpublish(&hostname, &filename).await;
                Reply::Ok
            }
            (Request::Query { filename }, Some(_)) => {
                Reply::Peers(self.registry.lookup(&filename).await)
            }
            (Request::ListMine, Some(hostname)) => {
                let files = self.registry.files_of(&hostname).await.unwrap_or_default();
                Reply::Files(files.into_iter().map(|(name, _)| name).collect())
            }
            (Request::ListPeers, Some(_)) => Reply::PeerList(
                self.registry
                    .all_peers()
                    .await
                    .into_iter()
                    .map(|p| p.hostname)
                    .collect(),
            ),
            (Request::Discover { hostname: target }, Some(_)) => {
                match self.registry.files_of(&target).await {
                    Some(files) => Reply::Files(files.into_iter().map(|(name, _)| name).collect()),
                    None => Reply::error(ReplyError::UnknownHost, target),
                }
            }
            (Request::Ping, Some(_)) => Reply::Pong,
            (_, None) => Reply::not_registered(),
            (Request::Pong, _) => return None,
        };

        Some(reply)
    }

    async fn register(&mut self, hostname: String, transfer_port: u16) -> Reply {
        if let SessionState::Registered { hostname: previous } = &self.state {
            if *previous != hostname {
                self.registry
                    .deregister_connection(previous, self.control.id())
                    .await;
            }
        }

        let replaced = self
            .registry
            .register(&hostname, self.address, transfer_port, self.control.clone())
            .await;

        if let Some(old) = replaced {
            if old.connection_id() != self.control.id() {
                info!(
                    "Closing previous control connection of '{}' ({})",
                    hostname,
                    old.control.remote_addr()
                );
                old.control.close();
            }
        }

        self.state = SessionState::Registered { hostname };
        Reply::Ok
    }

    /// Moves to `Closed`, dropping this connection's registration.
    pub async fn close(&mut self) {
        if let SessionState::Registered { hostname } = &self.state {
            self.registry
                .deregister_connection(hostname, self.control.id())
                .await;
        }
        self.state = SessionState::Closed;
    }
}

/// Serves one accepted control connection until the peer leaves, the
/// connection breaks, or `cancel` fires.
pub async fn run_session(
    stream: TcpStream,
    remote: SocketAddr,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    max_line_len: usize,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (control, outbound) = ControlHandle::new(remote, cancel.clone());
    let writer = tokio::spawn(run_writer(outbound, write_half, cancel.clone()));
    let mut session = Session::new(registry, control.clone());

    let outcome = loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Session {} cancelled", remote);
                break Ok(());
            }
            line = Transport::read_line(&mut reader, max_line_len) => line,
        };

        match line {
            Ok(Some(line)) => {
                if let Some(reply) = session.handle_line(&line).await {
                    debug!("{} -> {}", remote, reply);
                    if let Err(e) = control.send_line(reply.to_string()) {
                        break Err(e);
                    }
                }
                if session.is_closed() {
                    info!("Peer at {} unregistered", remote);
                    break Ok(());
                }
            }
            Ok(None) => {
                debug!("Connection closed by {}", remote);
                break Ok(());
            }
            // The whole line was consumed, so the stream is still in sync.
            Err(P2PError::ParseError(detail)) => {
                warn!("Unreadable line from {}: {}", remote, detail);
                let reply = Reply::error(ReplyError::Parse, detail);
                if let Err(e) = control.send_line(reply.to_string()) {
                    break Err(e);
                }
            }
            Err(e) => {
                warn!("Control connection {} failed: {}", remote, e);
                break Err(e);
            }
        }
    };

    session.close().await;
    control.close();
    drop(control);
    drop(session);

    if let Err(e) = writer.await {
        warn!("Writer task for {} panicked: {}", remote, e);
    }
    outcome
}
