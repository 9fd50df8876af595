use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::protocol::{PING, PONG};
use crate::core::{FileLocation, Reply, Request};
use crate::network::Transport;
use crate::utils::{P2PError, Result};

/// Peer-side end of the control connection.
///
/// A background reader answers tracker `PING` checks on its own and hands
/// every other line to whichever request is waiting. Requests are issued
/// one at a time, so replies always match the request that caused them.
pub struct TrackerClient {
    tracker_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    replies: Mutex<mpsc::UnboundedReceiver<Result<Reply>>>,
    request_timeout: Duration,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl TrackerClient {
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_line_len: usize,
    ) -> Result<Self> {
        let stream = Transport::connect(addr, connect_timeout).await?;
        let tracker_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let writer = Arc::new(Mutex::new(write_half));
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(Self::read_loop(
            BufReader::new(read_half),
            writer.clone(),
            tx,
            closed.clone(),
            max_line_len,
        ));

        Ok(Self {
            tracker_addr,
            writer,
            replies: Mutex::new(rx),
            request_timeout,
            closed,
            reader,
        })
    }

    async fn read_loop(
        mut reader: BufReader<OwnedReadHalf>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        replies: mpsc::UnboundedSender<Result<Reply>>,
        closed: CancellationToken,
        max_line_len: usize,
    ) {
        loop {
            let line = tokio::select! {
                _ = closed.cancelled() => break,
                line = Transport::read_line(&mut reader, max_line_len) => line,
            };

            match line {
                Ok(Some(line)) if line.trim() == PING => {
                    debug!("Answering tracker PING");
                    let mut writer = writer.lock().await;
                    if let Err(e) = Transport::write_line(&mut *writer, PONG).await {
                        let _ = replies.send(Err(e));
                        break;
                    }
                }
                Ok(Some(line)) => {
                    let _ = replies.send(Reply::parse(&line));
                }
                Ok(None) => {
                    let _ = replies.send(Err(P2PError::ConnectionLost(
                        "tracker closed the control connection".to_string(),
                    )));
                    break;
                }
                Err(e @ P2PError::ParseError(_)) => {
                    let _ = replies.send(Err(e));
                }
                Err(e) => {
                    warn!("Control connection error: {}", e);
                    let _ = replies.send(Err(e));
                    break;
                }
            }
        }
        closed.cancel();
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Sends one request and waits for its reply. Error replies come back
    /// as the matching `P2PError`.
    pub async fn request(&self, request: &Request) -> Result<Reply> {
        let mut replies = self.replies.lock().await;
        if self.is_closed() {
            return Err(P2PError::ConnectionLost(
                "control connection is closed".to_string(),
            ));
        }

        debug!("-> tracker: {}", request);
        {
            let mut writer = self.writer.lock().await;
            Transport::write_line(&mut *writer, &request.to_string()).await?;
        }

        match timeout(self.request_timeout, replies.recv()).await {
            Ok(Some(reply)) => {
                let reply = reply?;
                debug!("<- tracker: {}", reply);
                reply.into_result()
            }
            Ok(None) => Err(P2PError::ConnectionLost(
                "control connection is closed".to_string(),
            )),
            Err(_) => {
                // A late reply would pair with the next request.
                self.closed.cancel();
                Err(P2PError::Timeout(format!("no reply to {}", request.verb())))
            }
        }
    }

    async fn expect_ok(&self, request: Request) -> Result<()> {
        match self.request(&request).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn register(&self, hostname: &str, transfer_port: u16) -> Result<()> {
        self.expect_ok(Request::Register {
            hostname: hostname.to_string(),
            transfer_port,
        })
        .await
    }

    pub async fn unregister(&self) -> Result<()> {
        self.expect_ok(Request::Unregister).await
    }

    pub async fn publish(&self, filename: &str, size: Option<u64>) -> Result<()> {
        self.expect_ok(Request::Publish {
            filename: filename.to_string(),
            size,
        })
        .await
    }

    pub async fn unpublish(&self, filename: &str) -> Result<()> {
        self.expect_ok(Request::Unpublish {
            filename: filename.to_string(),
        })
        .await
    }

    pub async fn query(&self, filename: &str) -> Result<Vec<FileLocation>> {
        let request = Request::Query {
            filename: filename.to_string(),
        };
        match self.request(&request).await? {
            Reply::Peers(locations) => Ok(locations),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn list_mine(&self) -> Result<Vec<String>> {
        match self.request(&Request::ListMine).await? {
            Reply::Files(files) => Ok(files),
            other => Err(unexpected(&Request::ListMine, &other)),
        }
    }

    pub async fn list_peers(&self) -> Result<Vec<String>> {
        match self.request(&Request::ListPeers).await? {
            Reply::PeerList(hosts) => Ok(hosts),
            other => Err(unexpected(&Request::ListPeers, &other)),
        }
    }

    pub async fn discover(&self, hostname: &str) -> Result<Vec<String>> {
        let request = Request::Discover {
            hostname: hostname.to_string(),
        };
        match self.request(&request).await? {
            Reply::Files(files) => Ok(files),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Round trip to the tracker over the control connection.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        match self.request(&Request::Ping).await? {
            Reply::Pong => Ok(start.elapsed()),
            other => Err(unexpected(&Request::Ping, &other)),
        }
    }

    pub async fn close(&self) {
        self.closed.cancel();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for TrackerClient {
    fn drop(&mut self) {
        self.closed.cancel();
        self.reader.abort();
    }
}

fn unexpected(request: &Request, reply: &Reply) -> P2PError {
    P2PError::InvalidResponse(format!("unexpected reply '{}' to {}", reply, request.verb()))
}
