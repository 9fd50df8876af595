use log::{debug, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::protocol::PING;
use crate::network::Transport;
use crate::utils::{P2PError, Result};

/// Tracker-side handle on one peer's control connection.
///
/// Outbound lines are queued on a channel and written by a single writer
/// task, so replies and tracker-initiated PINGs never interleave on the
/// wire. Closing the handle cancels the session that owns the connection.
#[derive(Debug)]
pub struct ControlHandle {
    id: Uuid,
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    pong_waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
    cancel: CancellationToken,
}

impl ControlHandle {
    pub fn new(
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            remote,
            outbound,
            pong_waiters: Mutex::new(VecDeque::new()),
            cancel,
        });
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn send_line(&self, line: impl Into<String>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(P2PError::ConnectionLost(format!("{} is closed", self.remote)));
        }
        self.outbound
            .send(line.into())
            .map_err(|_| P2PError::ConnectionLost(format!("{} is closed", self.remote)))
    }

    /// Sends `PING` and waits for the matching `PONG` delivered through
    /// [`ControlHandle::resolve_pong`].
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.pong_waiters.lock().await.push_back(tx);
        if let Err(e) = self.send_line(PING) {
            drop(rx);
            self.prune_waiters().await;
            return Err(e);
        }

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(())) => Ok(start.elapsed()),
                Ok(Err(_)) => Err(P2PError::ConnectionLost(format!(
                    "{} closed before answering PING",
                    self.remote
                ))),
                Err(_) => Err(P2PError::Timeout(format!(
                    "no PONG from {} within {:?}",
                    self.remote, timeout
                ))),
            },
            _ = self.cancel.cancelled() => Err(P2PError::ConnectionLost(format!(
                "{} closed before answering PING",
                self.remote
            ))),
        };

        if outcome.is_err() {
            self.prune_waiters().await;
        }
        outcome
    }

    /// Drops waiters whose `ping` call has already given up.
    async fn prune_waiters(&self) {
        self.pong_waiters
            .lock()
            .await
            .retain(|waiter| !waiter.is_closed());
    }

    /// Hands one `PONG` to the oldest `ping` still waiting. Returns false
    /// when nobody was waiting for it.
    pub async fn resolve_pong(&self) -> bool {
        let mut waiters = self.pong_waiters.lock().await;
        while let Some(waiter) = waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

}

/// Drains queued lines onto the socket until every sender is gone or the
/// connection is cancelled. Lines queued before cancellation still go out.
pub async fn run_writer<W>(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = Transport::write_line(&mut writer, &line).await {
                        warn!("Control write failed: {}", e);
                        cancel.cancel();
                        return Err(e);
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Flush anything queued in the same instant as the cancellation.
    while let Ok(line) = rx.try_recv() {
        if Transport::write_line(&mut writer, &line).await.is_err() {
            break;
        }
    }

    debug!("Control writer finished");
    let _ = writer.shutdown().await;
    Ok(())
}
