use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use crate::core::TrackerConfig;
use crate::network::Transport;
use crate::tracker::{Registry, run_session};
use crate::utils::Result;

/// The coordinating process: owns the registry and the control listener.
pub struct Tracker {
    config: TrackerConfig,
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl Tracker {
    pub async fn bind(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let listener = Transport::listen(&config.listen_addr()).await?;

        Ok(Self {
            config,
            listener,
            registry: Arc::new(Registry::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Token that stops the tracker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts control connections until shutdown, then closes every
    /// session, waits for them, and releases the listener.
    pub async fn run(self) -> Result<()> {
        let Tracker {
            config,
            listener,
            registry,
            shutdown,
        } = self;

        info!("Tracker accepting peers on {}", listener.local_addr()?);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        info!("New connection from {}", remote);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {}: {}", remote, e);
                        }

                        let registry = registry.clone();
                        let cancel = shutdown.child_token();
                        let max_line_len = config.max_line_len;
                        sessions.spawn(async move {
                            if let Err(e) =
                                run_session(stream, remote, registry, cancel, max_line_len).await
                            {
                                warn!("Session with {} ended with error: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down tracker, closing {} sessions", sessions.len());
        drop(listener);

        for record in registry.clear().await {
            record.control.close();
        }
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed during shutdown: {}", e);
            }
        }

        info!("Tracker stopped");
        Ok(())
    }
}
