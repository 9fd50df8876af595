use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::TrackerClient;
use crate::core::{FileLocation, PeerConfig};
use crate::storage::{FileManager, LocalFile};
use crate::transfer::{DownloadOutcome, Downloader, TransferProgress, Uploader};
use crate::utils::{P2PError, Result};

/// One download attempt against one publishing peer.
#[derive(Debug)]
pub struct TransferAttempt {
    pub peer: FileLocation,
    pub result: Result<DownloadOutcome>,
}

/// What a fetch found and what happened when we tried each source.
#[derive(Debug)]
pub struct FetchReport {
    pub filename: String,
    /// Publishers other than ourselves, origin first.
    pub candidates: Vec<FileLocation>,
    pub attempts: Vec<TransferAttempt>,
}

impl FetchReport {
    pub fn succeeded(&self) -> Option<&DownloadOutcome> {
        self.attempts
            .iter()
            .find_map(|attempt| attempt.result.as_ref().ok())
    }
}

/// A running peer: registered with the tracker, serving its published files
/// and able to fetch files from others.
pub struct PeerAgent {
    config: PeerConfig,
    client: TrackerClient,
    file_manager: Arc<RwLock<FileManager>>,
    downloader: Downloader,
    transfer_addr: SocketAddr,
    shutdown: CancellationToken,
    acceptor: JoinHandle<()>,
}

impl PeerAgent {
    /// Opens the transfer listener, connects to the tracker and registers.
    pub async fn start(config: PeerConfig) -> Result<Self> {
        config.validate()?;

        let file_manager = Arc::new(RwLock::new(
            FileManager::new(config.shared_dir.clone()).await?,
        ));

        let listener = TcpListener::bind(format!("0.0.0.0:{}", config.transfer_port))
            .await
            .map_err(|e| {
                P2PError::IoError(format!(
                    "Failed to bind transfer port {}: {}",
                    config.transfer_port, e
                ))
            })?;
        let transfer_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let uploader = Arc::new(Uploader::new(
            file_manager.clone(),
            config.request_timeout(),
        ));
        let acceptor = uploader.spawn_acceptor(listener, shutdown.child_token());

        let client = match TrackerClient::connect(
            &config.tracker_addr,
            config.connect_timeout(),
            config.request_timeout(),
            config.max_line_len,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };

        if let Err(e) = client.register(&config.hostname, transfer_addr.port()).await {
            shutdown.cancel();
            return Err(e);
        }
        info!(
            "Registered '{}' with tracker {} (transfer port {})",
            config.hostname,
            client.tracker_addr(),
            transfer_addr.port()
        );

        let downloader = Downloader::new(
            file_manager.clone(),
            config.connect_timeout(),
            config.request_timeout(),
        );

        Ok(Self {
            config,
            client,
            file_manager,
            downloader,
            transfer_addr,
            shutdown,
            acceptor,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn transfer_port(&self) -> u16 {
        self.transfer_addr.port()
    }

    pub fn shared_dir(&self) -> &Path {
        &self.config.shared_dir
    }

    pub fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }

    /// Makes `local` downloadable as `name` and announces it to the tracker.
    /// Returns the size announced.
    pub async fn publish(&self, local: &Path, name: &str) -> Result<u64> {
        let size = self.file_manager.write().await.publish(local, name).await?;

        if let Err(e) = self.client.publish(name, Some(size)).await {
            self.file_manager.write().await.unpublish(name);
            return Err(e);
        }
        info!("Published '{}' ({} bytes)", name, size);
        Ok(size)
    }

    pub async fn unpublish(&self, name: &str) -> Result<()> {
        self.client.unpublish(name).await?;
        self.file_manager.write().await.unpublish(name);
        info!("Unpublished '{}'", name);
        Ok(())
    }

    pub async fn query(&self, filename: &str) -> Result<Vec<FileLocation>> {
        self.client.query(filename).await
    }

    /// Downloads `filename` from the first publisher that delivers it in
    /// full. Our own entry is never tried, and one failed peer does not stop
    /// the remaining candidates from being tried.
    pub async fn fetch(&self, filename: &str) -> Result<FetchReport> {
        self.fetch_with_progress(filename, &|_, _| {}).await
    }

    /// Like [`PeerAgent::fetch`], reporting body progress per source peer.
    pub async fn fetch_with_progress(
        &self,
        filename: &str,
        progress: &(dyn Fn(&FileLocation, TransferProgress) + Send + Sync),
    ) -> Result<FetchReport> {
        let candidates: Vec<FileLocation> = self
            .client
            .query(filename)
            .await?
            .into_iter()
            .filter(|location| location.hostname != self.config.hostname)
            .collect();

        let mut attempts = Vec::new();
        for peer in &candidates {
            let on_progress = |p: TransferProgress| progress(peer, p);
            let result = self
                .downloader
                .download_with_progress(&peer.transfer_addr(), filename, &on_progress)
                .await;
            let done = result.is_ok();
            if let Err(e) = &result {
                warn!("Fetching '{}' from '{}' failed: {}", filename, peer.hostname, e);
            }
            attempts.push(TransferAttempt {
                peer: peer.clone(),
                result,
            });
            if done {
                break;
            }
        }

        Ok(FetchReport {
            filename: filename.to_string(),
            candidates,
            attempts,
        })
    }

    pub async fn list_mine(&self) -> Result<Vec<String>> {
        self.client.list_mine().await
    }

    pub async fn list_peers(&self) -> Result<Vec<String>> {
        self.client.list_peers().await
    }

    pub async fn discover(&self, hostname: &str) -> Result<Vec<String>> {
        self.client.discover(hostname).await
    }

    pub async fn list_local(&self) -> Result<Vec<LocalFile>> {
        self.file_manager.read().await.list_local().await
    }

    /// Unregisters, closes the control connection and stops serving.
    pub async fn shutdown(self) {
        info!("Shutting down peer '{}'", self.config.hostname);
        if let Err(e) = self.client.unregister().await {
            warn!("UNREGISTER failed: {}", e);
        }
        self.client.close().await;
        self.shutdown.cancel();
        let _ = self.acceptor.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TrackerConfig;
    use crate::tracker::Tracker;

    async fn start_tracker() -> (String, CancellationToken, JoinHandle<Result<()>>) {
        let config = TrackerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..TrackerConfig::default()
        };
        let tracker = Tracker::bind(config).await.unwrap();
        let addr = tracker.local_addr().unwrap().to_string();
        let token = tracker.shutdown_token();
        (addr, token, tokio::spawn(tracker.run()))
    }

    fn peer_config(hostname: &str, tracker_addr: &str, dir: &Path) -> PeerConfig {
        PeerConfig {
            hostname: hostname.to_string(),
            tracker_addr: tracker_addr.to_string(),
            transfer_port: 0,
            shared_dir: dir.to_path_buf(),
            request_timeout_secs: 2,
            connect_timeout_secs: 2,
            ..PeerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publish_and_fetch_between_agents() {
        let (tracker_addr, token, tracker) = start_tracker().await;
        let alice_dir = tempfile::tempdir().unwrap();
        let bob_dir = tempfile::tempdir().unwrap();
        std::fs::write(alice_dir.path().join("notes.txt"), b"meeting at noon").unwrap();

        let alice = PeerAgent::start(peer_config("alice", &tracker_addr, alice_dir.path()))
            .await
            .unwrap();
        let bob = PeerAgent::start(peer_config("bob", &tracker_addr, bob_dir.path()))
            .await
            .unwrap();

        assert_eq!(
            alice.publish(Path::new("notes.txt"), "notes.txt").await.unwrap(),
            15
        );
        assert_eq!(alice.list_mine().await.unwrap(), vec!["notes.txt"]);

        let report = bob.fetch("notes.txt").await.unwrap();
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].hostname, "alice");
        assert_eq!(report.candidates[0].transfer_port, alice.transfer_port());
        let outcome = report.succeeded().unwrap();
        assert_eq!(outcome.bytes, 15);
        assert_eq!(
            std::fs::read(bob_dir.path().join("notes.txt")).unwrap(),
            b"meeting at noon"
        );

        alice.shutdown().await;
        bob.shutdown().await;
        token.cancel();
        tracker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fetch_skips_self_and_reports_missing() {
        let (tracker_addr, token, tracker) = start_tracker().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mine.txt"), b"x").unwrap();

        let agent = PeerAgent::start(peer_config("solo", &tracker_addr, dir.path()))
            .await
            .unwrap();
        agent.publish(Path::new("mine.txt"), "mine.txt").await.unwrap();

        let report = agent.fetch("mine.txt").await.unwrap();
        assert!(report.candidates.is_empty());
        assert!(report.attempts.is_empty());
        assert!(report.succeeded().is_none());

        let report = agent.fetch("nobody-has-this").await.unwrap();
        assert!(report.candidates.is_empty());

        agent.shutdown().await;
        token.cancel();
        tracker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_missing_file_is_not_announced() {
        let (tracker_addr, token, tracker) = start_tracker().await;
        let dir = tempfile::tempdir().unwrap();

        let agent = PeerAgent::start(peer_config("carol", &tracker_addr, dir.path()))
            .await
            .unwrap();
        assert!(matches!(
            agent.publish(Path::new("ghost.txt"), "ghost.txt").await,
            Err(P2PError::FileNotFound(_))
        ));
        assert!(agent.list_mine().await.unwrap().is_empty());

        agent.shutdown().await;
        token.cancel();
        tracker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_without_tracker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        assert!(PeerAgent::start(peer_config("dave", &addr, dir.path())).await.is_err());
    }
}
