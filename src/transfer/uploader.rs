use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::network::Transport;
use crate::storage::FileManager;
use crate::transfer::protocol::{BAD_REQUEST, TransferMessage};
use crate::utils::{P2PError, Result};

const MAX_REQUEST_LINE: usize = 1024;

/// Serving side of the transfer protocol: answers `DOWNLOAD` requests for
/// published files.
pub struct Uploader {
    file_manager: Arc<RwLock<FileManager>>,
    request_timeout: Duration,
}

impl Uploader {
    pub fn new(file_manager: Arc<RwLock<FileManager>>, request_timeout: Duration) -> Self {
        Self {
            file_manager,
            request_timeout,
        }
    }

    /// Accepts transfer connections until `cancel` fires, one task each.
    pub fn spawn_acceptor(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, remote)) => {
                        debug!("Transfer connection from {}", remote);
                        let uploader = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    debug!("Transfer to {} aborted by shutdown", remote);
                                }
                                result = uploader.handle_connection(stream, remote) => {
                                    if let Err(e) = result {
                                        warn!("Transfer to {} failed: {}", remote, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept transfer connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!("Transfer acceptor stopped");
        })
    }

    async fn read_message<R>(&self, reader: &mut R) -> Result<TransferMessage>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let line = timeout(
            self.request_timeout,
            Transport::read_line(reader, MAX_REQUEST_LINE),
        )
        .await
        .map_err(|_| P2PError::Timeout("waiting for requester".to_string()))??
        .ok_or_else(|| P2PError::ConnectionLost("requester closed the connection".to_string()))?;
        TransferMessage::parse(&line)
    }

    /// Runs one transfer exchange; returns the number of bytes streamed.
    pub async fn handle_connection<S>(&self, stream: S, remote: SocketAddr) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);

        let filename = match self.read_message(&mut stream).await {
            Ok(TransferMessage::Download { filename }) => filename,
            Ok(other) => {
                let reply = TransferMessage::Error(BAD_REQUEST.to_string());
                Transport::write_line(&mut stream, &reply.to_string()).await?;
                return Err(P2PError::InvalidResponse(format!(
                    "expected DOWNLOAD, got '{}'",
                    other
                )));
            }
            Err(e @ P2PError::ParseError(_)) => {
                let reply = TransferMessage::Error(BAD_REQUEST.to_string());
                Transport::write_line(&mut stream, &reply.to_string()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let path = self
            .file_manager
            .read()
            .await
            .published_path(&filename)
            .map(|p| p.to_path_buf());

        let opened = match path {
            Some(path) => async_fs::File::open(&path).await.ok(),
            None => None,
        };
        let Some(file) = opened else {
            info!("{} requested unknown file '{}'", remote, filename);
            Transport::write_line(&mut stream, &TransferMessage::not_found().to_string()).await?;
            let _ = stream.get_mut().shutdown().await;
            return Err(P2PError::FileNotFound(filename));
        };

        let size = file.metadata().await?.len();
        Transport::write_line(&mut stream, &TransferMessage::FileSize(size).to_string()).await?;

        match self.read_message(&mut stream).await? {
            TransferMessage::BeginDownload => {}
            other => {
                info!("{} cancelled download of '{}' ({})", remote, filename, other);
                return Err(P2PError::InvalidResponse(format!(
                    "expected BEGIN_DOWNLOAD, got '{}'",
                    other
                )));
            }
        }

        info!("Sending '{}' ({} bytes) to {}", filename, size, remote);
        let sent = tokio::io::copy(&mut file.take(size), stream.get_mut()).await?;
        stream.get_mut().flush().await?;
        let _ = stream.get_mut().shutdown().await;

        if sent < size {
            // The file shrank after FILESIZE went out; the requester sees a
            // short transfer.
            return Err(P2PError::ShortTransfer {
                expected: size,
                received: sent,
            });
        }

        info!("File transfer complete: {} bytes sent to {}", sent, remote);
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::{AsyncBufReadExt, duplex};

    async fn uploader_with(content: &[u8]) -> (Uploader, tempfile::TempDir) {
        let shared = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("local.bin"), content).unwrap();
        let mut fm = FileManager::new(shared.path().to_path_buf()).await.unwrap();
        fm.publish(Path::new("local.bin"), "data.bin").await.unwrap();
        let uploader = Uploader::new(Arc::new(RwLock::new(fm)), Duration::from_secs(2));
        (uploader, shared)
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:50123".parse().unwrap()
    }

    #[tokio::test]
    async fn test_serves_published_file() {
        let (uploader, _dir) = uploader_with(b"hello world").await;
        let (client, server) = duplex(64);

        let serve = tokio::spawn(async move { uploader.handle_connection(server, remote()).await });

        let mut client = BufReader::new(client);
        client.write_all(b"DOWNLOAD data.bin\n").await.unwrap();
        let mut header = String::new();
        client.read_line(&mut header).await.unwrap();
        assert_eq!(header, "FILESIZE 11\n");

        client.write_all(b"BEGIN_DOWNLOAD\n").await.unwrap();
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello world");
        assert_eq!(serve.await.unwrap().unwrap(), 11);
    }

    #[tokio::test]
    async fn test_unknown_file_is_reported() {
        let (uploader, _dir) = uploader_with(b"x").await;
        let (client, server) = duplex(64);

        let serve = tokio::spawn(async move { uploader.handle_connection(server, remote()).await });

        let mut client = BufReader::new(client);
        client.write_all(b"DOWNLOAD local.bin\n").await.unwrap();
        let mut rest = String::new();
        client.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "ERROR FILE_NOT_FOUND\n");
        assert!(matches!(serve.await.unwrap(), Err(P2PError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_requester_declines() {
        let (uploader, _dir) = uploader_with(b"abc").await;
        let (client, server) = duplex(64);

        let serve = tokio::spawn(async move { uploader.handle_connection(server, remote()).await });

        let mut client = BufReader::new(client);
        client.write_all(b"DOWNLOAD data.bin\n").await.unwrap();
        let mut header = String::new();
        client.read_line(&mut header).await.unwrap();
        drop(client);

        assert!(matches!(serve.await.unwrap(), Err(P2PError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_bad_request() {
        let (uploader, _dir) = uploader_with(b"abc").await;
        let (client, server) = duplex(64);

        let serve = tokio::spawn(async move { uploader.handle_connection(server, remote()).await });

        let mut client = BufReader::new(client);
        client.write_all(b"GIVE data.bin\n").await.unwrap();
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ERROR BAD_REQUEST\n");
        assert!(serve.await.unwrap().is_err());
    }
}
