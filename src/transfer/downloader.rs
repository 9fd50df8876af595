use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::network::Transport;
use crate::storage::FileManager;
use crate::transfer::protocol::{FILE_NOT_FOUND, TransferMessage};
use crate::utils::{P2PError, Result};

const MAX_REPLY_LINE: usize = 1024;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Bytes received so far out of the size announced by `FILESIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub received: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.received * 100 / self.total
        }
    }
}

pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// Requesting side of the transfer protocol.
pub struct Downloader {
    file_manager: Arc<RwLock<FileManager>>,
    connect_timeout: Duration,
    /// Bounds the wait for `FILESIZE` and every idle gap in the body.
    response_timeout: Duration,
}

impl Downloader {
    pub fn new(
        file_manager: Arc<RwLock<FileManager>>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            file_manager,
            connect_timeout,
            response_timeout,
        }
    }

    /// Fetches `filename` from the peer listening at `addr` into the shared
    /// folder.
    pub async fn download(&self, addr: &str, filename: &str) -> Result<DownloadOutcome> {
        self.download_with_progress(addr, filename, &|_| {}).await
    }

    pub async fn download_with_progress(
        &self,
        addr: &str,
        filename: &str,
        progress: ProgressFn<'_>,
    ) -> Result<DownloadOutcome> {
        info!("Downloading '{}' from {}", filename, addr);
        let stream = Transport::connect(addr, self.connect_timeout).await?;
        self.receive_with_progress(stream, filename, progress).await
    }

    /// Runs the requester half of the exchange over an established stream.
    pub async fn receive<S>(&self, stream: S, filename: &str) -> Result<DownloadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.receive_with_progress(stream, filename, &|_| {}).await
    }

    /// Like [`Downloader::receive`], calling `progress` as body bytes land.
    ///
    /// Bytes are staged in a `.part` file that only replaces the final file
    /// once the declared length has been received in full.
    pub async fn receive_with_progress<S>(
        &self,
        stream: S,
        filename: &str,
        progress: ProgressFn<'_>,
    ) -> Result<DownloadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (partial, target) = {
            let fm = self.file_manager.read().await;
            (fm.partial_path(filename)?, fm.download_path(filename)?)
        };

        let mut stream = BufReader::new(stream);
        let request = TransferMessage::Download {
            filename: filename.to_string(),
        };
        Transport::write_line(&mut stream, &request.to_string()).await?;

        let line = timeout(
            self.response_timeout,
            Transport::read_line(&mut stream, MAX_REPLY_LINE),
        )
        .await
        .map_err(|_| P2PError::Timeout("waiting for FILESIZE".to_string()))??
        .ok_or_else(|| P2PError::ConnectionLost("server closed before FILESIZE".to_string()))?;

        let size = match TransferMessage::parse(&line)? {
            TransferMessage::FileSize(size) => size,
            TransferMessage::Error(reason) if reason == FILE_NOT_FOUND => {
                return Err(P2PError::FileNotFound(filename.to_string()));
            }
            other => {
                return Err(P2PError::InvalidResponse(format!(
                    "expected FILESIZE, got '{}'",
                    other
                )));
            }
        };
        debug!("'{}' is {} bytes", filename, size);

        let mut file = async_fs::File::create(&partial).await?;
        let received = match self.stream_body(&mut stream, &mut file, size, progress).await {
            Ok(received) => received,
            Err(e) => {
                drop(file);
                discard(&partial).await;
                return Err(e);
            }
        };
        drop(file);

        if received < size {
            warn!(
                "Download of '{}' incomplete: {}/{} bytes",
                filename, received, size
            );
            discard(&partial).await;
            return Err(P2PError::ShortTransfer {
                expected: size,
                received,
            });
        }

        if let Err(e) = async_fs::rename(&partial, &target).await {
            discard(&partial).await;
            return Err(e.into());
        }
        info!("Download complete: '{}' ({} bytes)", filename, received);
        Ok(DownloadOutcome {
            path: target,
            bytes: received,
        })
    }

    /// Copies up to `size` body bytes into `file`. Stops early at end of
    /// stream; fails if the server goes quiet for longer than the response
    /// timeout.
    async fn stream_body<S>(
        &self,
        stream: &mut BufReader<S>,
        file: &mut async_fs::File,
        size: u64,
        progress: ProgressFn<'_>,
    ) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Transport::write_line(stream, &TransferMessage::BeginDownload.to_string()).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        while received < size {
            let want = (size - received).min(CHUNK_SIZE as u64) as usize;
            let n = timeout(self.response_timeout, stream.read(&mut buf[..want]))
                .await
                .map_err(|_| {
                    P2PError::Timeout(format!(
                        "server stalled after {} of {} bytes",
                        received, size
                    ))
                })??;
            if n == 0 {
                break;
            }

            file.write_all(&buf[..n]).await?;
            received += n as u64;
            progress(TransferProgress {
                received,
                total: size,
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(received)
    }
}

async fn discard(partial: &Path) {
    if let Err(e) = async_fs::remove_file(partial).await {
        debug!("Could not remove {}: {}", partial.display(), e);
    }
}
