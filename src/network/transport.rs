use log::{debug, info};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::utils::{P2PError, Result};

pub struct Transport;

impl Transport {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| P2PError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| {
                P2PError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;

        stream
            .set_nodelay(true)
            .map_err(|e| P2PError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e)))?;

        debug!("Connected to {}", addr);
        Ok(stream)
    }

    pub async fn listen(addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| P2PError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Reads one `\n`-terminated line, without the terminator (a trailing
    /// `\r` is dropped too).
    ///
    /// Returns `Ok(None)` on a clean end of stream before any byte of a new
    /// line. A line longer than `max_len` is rejected without buffering the
    /// rest of it.
    pub async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Option<String>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        let read = (&mut *reader)
            .take(max_len as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;

        if read == 0 {
            return Ok(None);
        }

        if buf.last() != Some(&b'\n') {
            if buf.len() > max_len {
                return Err(P2PError::MessageTooLarge(buf.len()));
            }
            return Err(P2PError::ConnectionLost(
                "connection closed in the middle of a line".to_string(),
            ));
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| P2PError::ParseError("line is not valid UTF-8".to_string()))
    }

    pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }
}
