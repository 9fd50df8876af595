use thiserror::Error;

pub type Result<T> = std::result::Result<T, P2PError>;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Peer is not registered")]
    NotRegistered,

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Short transfer: expected {expected} bytes, received {received}")]
    ShortTransfer { expected: u64, received: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for P2PError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => P2PError::ConnectionLost(err.to_string()),
            _ => P2PError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for P2PError {
    fn from(err: serde_json::Error) -> Self {
        P2PError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_connection_lost() {
        let err: P2PError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, P2PError::ConnectionLost(_)));

        let err: P2PError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, P2PError::IoError(_)));
    }

    #[test]
    fn test_short_transfer_message() {
        let err = P2PError::ShortTransfer {
            expected: 10,
            received: 4,
        };
        assert_eq!(
            err.to_string(),
            "Short transfer: expected 10 bytes, received 4"
        );
    }
}
