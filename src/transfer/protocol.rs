//! Peer Transfer Protocol messages.
//!
//! ```text
//! requester -> server   DOWNLOAD <filename>
//! server -> requester   FILESIZE <bytes>    | ERROR <reason>
//! requester -> server   BEGIN_DOWNLOAD
//! server -> requester   <exactly <bytes> raw bytes>, then close
//! ```

use std::fmt;

use crate::core::protocol::validate_name;
use crate::utils::{P2PError, Result};

pub const DOWNLOAD: &str = "DOWNLOAD";
pub const FILESIZE: &str = "FILESIZE";
pub const BEGIN_DOWNLOAD: &str = "BEGIN_DOWNLOAD";
pub const ERROR: &str = "ERROR";

pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
pub const BAD_REQUEST: &str = "BAD_REQUEST";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Download { filename: String },
    FileSize(u64),
    BeginDownload,
    Error(String),
}

impl TransferMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb {
            DOWNLOAD => {
                validate_name(rest)?;
                Ok(TransferMessage::Download {
                    filename: rest.to_string(),
                })
            }
            FILESIZE => rest
                .parse::<u64>()
                .map(TransferMessage::FileSize)
                .map_err(|_| P2PError::ParseError(format!("invalid file size '{}'", rest))),
            BEGIN_DOWNLOAD if rest.is_empty() => Ok(TransferMessage::BeginDownload),
            ERROR => Ok(TransferMessage::Error(rest.to_string())),
            _ => Err(P2PError::ParseError(format!(
                "unexpected transfer message '{}'",
                line
            ))),
        }
    }

    pub fn not_found() -> Self {
        TransferMessage::Error(FILE_NOT_FOUND.to_string())
    }
}

impl fmt::Display for TransferMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMessage::Download { filename } => write!(f, "{} {}", DOWNLOAD, filename),
            TransferMessage::FileSize(size) => write!(f, "{} {}", FILESIZE, size),
            TransferMessage::BeginDownload => f.write_str(BEGIN_DOWNLOAD),
            TransferMessage::Error(reason) => write!(f, "{} {}", ERROR, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages() {
        assert_eq!(
            TransferMessage::parse("DOWNLOAD notes.txt").unwrap(),
            TransferMessage::Download {
                filename: "notes.txt".to_string()
            }
        );
        assert_eq!(
            TransferMessage::parse("FILESIZE 0").unwrap(),
            TransferMessage::FileSize(0)
        );
        assert_eq!(
            TransferMessage::parse("BEGIN_DOWNLOAD").unwrap(),
            TransferMessage::BeginDownload
        );
        assert_eq!(
            TransferMessage::parse("ERROR FILE_NOT_FOUND").unwrap(),
            TransferMessage::not_found()
        );
        assert_eq!(TransferMessage::not_found().to_string(), "ERROR FILE_NOT_FOUND");
    }

    #[test]
    fn test_reject_bad_messages() {
        for line in [
            "DOWNLOAD",
            "DOWNLOAD ../secret",
            "DOWNLOAD two words",
            "FILESIZE -1",
            "FILESIZE",
            "BEGIN_DOWNLOAD now",
            "UPLOAD x",
        ] {
            assert!(TransferMessage::parse(line).is_err(), "{}", line);
        }
    }
}
