//! Control protocol spoken between a peer agent and the tracker.
//!
//! Every message is a single newline-terminated line of whitespace-separated
//! tokens. Requests flow peer -> tracker, except `PING`, which either side
//! may send and which is always answered with `PONG`.

use std::fmt;

use crate::core::peer::FileLocation;
use crate::utils::{P2PError, Result};

pub const REGISTER: &str = "REGISTER";
pub const UNREGISTER: &str = "UNREGISTER";
pub const PUBLISH: &str = "PUBLISH";
pub const UNPUBLISH: &str = "UNPUBLISH";
pub const QUERY: &str = "QUERY";
pub const LIST_MINE: &str = "LIST_MINE";
pub const LIST_PEERS: &str = "LIST_PEERS";
pub const DISCOVER: &str = "DISCOVER";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

const OK: &str = "OK";
const PEERS: &str = "PEERS";
const PEERS_LIST: &str = "PEERS_LIST";
const FILES: &str = "FILES";
const ERR: &str = "ERR";

/// Checks that a hostname or filename can travel as a single token and
/// cannot escape a shared folder when used as a path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(P2PError::ParseError("empty name".to_string()));
    }
    if name == "." || name == ".." {
        return Err(P2PError::ParseError(format!("reserved name '{}'", name)));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
    {
        return Err(P2PError::ParseError(format!("invalid name '{}'", name)));
    }
    Ok(())
}

fn name_arg(verb: &str, arg: Option<&str>) -> Result<String> {
    let name = arg.ok_or_else(|| P2PError::ParseError(format!("{} requires a name", verb)))?;
    validate_name(name)?;
    Ok(name.to_string())
}

fn no_more_args<'a>(verb: &str, mut rest: impl Iterator<Item = &'a str>) -> Result<()> {
    match rest.next() {
        None => Ok(()),
        Some(extra) => Err(P2PError::ParseError(format!(
            "unexpected argument '{}' for {}",
            extra, verb
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { hostname: String, transfer_port: u16 },
    Unregister,
    Publish { filename: String, size: Option<u64> },
    Unpublish { filename: String },
    Query { filename: String },
    ListMine,
    ListPeers,
    Discover { hostname: String },
    Ping,
    Pong,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| P2PError::ParseError("empty command".to_string()))?
            .to_ascii_uppercase();

        let request = match verb.as_str() {
            REGISTER => {
                let hostname = name_arg(REGISTER, tokens.next())?;
                let port = tokens
                    .next()
                    .ok_or_else(|| P2PError::ParseError("REGISTER requires a port".to_string()))?;
                let transfer_port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| P2PError::ParseError(format!("invalid port '{}'", port)))?;
                Request::Register {
                    hostname,
                    transfer_port,
                }
            }
            UNREGISTER => Request::Unregister,
            PUBLISH => {
                let filename = name_arg(PUBLISH, tokens.next())?;
                let size = match tokens.next() {
                    Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                        P2PError::ParseError(format!("invalid size '{}'", raw))
                    })?),
                    None => None,
                };
                Request::Publish { filename, size }
            }
            UNPUBLISH => Request::Unpublish {
                filename: name_arg(UNPUBLISH, tokens.next())?,
            },
            QUERY => Request::Query {
                filename: name_arg(QUERY, tokens.next())?,
            },
            LIST_MINE => Request::ListMine,
            LIST_PEERS => Request::ListPeers,
            DISCOVER => Request::Discover {
                hostname: name_arg(DISCOVER, tokens.next())?,
            },
            PING => Request::Ping,
            PONG => Request::Pong,
            other => {
                return Err(P2PError::ParseError(format!("unknown command '{}'", other)));
            }
        };

        no_more_args(&verb, tokens)?;
        Ok(request)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Request::Register { .. } => REGISTER,
            Request::Unregister => UNREGISTER,
            Request::Publish { .. } => PUBLISH,
            Request::Unpublish { .. } => UNPUBLISH,
            Request::Query { .. } => QUERY,
            Request::ListMine => LIST_MINE,
            Request::ListPeers => LIST_PEERS,
            Request::Discover { .. } => DISCOVER,
            Request::Ping => PING,
            Request::Pong => PONG,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Register {
                hostname,
                transfer_port,
            } => write!(f, "{} {} {}", REGISTER, hostname, transfer_port),
            Request::Publish {
                filename,
                size: Some(size),
            } => write!(f, "{} {} {}", PUBLISH, filename, size),
            Request::Publish {
                filename,
                size: None,
            } => write!(f, "{} {}", PUBLISH, filename),
            Request::Unpublish { filename } => write!(f, "{} {}", UNPUBLISH, filename),
            Request::Query { filename } => write!(f, "{} {}", QUERY, filename),
            Request::Discover { hostname } => write!(f, "{} {}", DISCOVER, hostname),
            other => f.write_str(other.verb()),
        }
    }
}

/// Error kinds that travel on the wire as `ERR <KIND> [detail]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    NotRegistered,
    UnknownHost,
    Parse,
}

impl ReplyError {
    fn as_str(self) -> &'static str {
        match self {
            ReplyError::NotRegistered => "NOT_REGISTERED",
            ReplyError::UnknownHost => "UNKNOWN_HOST",
            ReplyError::Parse => "PARSE",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "NOT_REGISTERED" => Some(ReplyError::NotRegistered),
            "UNKNOWN_HOST" => Some(ReplyError::UnknownHost),
            "PARSE" => Some(ReplyError::Parse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Pong,
    Peers(Vec<FileLocation>),
    PeerList(Vec<String>),
    Files(Vec<String>),
    Error {
        kind: ReplyError,
        detail: Option<String>,
    },
}

impl Reply {
    pub fn error(kind: ReplyError, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Reply::Error {
            kind,
            detail: (!detail.is_empty()).then_some(detail),
        }
    }

    pub fn not_registered() -> Self {
        Reply::Error {
            kind: ReplyError::NotRegistered,
            detail: None,
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim_start()),
            None => (line, ""),
        };
        let items = || rest.split_whitespace().map(str::to_string).collect::<Vec<_>>();

        match head {
            OK => Ok(Reply::Ok),
            PONG => Ok(Reply::Pong),
            PEERS => rest
                .split_whitespace()
                .map(FileLocation::decode)
                .collect::<Result<Vec<_>>>()
                .map(Reply::Peers),
            PEERS_LIST => Ok(Reply::PeerList(items())),
            FILES => Ok(Reply::Files(items())),
            ERR => {
                let (kind, detail) = match rest.split_once(char::is_whitespace) {
                    Some((kind, detail)) => (kind, detail.trim()),
                    None => (rest, ""),
                };
                let kind = ReplyError::from_token(kind).ok_or_else(|| {
                    P2PError::InvalidResponse(format!("unknown error kind '{}'", kind))
                })?;
                Ok(Reply::error(kind, detail))
            }
            _ => Err(P2PError::InvalidResponse(format!(
                "unrecognised reply '{}'",
                line
            ))),
        }
    }

    /// Converts an error reply into the matching `P2PError`.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Reply::Error { kind, detail } => {
                let detail = detail.unwrap_or_default();
                Err(match kind {
                    ReplyError::NotRegistered => P2PError::NotRegistered,
                    ReplyError::UnknownHost => P2PError::UnknownHost(detail),
                    ReplyError::Parse => P2PError::ParseError(detail),
                })
            }
            reply => Ok(reply),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn with_items<T: fmt::Display>(
            f: &mut fmt::Formatter<'_>,
            head: &str,
            items: &[T],
        ) -> fmt::Result {
            f.write_str(head)?;
            for item in items {
                write!(f, " {}", item)?;
            }
            Ok(())
        }

        match self {
            Reply::Ok => f.write_str(OK),
            Reply::Pong => f.write_str(PONG),
            Reply::Peers(locations) => {
                f.write_str(PEERS)?;
                for location in locations {
                    write!(f, " {}", location.encode())?;
                }
                Ok(())
            }
            Reply::PeerList(hosts) => with_items(f, PEERS_LIST, hosts),
            Reply::Files(files) => with_items(f, FILES, files),
            Reply::Error { kind, detail } => match detail {
                Some(detail) => write!(f, "{} {} {}", ERR, kind.as_str(), detail),
                None => write!(f, "{} {}", ERR, kind.as_str()),
            },
        }
    }
}
