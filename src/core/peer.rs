use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::network::ControlHandle;
use crate::utils::{P2PError, Result};

/// A currently registered peer as the tracker sees it.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub hostname: String,
    /// Address observed on the control connection
    pub address: IpAddr,
    pub transfer_port: u16,
    pub control: Arc<ControlHandle>,
}

impl PeerRecord {
    pub fn new(
        hostname: String,
        address: IpAddr,
        transfer_port: u16,
        control: Arc<ControlHandle>,
    ) -> Self {
        Self {
            hostname,
            address,
            transfer_port,
            control,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.control.id()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            hostname: self.hostname.clone(),
            address: self.address,
            transfer_port: self.transfer_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerSummary {
    pub hostname: String,
    pub address: IpAddr,
    pub transfer_port: u16,
}

impl fmt::Display for PeerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.transfer_addr())
    }
}

impl PeerSummary {
    pub fn transfer_addr(&self) -> String {
        std::net::SocketAddr::new(self.address, self.transfer_port).to_string()
    }
}

/// One publisher of a file, as returned by a QUERY.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileLocation {
    pub hostname: String,
    pub address: IpAddr,
    pub transfer_port: u16,
    /// Size announced with PUBLISH, if any
    pub size: Option<u64>,
    /// Whether this host was the first to publish the file
    pub origin: bool,
}

impl FileLocation {
    pub fn peer(&self) -> PeerSummary {
        PeerSummary {
            hostname: self.hostname.clone(),
            address: self.address,
            transfer_port: self.transfer_port,
        }
    }

    pub fn transfer_addr(&self) -> String {
        std::net::SocketAddr::new(self.address, self.transfer_port).to_string()
    }

    /// `hostname/address/port/size-or--/origin`
    pub fn encode(&self) -> String {
        let size = self
            .size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{}/{}/{}/{}/{}",
            self.hostname,
            self.address,
            self.transfer_port,
            size,
            if self.origin { 1 } else { 0 }
        )
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || P2PError::InvalidResponse(format!("malformed peer entry '{}'", token));

        let parts: Vec<&str> = token.split('/').collect();
        let [hostname, address, port, size, origin] = parts.as_slice() else {
            return Err(invalid());
        };

        Ok(Self {
            hostname: hostname.to_string(),
            address: address.parse().map_err(|_| invalid())?,
            transfer_port: port.parse().map_err(|_| invalid())?,
            size: match *size {
                "-" => None,
                raw => Some(raw.parse().map_err(|_| invalid())?),
            },
            origin: match *origin {
                "1" => true,
                "0" => false,
                _ => return Err(invalid()),
            },
        })
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.transfer_addr())?;
        if let Some(size) = self.size {
            write!(f, " {} bytes", size)?;
        }
        if self.origin {
            f.write_str(" [origin]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_malformed_entries() {
        for token in [
            "alice",
            "alice/10.0.0.1/9001/-",
            "alice/not-an-ip/9001/-/0",
            "alice/10.0.0.1/port/-/0",
            "alice/10.0.0.1/9001/many/0",
            "alice/10.0.0.1/9001/-/yes",
            "alice/10.0.0.1/9001/-/0/extra",
        ] {
            assert!(FileLocation::decode(token).is_err(), "{}", token);
        }
    }

    #[test]
    fn test_display() {
        let location = FileLocation::decode("alice/127.0.0.1/9001/5/1").unwrap();
        assert_eq!(location.to_string(), "alice (127.0.0.1:9001) 5 bytes [origin]");
        assert_eq!(location.peer().to_string(), "alice (127.0.0.1:9001)");
    }
}
