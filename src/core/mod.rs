pub mod config;
pub mod peer;
pub mod protocol;

pub use config::{PeerConfig, TrackerConfig};
pub use peer::{FileLocation, PeerRecord, PeerSummary};
pub use protocol::{Reply, ReplyError, Request};
