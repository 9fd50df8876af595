pub mod client;
pub mod console;
pub mod peer_agent;

pub use client::TrackerClient;
pub use console::{PeerCommand, PeerConsole};
pub use peer_agent::{FetchReport, PeerAgent, TransferAttempt};
