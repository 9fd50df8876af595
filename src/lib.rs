//! Peer tracker library
//!
//! A central tracker that records which peers publish which files, and the
//! peer side that registers with it and moves file bytes directly between
//! peers.

pub mod agent;
pub mod core;
pub mod network;
pub mod storage;
pub mod tracker;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use agent::{FetchReport, PeerAgent, PeerConsole, TrackerClient};
pub use core::{FileLocation, PeerConfig, TrackerConfig};
pub use transfer::TransferProgress;
pub use tracker::{Console, Registry, Tracker};
pub use utils::error::{P2PError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
