pub mod connection;
pub mod transport;

pub use connection::{ControlHandle, run_writer};
pub use transport::Transport;
