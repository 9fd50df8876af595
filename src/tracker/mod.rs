pub mod console;
pub mod registry;
pub mod server;
pub mod session;

pub use console::{Console, ConsoleCommand, PingStatus};
pub use registry::Registry;
pub use server::Tracker;
pub use session::{Session, SessionState, run_session};
