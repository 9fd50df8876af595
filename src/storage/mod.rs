pub mod file_manager;

pub use file_manager::{FileManager, LocalFile, PARTIAL_SUFFIX};
