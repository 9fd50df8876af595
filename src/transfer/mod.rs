pub mod downloader;
pub mod protocol;
pub mod uploader;

pub use downloader::{DownloadOutcome, Downloader, TransferProgress};
pub use protocol::TransferMessage;
pub use uploader::Uploader;
