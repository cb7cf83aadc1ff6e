pub mod chunk;
pub mod dir;
pub mod entry;
pub mod errors;
pub mod file;
pub mod peers;
pub mod service;
pub mod store;
pub mod types;

pub use chunk::{ChunkSnapshot, ChunkStatus};
pub use entry::{CHUNK_SIZE, Entry, EntryType};
pub use errors::{DownloadError, QueueStoreError};
pub use file::DownloadStatus;
pub use peers::{OccupiedPeers, PeerRole};
pub use service::{
    DownloadCommand, DownloadKind, DownloadManagerConfig, DownloadManagerHandle, DownloadSnapshot,
    start_manager,
};
pub use store::{FILE_QUEUE_VERSION, QUEUE_RECORD_NAME, QueueEntry};
pub use types::DownloadId;
