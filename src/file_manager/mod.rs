pub mod local;

use crate::download::entry::Entry;
use crate::hash::Hash;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub use local::LocalFileManager;

#[derive(Debug)]
pub enum FileError {
    /// Transient local condition (disk full, quota). The download is retried
    /// later without user intervention.
    NotEnoughSpace {
        path: PathBuf,
        source: std::io::Error,
    },
    AlreadyExists {
        path: PathBuf,
    },
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FileError {
    /// Soft errors warrant an automatic rescan; everything else is terminal
    /// for the file until the user removes it.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::NotEnoughSpace { .. })
    }

    pub(crate) fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        if is_out_of_space(&source) {
            Self::NotEnoughSpace { path, source }
        } else {
            Self::Io { path, source }
        }
    }
}

fn is_out_of_space(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
    )
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEnoughSpace { path, source } => {
                write!(f, "not enough space for '{}': {source}", path.display())
            }
            Self::AlreadyExists { path } => {
                write!(f, "file already exists: '{}'", path.display())
            }
            Self::Create { path, source } => {
                write!(f, "failed to create file '{}': {source}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "file i/o error on '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotEnoughSpace { source, .. }
            | Self::Create { source, .. }
            | Self::Io { source, .. } => Some(source),
            Self::AlreadyExists { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum WriteError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    HashMismatch {
        expected: Hash,
        actual: Hash,
    },
    ChunkOverflow {
        chunk_len: u64,
        attempted: u64,
    },
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "chunk write failed on '{}': {source}", path.display())
            }
            Self::HashMismatch { expected, actual } => {
                write!(f, "chunk hash mismatch: expected {expected}, got {actual}")
            }
            Self::ChunkOverflow {
                chunk_len,
                attempted,
            } => write!(
                f,
                "chunk overflow: {attempted} bytes streamed into a {chunk_len} byte chunk"
            ),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::HashMismatch { .. } | Self::ChunkOverflow { .. } => None,
        }
    }
}

/// Sink for the bytes of one chunk. Dropping a writer without `commit`
/// discards the transfer; the partial bytes are never counted.
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write(&mut self, frame: &[u8]) -> Result<(), WriteError>;

    /// Flush and verify the content hash against the expected chunk hash.
    async fn commit(self: Box<Self>) -> Result<(), WriteError>;
}

/// Reserved local slot for one file being downloaded.
#[async_trait]
pub trait FileHandle: Send + Sync + std::fmt::Debug {
    /// Writer bound to the byte range of chunk `index`.
    async fn open_writer(
        &self,
        index: usize,
        expected: Hash,
    ) -> Result<Box<dyn ChunkWriter>, FileError>;

    /// All chunks verified: promote the file to its final name.
    async fn finalize(&self) -> Result<(), FileError>;

    /// The download was cancelled; drop the on-disk slot.
    async fn abandon(&self);
}

#[async_trait]
pub trait FileManager: Send + Sync {
    /// Reserve a local slot sized to `entry.size`.
    async fn new_file(&self, entry: &Entry) -> Result<Arc<dyn FileHandle>, FileError>;
}
