use crate::hash::Hash;
use serde::{Deserialize, Serialize};

/// Fixed chunk size; the last chunk of a file may be shorter.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Dir,
}

/// Metadata for a remote file or directory offered for download.
///
/// `path` is the share-relative directory the entry lives in ("/" for the
/// share root), `name` the file or directory name. `chunk_hashes` may be
/// pre-filled by the remote browse response; when empty for a file entry the
/// hashes are fetched over the side channel before any chunk can start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_type: EntryType,
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub chunk_hashes: Vec<Hash>,
    #[serde(default)]
    pub is_empty: bool,
}

impl Entry {
    pub fn file(path: &str, name: &str, size: u64) -> Self {
        Self {
            entry_type: EntryType::File,
            path: path.to_string(),
            name: name.to_string(),
            size,
            chunk_hashes: Vec::new(),
            is_empty: size == 0,
        }
    }

    pub fn dir(path: &str, name: &str) -> Self {
        Self {
            entry_type: EntryType::Dir,
            path: path.to_string(),
            name: name.to_string(),
            size: 0,
            chunk_hashes: Vec::new(),
            is_empty: false,
        }
    }

    /// Two entries describe the same download iff type, path, name and size
    /// all match. The source peer is deliberately not part of the key.
    pub fn same_download(&self, other: &Entry) -> bool {
        self.entry_type == other.entry_type
            && self.path == other.path
            && self.name == other.name
            && self.size == other.size
    }

    pub fn chunk_count(&self) -> usize {
        self.size.div_ceil(CHUNK_SIZE) as usize
    }

    /// Byte length of chunk `index`.
    pub fn chunk_len(&self, index: usize) -> u64 {
        let offset = index as u64 * CHUNK_SIZE;
        CHUNK_SIZE.min(self.size.saturating_sub(offset))
    }
}
