use super::{ChunkWriter, FileError, FileHandle, FileManager, WriteError};
use crate::download::entry::{CHUNK_SIZE, Entry};
use crate::hash::Hash;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

pub const DEFAULT_UNFINISHED_SUFFIX: &str = ".unfinished";

/// Disk-backed file manager. Each reserved file lives under the share root at
/// its entry path, carrying the unfinished suffix until every chunk verified.
pub struct LocalFileManager {
    root: PathBuf,
    unfinished_suffix: String,
}

impl LocalFileManager {
    pub fn new(root: &Path, unfinished_suffix: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            unfinished_suffix: unfinished_suffix.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate leftover unfinished files under the root. Runs once at
    /// startup; the caller signals the manager once the scan is done.
    pub async fn scan_cache(&self) -> Result<Vec<PathBuf>, FileError> {
        let mut unfinished = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(FileError::Io { path: dir, source }),
            };
            while let Some(dir_entry) =
                rd.next_entry()
                    .await
                    .map_err(|source| FileError::Io {
                        path: dir.clone(),
                        source,
                    })?
            {
                let path = dir_entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&self.unfinished_suffix))
                {
                    unfinished.push(path);
                }
            }
        }
        Ok(unfinished)
    }

    fn dir_for(&self, entry: &Entry) -> PathBuf {
        let mut dir = self.root.clone();
        for part in entry.path.split('/').filter(|p| !p.is_empty()) {
            dir.push(part);
        }
        dir
    }
}

#[async_trait]
impl FileManager for LocalFileManager {
    async fn new_file(&self, entry: &Entry) -> Result<Arc<dyn FileHandle>, FileError> {
        let dir = self.dir_for(entry);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| FileError::from_io(dir.clone(), source))?;

        let final_path = dir.join(&entry.name);
        if final_path.exists() {
            return Err(FileError::AlreadyExists { path: final_path });
        }
        let part_path = dir.join(format!("{}{}", entry.name, self.unfinished_suffix));

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&part_path)
            .await
            .map_err(|source| FileError::Create {
                path: part_path.clone(),
                source,
            })?;
        file.set_len(entry.size)
            .await
            .map_err(|source| FileError::from_io(part_path.clone(), source))?;

        Ok(Arc::new(LocalFileHandle {
            part_path,
            final_path,
            size: entry.size,
        }))
    }
}

#[derive(Debug)]
struct LocalFileHandle {
    part_path: PathBuf,
    final_path: PathBuf,
    size: u64,
}

#[async_trait]
impl FileHandle for LocalFileHandle {
    async fn open_writer(
        &self,
        index: usize,
        expected: Hash,
    ) -> Result<Box<dyn ChunkWriter>, FileError> {
        let offset = index as u64 * CHUNK_SIZE;
        let chunk_len = CHUNK_SIZE.min(self.size.saturating_sub(offset));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.part_path)
            .await
            .map_err(|source| FileError::from_io(self.part_path.clone(), source))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|source| FileError::from_io(self.part_path.clone(), source))?;
        Ok(Box::new(LocalChunkWriter {
            path: self.part_path.clone(),
            file,
            hasher: Sha1::new(),
            expected,
            chunk_len,
            written: 0,
        }))
    }

    async fn finalize(&self) -> Result<(), FileError> {
        match tokio::fs::rename(&self.part_path, &self.final_path).await {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                tokio::fs::copy(&self.part_path, &self.final_path)
                    .await
                    .map_err(|source| FileError::from_io(self.final_path.clone(), source))?;
                tokio::fs::remove_file(&self.part_path)
                    .await
                    .map_err(|source| FileError::from_io(self.part_path.clone(), source))?;
                tracing::warn!(
                    source = %self.part_path.display(),
                    target = %self.final_path.display(),
                    error = %rename_err,
                    "rename during finalize failed; used copy/remove fallback"
                );
                Ok(())
            }
        }
    }

    async fn abandon(&self) {
        if let Err(error) = tokio::fs::remove_file(&self.part_path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %self.part_path.display(),
                error = %error,
                "failed to remove abandoned part file"
            );
        }
    }
}

struct LocalChunkWriter {
    path: PathBuf,
    file: tokio::fs::File,
    hasher: Sha1,
    expected: Hash,
    chunk_len: u64,
    written: u64,
}

#[async_trait]
impl ChunkWriter for LocalChunkWriter {
    async fn write(&mut self, frame: &[u8]) -> Result<(), WriteError> {
        let attempted = self.written + frame.len() as u64;
        if attempted > self.chunk_len {
            return Err(WriteError::ChunkOverflow {
                chunk_len: self.chunk_len,
                attempted,
            });
        }
        self.file
            .write_all(frame)
            .await
            .map_err(|source| WriteError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.hasher.update(frame);
        self.written = attempted;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), WriteError> {
        self.file.flush().await.map_err(|source| WriteError::Io {
            path: self.path.clone(),
            source,
        })?;
        let actual = Hash::from_bytes(self.hasher.finalize().into());
        if actual != self.expected {
            return Err(WriteError::HashMismatch {
                expected: self.expected,
                actual,
            });
        }
        Ok(())
    }
}

/// SHA-1 of a byte slice as a chunk `Hash`. Handy for composing entries from
/// known content (tests, local sharing).
pub fn hash_of(data: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Hash::from_bytes(hasher.finalize().into())
}
