use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, PersistentDataError>;

#[derive(Debug)]
pub enum PersistentDataError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PersistentDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to ensure directory '{}': {source}",
                    path.display()
                )
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read file '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write file '{}': {source}", path.display())
            }
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' -> '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Remove { path, source } => {
                write!(f, "failed to remove file '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for PersistentDataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Rename { source, .. }
            | Self::Remove { source, .. } => Some(source),
        }
    }
}

/// Key/value store over a data directory, one file per name. Writes are
/// atomic replaces (write to `<name>.tmp`, rename over the final path), so a
/// crash mid-save leaves either the old or the new record, never a torn one.
#[derive(Debug, Clone)]
pub struct PersistentData {
    dir: PathBuf,
}

impl PersistentData {
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| PersistentDataError::EnsureDir {
                path: dir.to_path_buf(),
                source,
            })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `Ok(None)` means the record does not exist; every other failure is an
    /// I/O error the caller may recover from.
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistentDataError::ReadFile { path, source }),
        }
    }

    pub async fn set(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| PersistentDataError::WriteFile {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| PersistentDataError::Rename {
                from: tmp,
                to: path,
                source,
            })?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistentDataError::Remove { path, source }),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}
