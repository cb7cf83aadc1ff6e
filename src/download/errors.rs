use crate::persistence::PersistentDataError;

#[derive(Debug)]
pub enum QueueStoreError {
    Serialize { source: serde_json::Error },
    Parse { source: serde_json::Error },
    VersionMismatch { found: u32, expected: u32 },
    Persistence(PersistentDataError),
}

impl std::fmt::Display for QueueStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialize { source } => {
                write!(f, "failed to serialize queue record: {source}")
            }
            Self::Parse { source } => write!(f, "failed to parse queue record: {source}"),
            Self::VersionMismatch { found, expected } => write!(
                f,
                "queue record version {found} does not match current version {expected}"
            ),
            Self::Persistence(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for QueueStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialize { source } | Self::Parse { source } => Some(source),
            Self::Persistence(source) => Some(source),
            Self::VersionMismatch { .. } => None,
        }
    }
}

impl From<PersistentDataError> for QueueStoreError {
    fn from(value: PersistentDataError) -> Self {
        Self::Persistence(value)
    }
}

#[derive(Debug)]
pub enum DownloadError {
    ChannelClosed,
    Store(QueueStoreError),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "download manager channel closed"),
            Self::Store(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(source) => Some(source),
            Self::ChannelClosed => None,
        }
    }
}

impl From<QueueStoreError> for DownloadError {
    fn from(value: QueueStoreError) -> Self {
        Self::Store(value)
    }
}
