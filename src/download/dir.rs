use crate::download::entry::Entry;
use crate::download::types::DownloadId;
use crate::peer::PeerId;

/// Queue placeholder for a directory entry. It holds a slot until the remote
/// listing arrives; the children then replace it at the same position.
pub struct DirDownload {
    pub id: DownloadId,
    pub entry: Entry,
    pub peer_source: PeerId,
    /// At most one directory is being resolved at a time across the whole
    /// manager; this flag marks the one in flight.
    pub retrieving: bool,
}

impl DirDownload {
    pub fn new(id: DownloadId, entry: Entry, peer_source: PeerId) -> Self {
        Self {
            id,
            entry,
            peer_source,
            retrieving: false,
        }
    }
}
