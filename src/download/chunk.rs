use crate::download::peers::OccupiedPeers;
use crate::download::types::DownloadId;
use crate::file_manager::{ChunkWriter, WriteError};
use crate::hash::Hash;
use crate::peer::{Peer, PeerError, PeerId};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Idle,
    Downloading,
    Complete,
    Failed,
}

/// One chunk of a file being downloaded. Created when its hash becomes known;
/// schedulable while `Idle` with at least one free holder.
#[derive(Debug)]
pub struct ChunkDownload {
    pub index: usize,
    pub hash: Hash,
    known_holders: Vec<PeerId>,
    pub status: ChunkStatus,
    pub bytes_transferred: u64,
    pub cooldown_until: Option<Instant>,
}

impl ChunkDownload {
    pub fn new(index: usize, hash: Hash, first_holder: PeerId) -> Self {
        Self {
            index,
            hash,
            known_holders: vec![first_holder],
            status: ChunkStatus::Idle,
            bytes_transferred: 0,
            cooldown_until: None,
        }
    }

    /// Holders keep insertion order; peers the remote announces later only
    /// extend the list. Duplicates are ignored.
    pub fn add_holder(&mut self, peer: PeerId) {
        if !self.known_holders.contains(&peer) {
            self.known_holders.push(peer);
        }
    }

    pub fn holders(&self) -> &[PeerId] {
        &self.known_holders
    }

    /// A holder that failed a transfer moves to the back of the list. It
    /// stays eligible, but other holders get tried first on retry.
    pub fn demote_holder(&mut self, peer: &PeerId) {
        if let Some(idx) = self.known_holders.iter().position(|p| p == peer) {
            let demoted = self.known_holders.remove(idx);
            self.known_holders.push(demoted);
        }
    }

    /// A failed chunk becomes schedulable again once its cool-down elapsed.
    /// Returns true if the status flipped back to `Idle`.
    pub fn revert_if_cooled(&mut self, now: Instant) -> bool {
        if self.status == ChunkStatus::Failed
            && self.cooldown_until.is_none_or(|until| now >= until)
        {
            self.status = ChunkStatus::Idle;
            self.cooldown_until = None;
            return true;
        }
        false
    }

    /// First free holder in insertion order; insertion order is stable and
    /// deduplicated, so the choice is deterministic.
    pub fn pick_holder(&self, occupied: &OccupiedPeers) -> Option<PeerId> {
        self.known_holders
            .iter()
            .find(|peer| !occupied.is_occupied(peer))
            .copied()
    }

    pub fn is_schedulable(&self, occupied: &OccupiedPeers) -> bool {
        self.status == ChunkStatus::Idle && self.pick_holder(occupied).is_some()
    }
}

/// Cross-file view of one chunk, handed out by `getUnfinishedChunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSnapshot {
    pub download_id: DownloadId,
    pub index: usize,
    pub hash: Hash,
    pub status: ChunkStatus,
    pub bytes_transferred: u64,
    pub holder_count: usize,
}

#[derive(Debug)]
pub enum ChunkTransferError {
    Peer(PeerError),
    Write(WriteError),
}

impl std::fmt::Display for ChunkTransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(source) => write!(f, "{source}"),
            Self::Write(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ChunkTransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Peer(source) => Some(source),
            Self::Write(source) => Some(source),
        }
    }
}

/// Progress and completion reports from a transfer task back to the manager.
#[derive(Debug)]
pub enum TransferUpdate {
    Progress {
        download_id: DownloadId,
        index: usize,
        bytes_transferred: u64,
    },
    Finished {
        download_id: DownloadId,
        index: usize,
        peer: PeerId,
        result: Result<u64, ChunkTransferError>,
    },
}

/// Move the bytes of one chunk from `peer` into `writer`. Runs as a spawned
/// task; every outcome ends in exactly one `Finished` update.
pub(crate) async fn transfer_chunk(
    download_id: DownloadId,
    index: usize,
    hash: Hash,
    peer: Arc<dyn Peer>,
    writer: Box<dyn ChunkWriter>,
    updates: mpsc::UnboundedSender<TransferUpdate>,
) {
    let peer_id = peer.id();
    let result = run_transfer(download_id, index, hash, peer, writer, &updates).await;
    let _ = updates.send(TransferUpdate::Finished {
        download_id,
        index,
        peer: peer_id,
        result,
    });
}

async fn run_transfer(
    download_id: DownloadId,
    index: usize,
    hash: Hash,
    peer: Arc<dyn Peer>,
    mut writer: Box<dyn ChunkWriter>,
    updates: &mpsc::UnboundedSender<TransferUpdate>,
) -> Result<u64, ChunkTransferError> {
    let mut stream = peer
        .get_chunk(hash, 0)
        .await
        .map_err(ChunkTransferError::Peer)?;

    let mut total = 0u64;
    while let Some(frame) = stream.recv().await {
        let frame = frame.map_err(ChunkTransferError::Peer)?;
        writer
            .write(&frame)
            .await
            .map_err(ChunkTransferError::Write)?;
        total += frame.len() as u64;
        let _ = updates.send(TransferUpdate::Progress {
            download_id,
            index,
            bytes_transferred: total,
        });
    }
    // Commit verifies the content hash; a truncated or corrupt stream fails
    // here and the partial bytes are discarded by the caller.
    writer.commit().await.map_err(ChunkTransferError::Write)?;
    Ok(total)
}
