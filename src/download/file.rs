use crate::download::chunk::{ChunkDownload, ChunkSnapshot, ChunkStatus};
use crate::download::entry::Entry;
use crate::download::peers::OccupiedPeers;
use crate::download::types::DownloadId;
use crate::file_manager::FileHandle;
use crate::hash::Hash;
use crate::peer::PeerId;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    GettingHashes,
    Downloading,
    Complete,
    Paused,
    /// No connected peer is known for the entry; retried on rescan.
    NoSource,
    /// Local disk pressure; retried on rescan.
    NotEnoughFreeSpace,
    UnableToCreateFile,
    IoError,
}

impl DownloadStatus {
    /// Soft errors clear without user intervention; observing one arms the
    /// periodic rescan timer.
    pub fn is_soft_error(&self) -> bool {
        matches!(self, Self::NoSource | Self::NotEnoughFreeSpace)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::UnableToCreateFile | Self::IoError)
    }
}

/// Sliding-window byte counter. Samples are cumulative totals; the rate is
/// the delta over the window and decays to zero once samples go stale.
#[derive(Debug, Default)]
pub(crate) struct RateEstimator {
    samples: VecDeque<(Instant, u64)>,
}

impl RateEstimator {
    pub fn record(&mut self, total_bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, total_bytes));
        while self.samples.len() > 1 {
            let Some(&(t, _)) = self.samples.front() else {
                break;
            };
            if now.duration_since(t) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the sample window, 0 when idle.
    pub fn rate(&self) -> u64 {
        let (Some(&(t_first, b_first)), Some(&(t_last, b_last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        if Instant::now().duration_since(t_last) > RATE_WINDOW {
            return 0;
        }
        let bytes = b_last.saturating_sub(b_first);
        let secs = t_last.duration_since(t_first).as_secs_f64();
        if secs < 1e-6 {
            return bytes;
        }
        (bytes as f64 / secs) as u64
    }
}

/// Per-file download state machine. The manager owns it and drives every
/// transition; chunk and hash work happens in tasks that report back by id.
pub struct FileDownload {
    pub id: DownloadId,
    pub entry: Entry,
    pub peer_source: PeerId,
    status: DownloadStatus,
    paused_from: Option<DownloadStatus>,
    pub file: Option<Arc<dyn FileHandle>>,
    pub chunks: Vec<ChunkDownload>,
    pub restored_complete: bool,
    pub hash_request_in_flight: bool,
    rate: RateEstimator,
}

impl FileDownload {
    pub fn new(id: DownloadId, entry: Entry, peer_source: PeerId, restored_complete: bool) -> Self {
        let mut download = Self {
            id,
            entry,
            peer_source,
            status: DownloadStatus::Queued,
            paused_from: None,
            file: None,
            chunks: Vec::new(),
            restored_complete,
            hash_request_in_flight: false,
            rate: RateEstimator::default(),
        };
        if restored_complete {
            download.status = DownloadStatus::Complete;
        } else {
            download.populate_chunks_from_entry();
        }
        download
    }

    /// Chunks the browse response already described. Hashes fetched over the
    /// side channel arrive later through `add_chunk_hash`.
    fn populate_chunks_from_entry(&mut self) {
        let hashes = self.entry.chunk_hashes.clone();
        for (index, hash) in hashes.into_iter().enumerate() {
            self.chunks
                .push(ChunkDownload::new(index, hash, self.peer_source));
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
    }

    pub fn pause(&mut self) {
        if self.status != DownloadStatus::Paused && !self.status.is_terminal() {
            self.paused_from = Some(self.status);
            self.status = DownloadStatus::Paused;
        }
    }

    pub fn unpause(&mut self) {
        if self.status == DownloadStatus::Paused {
            self.status = self.paused_from.take().unwrap_or(DownloadStatus::Queued);
        }
    }

    pub fn has_all_hashes(&self) -> bool {
        self.chunks.len() == self.entry.chunk_count()
    }

    /// True while the file still needs its hash stream and no request is
    /// pending. Paused and dead files never ask.
    pub fn wants_hashes(&self) -> bool {
        !self.restored_complete
            && !self.hash_request_in_flight
            && !self.has_all_hashes()
            && matches!(
                self.status,
                DownloadStatus::Queued
                    | DownloadStatus::GettingHashes
                    | DownloadStatus::NoSource
                    | DownloadStatus::Downloading
            )
    }

    /// Next hash of the side-channel stream. Hashes arrive in chunk order;
    /// the source peer is the first known holder.
    pub fn add_chunk_hash(&mut self, hash: Hash) {
        let index = self.chunks.len();
        if index >= self.entry.chunk_count() {
            tracing::warn!(
                id = self.id,
                name = %self.entry.name,
                "extra chunk hash beyond the expected count; ignored"
            );
            return;
        }
        self.chunks
            .push(ChunkDownload::new(index, hash, self.peer_source));
    }

    pub fn add_chunk_holder(&mut self, chunk_hash: Hash, peer: PeerId) {
        if let Some(chunk) = self.chunks.iter_mut().find(|c| c.hash == chunk_hash) {
            chunk.add_holder(peer);
        }
    }

    /// First schedulable chunk, recomputed from scratch on every call. Failed
    /// chunks whose cool-down elapsed are flipped back to idle on the way.
    pub fn first_schedulable_chunk(
        &mut self,
        now: Instant,
        occupied: &OccupiedPeers,
    ) -> Option<usize> {
        if self.status == DownloadStatus::Paused || self.status.is_terminal() {
            return None;
        }
        for chunk in &mut self.chunks {
            chunk.revert_if_cooled(now);
        }
        self.chunks
            .iter()
            .position(|chunk| chunk.is_schedulable(occupied))
    }

    pub fn on_chunk_progress(&mut self, index: usize, bytes_transferred: u64) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.bytes_transferred = bytes_transferred;
        }
        let total = self.bytes_transferred();
        self.rate.record(total);
    }

    pub fn on_chunk_complete(&mut self, index: usize) {
        let len = self.entry.chunk_len(index);
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Complete;
            chunk.bytes_transferred = len;
        }
    }

    /// Failure is per chunk: progress resets, the chunk waits out a cool-down
    /// and neighbours are untouched. The failing holder is demoted so a
    /// retry prefers other holders.
    pub fn on_chunk_failed(&mut self, index: usize, peer: &PeerId, cooldown: Duration) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Failed;
            chunk.bytes_transferred = 0;
            chunk.cooldown_until = Some(Instant::now() + cooldown);
            chunk.demote_holder(peer);
        }
    }

    pub fn all_chunks_complete(&self) -> bool {
        self.has_all_hashes()
            && self
                .chunks
                .iter()
                .all(|chunk| chunk.status == ChunkStatus::Complete)
    }

    pub fn bytes_transferred(&self) -> u64 {
        if self.status == DownloadStatus::Complete {
            return self.entry.size;
        }
        self.chunks.iter().map(|c| c.bytes_transferred).sum()
    }

    pub fn download_rate(&self) -> u64 {
        self.rate.rate()
    }

    /// Harvest chunks that are neither idle nor complete (in flight or failed
    /// pending retry), up to `max` across the whole collection.
    pub fn collect_unfinished_chunks(&self, out: &mut Vec<ChunkSnapshot>, max: usize) {
        for chunk in &self.chunks {
            if out.len() >= max {
                return;
            }
            if matches!(chunk.status, ChunkStatus::Idle | ChunkStatus::Complete) {
                continue;
            }
            out.push(ChunkSnapshot {
                download_id: self.id,
                index: chunk.index,
                hash: chunk.hash,
                status: chunk.status,
                bytes_transferred: chunk.bytes_transferred,
                holder_count: chunk.holders().len(),
            });
        }
    }
}
