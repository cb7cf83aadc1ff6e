use crate::download::chunk::{ChunkSnapshot, ChunkStatus, TransferUpdate, transfer_chunk};
use crate::download::dir::DirDownload;
use crate::download::entry::{Entry, EntryType};
use crate::download::errors::{DownloadError, QueueStoreError};
use crate::download::file::{DownloadStatus, FileDownload};
use crate::download::peers::{OccupiedPeers, PeerRole};
use crate::download::store::{self, QueueEntry};
use crate::download::types::DownloadId;
use crate::file_manager::{FileError, FileManager};
use crate::logging::{redact_hex, warn_throttled};
use crate::peer::{HashMessage, PeerError, PeerId, PeerManager};
use crate::persistence::PersistentData;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

pub type Result<T> = std::result::Result<T, DownloadError>;

const NO_SOURCE_WARN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    /// Global cap on concurrently downloading chunks.
    pub number_of_downloaders: usize,
    /// Single-shot rescan delay armed when a soft error is observed.
    pub rescan_period_if_error: Duration,
    /// How long a failed chunk waits before becoming schedulable again.
    pub chunk_retry_cooldown: Duration,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            number_of_downloaders: 3,
            rescan_period_if_error: Duration::from_secs(30),
            chunk_retry_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    File,
    Dir,
}

/// Consistent point-in-time view of one queued download.
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub kind: DownloadKind,
    pub entry: Entry,
    pub peer_source: PeerId,
    pub status: DownloadStatus,
    pub bytes_transferred: u64,
}

#[derive(Debug)]
pub enum DownloadCommand {
    AddDownload {
        entry: Entry,
        peer_source: PeerId,
        reply: oneshot::Sender<Option<DownloadId>>,
    },
    GetDownloads {
        reply: oneshot::Sender<Vec<DownloadSnapshot>>,
    },
    GetUnfinishedChunks {
        max: usize,
        reply: oneshot::Sender<Vec<ChunkSnapshot>>,
    },
    GetDownloadRate {
        reply: oneshot::Sender<u64>,
    },
    SetPaused {
        ids: Vec<DownloadId>,
        paused: bool,
        reply: oneshot::Sender<usize>,
    },
    Cancel {
        ids: Vec<DownloadId>,
        complete_only: bool,
        reply: oneshot::Sender<usize>,
    },
    Refresh {
        reply: oneshot::Sender<()>,
    },
    FileCacheLoaded {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct DownloadManagerHandle {
    tx: mpsc::Sender<DownloadCommand>,
}

impl DownloadManagerHandle {
    /// Append an entry to the queue. Returns the assigned id, or None when
    /// the entry was already queued and the request dropped.
    pub async fn add_download(
        &self,
        entry: Entry,
        peer_source: PeerId,
    ) -> Result<Option<DownloadId>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::AddDownload {
                entry,
                peer_source,
                reply: tx,
            })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn get_downloads(&self) -> Result<Vec<DownloadSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::GetDownloads { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    /// Up to `max` chunks that are in flight or failed pending retry, across
    /// every file in queue order.
    pub async fn get_unfinished_chunks(&self, max: usize) -> Result<Vec<ChunkSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::GetUnfinishedChunks { max, reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    /// Bytes per second summed over files currently downloading.
    pub async fn get_download_rate(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::GetDownloadRate { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn set_paused(&self, ids: Vec<DownloadId>, paused: bool) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::SetPaused {
                ids,
                paused,
                reply: tx,
            })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    /// Remove downloads from the queue. An empty `ids` list targets every
    /// download in the queue; with `complete_only` set, only items that
    /// already finished are purged (so `cancel(vec![], true)` clears the
    /// finished entries and leaves the rest alone).
    pub async fn cancel(&self, ids: Vec<DownloadId>, complete_only: bool) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::Cancel {
                ids,
                complete_only,
                reply: tx,
            })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    /// Re-enter both scan loops immediately.
    pub async fn refresh(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::Refresh { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    /// The file manager finished its startup scan; the persisted queue is
    /// loaded now, not before.
    pub async fn file_cache_loaded(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::FileCacheLoaded { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    /// Save the queue and stop the manager task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloadCommand::Shutdown { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }
}

pub fn start_manager(
    cfg: DownloadManagerConfig,
    file_manager: Arc<dyn FileManager>,
    peer_manager: Arc<dyn PeerManager>,
    persistent_data: PersistentData,
) -> (DownloadManagerHandle, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let join = tokio::spawn(run_manager(
        cfg,
        file_manager,
        peer_manager,
        persistent_data,
        cmd_rx,
    ));
    (DownloadManagerHandle { tx: cmd_tx }, join)
}

/// Tagged queue item: shared header, per-variant payload. Operations that
/// only apply to files (chunk selection, rates) match on the variant.
pub(crate) enum Download {
    File(FileDownload),
    Dir(DirDownload),
}

impl Download {
    fn id(&self) -> DownloadId {
        match self {
            Self::File(f) => f.id,
            Self::Dir(d) => d.id,
        }
    }

    fn entry(&self) -> &Entry {
        match self {
            Self::File(f) => &f.entry,
            Self::Dir(d) => &d.entry,
        }
    }

    fn peer_source(&self) -> PeerId {
        match self {
            Self::File(f) => f.peer_source,
            Self::Dir(d) => d.peer_source,
        }
    }

    fn status(&self) -> DownloadStatus {
        match self {
            Self::File(f) => f.status(),
            // Placeholders sit in the queue until resolved.
            Self::Dir(_) => DownloadStatus::Queued,
        }
    }
}

/// Events from hash-request and directory-listing tasks.
enum SideEvent {
    Hash {
        download_id: DownloadId,
        message: HashMessage,
    },
    HashStreamEnded {
        download_id: DownloadId,
        peer: PeerId,
        error: Option<PeerError>,
    },
    EntriesRetrieved {
        download_id: DownloadId,
        result: std::result::Result<Vec<Entry>, PeerError>,
    },
}

struct InflightTransfer {
    peer: PeerId,
    abort: AbortHandle,
}

struct InflightHashRequest {
    peer: PeerId,
    abort: AbortHandle,
}

struct ManagerState {
    cfg: DownloadManagerConfig,
    file_manager: Arc<dyn FileManager>,
    peer_manager: Arc<dyn PeerManager>,
    persistent_data: PersistentData,
    downloads: Vec<Download>,
    next_id: DownloadId,
    /// Number of chunks in the downloading state; bounded by the configured
    /// cap. Decremented before the free-peer signal is acted on.
    number_of_downloads: usize,
    occupied_hashes: OccupiedPeers,
    occupied_chunks: OccupiedPeers,
    /// Id of the directory currently being resolved, if any.
    retrieving: Option<DownloadId>,
    inflight: HashMap<(DownloadId, usize), InflightTransfer>,
    hash_requests: HashMap<DownloadId, InflightHashRequest>,
    rescan_at: Option<Instant>,
    transfer_tx: mpsc::UnboundedSender<TransferUpdate>,
    side_tx: mpsc::UnboundedSender<SideEvent>,
    queue_loaded: bool,
}

async fn run_manager(
    cfg: DownloadManagerConfig,
    file_manager: Arc<dyn FileManager>,
    peer_manager: Arc<dyn PeerManager>,
    persistent_data: PersistentData,
    mut cmd_rx: mpsc::Receiver<DownloadCommand>,
) {
    let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();
    let (side_tx, mut side_rx) = mpsc::unbounded_channel();
    let mut state = ManagerState {
        cfg,
        file_manager,
        peer_manager,
        persistent_data,
        downloads: Vec::new(),
        next_id: 1,
        number_of_downloads: 0,
        occupied_hashes: OccupiedPeers::new(PeerRole::AskingForHashes),
        occupied_chunks: OccupiedPeers::new(PeerRole::DownloadingChunk),
        retrieving: None,
        inflight: HashMap::new(),
        hash_requests: HashMap::new(),
        rescan_at: None,
        transfer_tx,
        side_tx,
        queue_loaded: false,
    };

    loop {
        let rescan_at = state.rescan_at;
        tokio::select! {
            _ = rescan_sleep(rescan_at) => {
                state.rescan_at = None;
                tracing::debug!("rescan timer fired");
                scan_queue(&mut state).await;
                scan_queue_to_retrieve_entries(&mut state);
            }
            Some(update) = transfer_rx.recv() => {
                handle_transfer_update(&mut state, update).await;
            }
            Some(event) = side_rx.recv() => {
                handle_side_event(&mut state, event).await;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    save_queue_to_file(&state).await;
                    abort_all_tasks(&mut state);
                    break;
                };
                if let DownloadCommand::Shutdown { reply } = cmd {
                    save_queue_to_file(&state).await;
                    abort_all_tasks(&mut state);
                    let _ = reply.send(());
                    break;
                }
                handle_command(&mut state, cmd).await;
            }
        }
    }
    tracing::debug!("download manager stopped");
}

async fn rescan_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn handle_command(state: &mut ManagerState, cmd: DownloadCommand) {
    match cmd {
        DownloadCommand::AddDownload {
            entry,
            peer_source,
            reply,
        } => {
            let id = add_download(state, entry, peer_source, false, None).await;
            let _ = reply.send(id);
        }
        DownloadCommand::GetDownloads { reply } => {
            let _ = reply.send(snapshots(state));
        }
        DownloadCommand::GetUnfinishedChunks { max, reply } => {
            let mut out = Vec::new();
            for download in &state.downloads {
                if out.len() >= max {
                    break;
                }
                if let Download::File(fd) = download {
                    fd.collect_unfinished_chunks(&mut out, max);
                }
            }
            let _ = reply.send(out);
        }
        DownloadCommand::GetDownloadRate { reply } => {
            let rate = state
                .downloads
                .iter()
                .filter_map(|d| match d {
                    Download::File(fd) if fd.status() == DownloadStatus::Downloading => {
                        Some(fd.download_rate())
                    }
                    _ => None,
                })
                .sum();
            let _ = reply.send(rate);
        }
        DownloadCommand::SetPaused { ids, paused, reply } => {
            let mut changed = 0;
            for id in ids {
                let Some(Download::File(fd)) =
                    state.downloads.iter_mut().find(|d| d.id() == id)
                else {
                    continue;
                };
                if paused {
                    fd.pause();
                } else {
                    fd.unpause();
                }
                changed += 1;
            }
            if !paused {
                scan_queue(state).await;
                scan_queue_to_retrieve_entries(state);
            }
            let _ = reply.send(changed);
        }
        DownloadCommand::Cancel {
            ids,
            complete_only,
            reply,
        } => {
            let removed = cancel_downloads(state, &ids, complete_only).await;
            let _ = reply.send(removed);
        }
        DownloadCommand::Refresh { reply } => {
            scan_queue(state).await;
            scan_queue_to_retrieve_entries(state);
            let _ = reply.send(());
        }
        DownloadCommand::FileCacheLoaded { reply } => {
            if !state.queue_loaded {
                state.queue_loaded = true;
                load_queue_from_file(state).await;
                scan_queue(state).await;
                scan_queue_to_retrieve_entries(state);
            }
            let _ = reply.send(());
        }
        DownloadCommand::Shutdown { .. } => unreachable!("handled by the run loop"),
    }
}

fn snapshots(state: &ManagerState) -> Vec<DownloadSnapshot> {
    state
        .downloads
        .iter()
        .map(|download| DownloadSnapshot {
            id: download.id(),
            kind: match download {
                Download::File(_) => DownloadKind::File,
                Download::Dir(_) => DownloadKind::Dir,
            },
            entry: download.entry().clone(),
            peer_source: download.peer_source(),
            status: download.status(),
            bytes_transferred: match download {
                Download::File(fd) => fd.bytes_transferred(),
                Download::Dir(_) => 0,
            },
        })
        .collect()
}

fn position_of(state: &ManagerState, id: DownloadId) -> Option<usize> {
    state.downloads.iter().position(|d| d.id() == id)
}

fn arm_rescan_timer(state: &mut ManagerState) {
    if state.rescan_at.is_none() {
        state.rescan_at = Some(Instant::now() + state.cfg.rescan_period_if_error);
    }
}

/// Insert a download. `position` is used by directory resolution to splice
/// children into the placeholder's slot; everything else appends at the tail.
/// Returns None (and warns) for duplicates.
async fn add_download(
    state: &mut ManagerState,
    entry: Entry,
    peer_source: PeerId,
    complete: bool,
    position: Option<usize>,
) -> Option<DownloadId> {
    if state
        .downloads
        .iter()
        .any(|d| d.entry().same_download(&entry))
    {
        tracing::warn!(
            name = %entry.name,
            path = %entry.path,
            "entry already queued, it will not be added"
        );
        return None;
    }

    let id = state.next_id;
    state.next_id += 1;
    let position = position.unwrap_or(state.downloads.len()).min(state.downloads.len());

    match entry.entry_type {
        EntryType::Dir => {
            state
                .downloads
                .insert(position, Download::Dir(DirDownload::new(id, entry, peer_source)));
            scan_queue_to_retrieve_entries(state);
        }
        EntryType::File => {
            let mut fd = FileDownload::new(id, entry, peer_source, complete);
            if !complete {
                reserve_file(state, &mut fd).await;
            }
            state.downloads.insert(position, Download::File(fd));
            try_start_hash_request(state, position).await;
            scan_queue(state).await;
        }
    }
    Some(id)
}

/// Reserve the local slot for a file download, classifying failures into the
/// soft and fatal status families.
async fn reserve_file(state: &mut ManagerState, fd: &mut FileDownload) {
    match state.file_manager.new_file(&fd.entry).await {
        Ok(handle) => {
            fd.file = Some(handle);
            if fd.status() == DownloadStatus::NotEnoughFreeSpace {
                fd.set_status(DownloadStatus::Queued);
            }
            if fd.entry.chunk_count() == 0 {
                // Nothing to transfer; promote the empty file right away.
                finalize_file(fd).await;
            }
        }
        Err(error) => {
            let status = if error.is_soft() {
                DownloadStatus::NotEnoughFreeSpace
            } else if matches!(error, FileError::AlreadyExists { .. } | FileError::Create { .. }) {
                DownloadStatus::UnableToCreateFile
            } else {
                DownloadStatus::IoError
            };
            tracing::warn!(
                name = %fd.entry.name,
                error = %error,
                "failed to reserve local file"
            );
            fd.set_status(status);
            if status.is_soft_error() {
                arm_rescan_timer(state);
            }
        }
    }
}

async fn finalize_file(fd: &mut FileDownload) {
    let Some(file) = fd.file.take() else {
        fd.set_status(DownloadStatus::Complete);
        return;
    };
    match file.finalize().await {
        Ok(()) => fd.set_status(DownloadStatus::Complete),
        Err(error) => {
            tracing::error!(name = %fd.entry.name, error = %error, "failed to finalize file");
            fd.set_status(DownloadStatus::IoError);
        }
    }
}

/// Start the hash side channel for the file at `position` if it needs one and
/// its source peer is connected and free in the hashes role.
async fn try_start_hash_request(state: &mut ManagerState, position: usize) -> bool {
    let Some(Download::File(fd)) = state.downloads.get_mut(position) else {
        return false;
    };
    if !fd.wants_hashes() {
        return false;
    }
    let id = fd.id;
    let source = fd.peer_source;
    if state.occupied_hashes.is_occupied(&source) {
        return false;
    }
    let Some(session) = state.peer_manager.get_peer(&source) else {
        if !fd.status().is_terminal() && fd.status() != DownloadStatus::Paused {
            fd.set_status(DownloadStatus::NoSource);
        }
        if warn_throttled("download_no_source", NO_SOURCE_WARN_INTERVAL) {
            tracing::warn!(peer = %source, name = %fd.entry.name, "no session for source peer");
        }
        arm_rescan_timer(state);
        return false;
    };

    state.occupied_hashes.mark(source);
    fd.hash_request_in_flight = true;
    fd.set_status(DownloadStatus::GettingHashes);
    let entry = fd.entry.clone();
    let side_tx = state.side_tx.clone();
    let abort = tokio::spawn(async move {
        match session.get_hashes(&entry).await {
            Ok(mut rx) => {
                while let Some(message) = rx.recv().await {
                    if side_tx
                        .send(SideEvent::Hash {
                            download_id: id,
                            message,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = side_tx.send(SideEvent::HashStreamEnded {
                    download_id: id,
                    peer: source,
                    error: None,
                });
            }
            Err(error) => {
                let _ = side_tx.send(SideEvent::HashStreamEnded {
                    download_id: id,
                    peer: source,
                    error: Some(error),
                });
            }
        }
    })
    .abort_handle();
    state
        .hash_requests
        .insert(id, InflightHashRequest {
            peer: source,
            abort,
        });
    true
}

/// A peer left the hashes role: hand the role to the first file still
/// missing hashes, in queue order.
async fn peer_no_longer_asking_for_hashes(state: &mut ManagerState) {
    for position in 0..state.downloads.len() {
        if try_start_hash_request(state, position).await {
            return;
        }
    }
}

enum StartChunk {
    Started,
    /// Every connected holder is busy; the next free-peer signal retries.
    WaitingFreePeer,
    /// No holder has a session; soft condition, retried on rescan.
    NoConnectedHolder,
    Failed,
}

async fn start_chunk(state: &mut ManagerState, position: usize, chunk_index: usize) -> StartChunk {
    let (id, chunk_hash, file) = {
        let Some(Download::File(fd)) = state.downloads.get(position) else {
            return StartChunk::Failed;
        };
        let chunk = &fd.chunks[chunk_index];
        (fd.id, chunk.hash, fd.file.clone())
    };
    let Some(file) = file else {
        return StartChunk::Failed;
    };

    // Holder policy: first free candidate in insertion order with a live
    // session.
    let (holder, session) = {
        let Some(Download::File(fd)) = state.downloads.get(position) else {
            return StartChunk::Failed;
        };
        let mut any_connected = false;
        let mut chosen = None;
        for peer_id in fd.chunks[chunk_index].holders() {
            let Some(session) = state.peer_manager.get_peer(peer_id) else {
                continue;
            };
            any_connected = true;
            if state.occupied_chunks.is_occupied(peer_id) {
                continue;
            }
            chosen = Some((*peer_id, session));
            break;
        }
        match chosen {
            Some(found) => found,
            None if any_connected => return StartChunk::WaitingFreePeer,
            None => return StartChunk::NoConnectedHolder,
        }
    };

    state.occupied_chunks.mark(holder);
    let writer = match file.open_writer(chunk_index, chunk_hash).await {
        Ok(writer) => writer,
        Err(error) => {
            // The release happens inside the scan; no re-entry needed.
            state.occupied_chunks.release(&holder);
            let Some(Download::File(fd)) = state.downloads.get_mut(position) else {
                return StartChunk::Failed;
            };
            if error.is_soft() {
                tracing::warn!(name = %fd.entry.name, error = %error, "chunk writer blocked");
                fd.set_status(DownloadStatus::NotEnoughFreeSpace);
                arm_rescan_timer(state);
            } else {
                tracing::error!(name = %fd.entry.name, error = %error, "chunk writer failed");
                fd.set_status(DownloadStatus::IoError);
            }
            return StartChunk::Failed;
        }
    };

    let Some(Download::File(fd)) = state.downloads.get_mut(position) else {
        state.occupied_chunks.release(&holder);
        return StartChunk::Failed;
    };
    let chunk = &mut fd.chunks[chunk_index];
    chunk.status = ChunkStatus::Downloading;
    chunk.bytes_transferred = 0;
    chunk.cooldown_until = None;
    let mark_downloading = matches!(
        fd.status(),
        DownloadStatus::Queued | DownloadStatus::NoSource | DownloadStatus::NotEnoughFreeSpace
    ) || (fd.status() == DownloadStatus::GettingHashes && !fd.hash_request_in_flight);
    if mark_downloading {
        fd.set_status(DownloadStatus::Downloading);
    }
    state.number_of_downloads += 1;
    tracing::debug!(
        id,
        chunk = chunk_index,
        peer = %redact_hex(&holder.to_hex()),
        active = state.number_of_downloads,
        "chunk transfer started"
    );

    let abort = tokio::spawn(transfer_chunk(
        id,
        chunk_index,
        chunk_hash,
        session,
        writer,
        state.transfer_tx.clone(),
    ))
    .abort_handle();
    state
        .inflight
        .insert((id, chunk_index), InflightTransfer {
            peer: holder,
            abort,
        });
    StartChunk::Started
}

/// The scheduling loop. Each pass walks the queue in order and asks every
/// eligible file for at most one chunk, so a file at the front cannot claim
/// the whole budget before files behind it get a turn. While the budget has
/// room and a pass started something, the walk re-enters for another round,
/// the way chunk-ready and free-peer signals re-enter it in steady state. On
/// the way it retries blocked file reservations and missing hash streams so
/// soft errors clear without external help.
async fn scan_queue(state: &mut ManagerState) {
    tracing::debug!(
        queue = state.downloads.len(),
        active = state.number_of_downloads,
        "scanning the queue"
    );
    let now = Instant::now();
    let mut soft_error_seen = false;

    loop {
        let mut started_any = false;

        for position in 0..state.downloads.len() {
            {
                let Some(Download::File(fd)) = state.downloads.get(position) else {
                    continue;
                };
                if fd.status() == DownloadStatus::Paused || fd.status().is_terminal() {
                    continue;
                }
            }

            // Retry a reservation that previously hit disk pressure. The
            // item is lifted out while the file manager runs so nothing else
            // aliases it; it goes back to the same slot before the scan
            // continues.
            let needs_reserve = {
                let Some(Download::File(fd)) = state.downloads.get(position) else {
                    continue;
                };
                fd.file.is_none() && fd.status() == DownloadStatus::NotEnoughFreeSpace
            };
            if needs_reserve {
                let mut download = state.downloads.remove(position);
                if let Download::File(fd) = &mut download {
                    reserve_file(state, fd).await;
                }
                state.downloads.insert(position, download);
            }

            try_start_hash_request(state, position).await;

            // One ask per file per pass.
            if state.number_of_downloads < state.cfg.number_of_downloaders {
                let chunk_index = {
                    let occupied = &state.occupied_chunks;
                    match state.downloads.get_mut(position) {
                        Some(Download::File(fd)) => fd.first_schedulable_chunk(now, occupied),
                        _ => None,
                    }
                };
                if let Some(chunk_index) = chunk_index {
                    match start_chunk(state, position, chunk_index).await {
                        StartChunk::Started => started_any = true,
                        StartChunk::WaitingFreePeer => {}
                        StartChunk::NoConnectedHolder => {
                            if let Some(Download::File(fd)) = state.downloads.get_mut(position)
                                && fd.status() == DownloadStatus::Queued
                            {
                                fd.set_status(DownloadStatus::NoSource);
                                if warn_throttled("download_no_holder", NO_SOURCE_WARN_INTERVAL) {
                                    tracing::warn!(
                                        name = %fd.entry.name,
                                        "no connected holder for any schedulable chunk"
                                    );
                                }
                            }
                            soft_error_seen = true;
                        }
                        StartChunk::Failed => {}
                    }
                }
            }

            if let Some(Download::File(fd)) = state.downloads.get(position) {
                if fd.status().is_soft_error() {
                    soft_error_seen = true;
                }
                // Chunks waiting out a cool-down need a timer to come back.
                if fd
                    .chunks
                    .iter()
                    .any(|chunk| chunk.status == ChunkStatus::Failed)
                {
                    soft_error_seen = true;
                }
            }
        }

        if !started_any || state.number_of_downloads >= state.cfg.number_of_downloaders {
            break;
        }
    }

    if soft_error_seen {
        arm_rescan_timer(state);
    }
}

/// Directory-resolution loop: at most one directory is resolved at a time,
/// the first one in queue order whose source peer is reachable.
fn scan_queue_to_retrieve_entries(state: &mut ManagerState) {
    if state.retrieving.is_some() {
        return;
    }
    for position in 0..state.downloads.len() {
        let (id, source, entry) = {
            let Some(Download::Dir(dir)) = state.downloads.get(position) else {
                continue;
            };
            (dir.id, dir.peer_source, dir.entry.clone())
        };
        let Some(session) = state.peer_manager.get_peer(&source) else {
            if warn_throttled("dir_no_source", NO_SOURCE_WARN_INTERVAL) {
                tracing::warn!(peer = %source, name = %entry.name, "no session to list directory");
            }
            arm_rescan_timer(state);
            continue;
        };
        if let Some(Download::Dir(dir)) = state.downloads.get_mut(position) {
            dir.retrieving = true;
        }
        state.retrieving = Some(id);
        tracing::debug!(id, name = %entry.name, "retrieving directory entries");
        let side_tx = state.side_tx.clone();
        tokio::spawn(async move {
            let result = session.get_entries(&entry).await;
            let _ = side_tx.send(SideEvent::EntriesRetrieved {
                download_id: id,
                result,
            });
        });
        return;
    }
}

async fn handle_side_event(state: &mut ManagerState, event: SideEvent) {
    match event {
        SideEvent::Hash {
            download_id,
            message,
        } => {
            let Some(position) = position_of(state, download_id) else {
                return;
            };
            if let Some(Download::File(fd)) = state.downloads.get_mut(position) {
                match message {
                    HashMessage::Chunk(hash) => fd.add_chunk_hash(hash),
                    HashMessage::Holder { chunk, peer } => fd.add_chunk_holder(chunk, peer),
                }
            }
            // A fresh chunk or holder may be schedulable right away.
            scan_queue(state).await;
        }
        SideEvent::HashStreamEnded {
            download_id,
            peer,
            error,
        } => {
            // Already cancelled: the role was released with the download.
            if state.hash_requests.remove(&download_id).is_none() {
                return;
            }
            if let Some(position) = position_of(state, download_id)
                && let Some(Download::File(fd)) = state.downloads.get_mut(position)
            {
                fd.hash_request_in_flight = false;
                let complete = fd.has_all_hashes();
                match (&error, complete) {
                    (None, true) => {
                        // Keep the learned hashes with the entry so they
                        // survive in the persisted queue.
                        fd.entry.chunk_hashes = fd.chunks.iter().map(|c| c.hash).collect();
                        if fd.status() == DownloadStatus::GettingHashes {
                            fd.set_status(DownloadStatus::Downloading);
                        }
                    }
                    _ => {
                        let reason = error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| {
                                "stream ended before all hashes arrived".to_string()
                            });
                        tracing::warn!(
                            id = download_id,
                            peer = %peer,
                            error = %reason,
                            "hash fetch failed; will retry"
                        );
                        if fd.status() == DownloadStatus::GettingHashes {
                            fd.set_status(DownloadStatus::Queued);
                        }
                        arm_rescan_timer(state);
                    }
                }
            }
            if state.occupied_hashes.release(&peer) {
                peer_no_longer_asking_for_hashes(state).await;
            }
            scan_queue(state).await;
        }
        SideEvent::EntriesRetrieved {
            download_id,
            result,
        } => {
            if state.retrieving == Some(download_id) {
                state.retrieving = None;
            }
            let Some(position) = position_of(state, download_id) else {
                scan_queue_to_retrieve_entries(state);
                return;
            };
            match result {
                Ok(entries) => {
                    let source = state.downloads[position].peer_source();
                    state.downloads.remove(position);
                    tracing::debug!(
                        id = download_id,
                        children = entries.len(),
                        "directory resolved; splicing children"
                    );
                    let mut insert_at = position;
                    for child in entries {
                        if add_download(state, child, source, false, Some(insert_at))
                            .await
                            .is_some()
                        {
                            insert_at += 1;
                        }
                    }
                    scan_queue_to_retrieve_entries(state);
                }
                Err(error) => {
                    if let Some(Download::Dir(dir)) = state.downloads.get_mut(position) {
                        dir.retrieving = false;
                        tracing::warn!(
                            id = download_id,
                            name = %dir.entry.name,
                            error = %error,
                            "failed to retrieve directory entries; will retry"
                        );
                    }
                    arm_rescan_timer(state);
                }
            }
        }
    }
}

async fn handle_transfer_update(state: &mut ManagerState, update: TransferUpdate) {
    match update {
        TransferUpdate::Progress {
            download_id,
            index,
            bytes_transferred,
        } => {
            if let Some(position) = position_of(state, download_id)
                && let Some(Download::File(fd)) = state.downloads.get_mut(position)
            {
                fd.on_chunk_progress(index, bytes_transferred);
            }
        }
        TransferUpdate::Finished {
            download_id,
            index,
            peer,
            result,
        } => {
            // A transfer cancelled by the manager already adjusted the
            // counter and released the peer.
            if state.inflight.remove(&(download_id, index)).is_none() {
                return;
            }
            state.number_of_downloads = state.number_of_downloads.saturating_sub(1);

            if let Some(position) = position_of(state, download_id)
                && let Some(Download::File(fd)) = state.downloads.get_mut(position)
            {
                match result {
                    Ok(bytes) => {
                        tracing::debug!(
                            id = download_id,
                            chunk = index,
                            bytes,
                            "chunk transfer finished"
                        );
                        fd.on_chunk_complete(index);
                        if fd.all_chunks_complete() {
                            finalize_file(fd).await;
                            tracing::info!(id = download_id, name = %fd.entry.name, "file complete");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            id = download_id,
                            chunk = index,
                            peer = %peer,
                            error = %error,
                            "chunk transfer failed; cooling down"
                        );
                        let cooldown = state.cfg.chunk_retry_cooldown;
                        fd.on_chunk_failed(index, &peer, cooldown);
                        // Nothing else may wake the scheduler before the
                        // cool-down elapses.
                        arm_rescan_timer(state);
                    }
                }
            }

            // Strict ordering: the counter is already decremented when the
            // free-peer signal re-enters the scheduler.
            if state.occupied_chunks.release(&peer) {
                tracing::debug!(
                    peer = %redact_hex(&peer.to_hex()),
                    active = state.number_of_downloads,
                    "peer free"
                );
                scan_queue(state).await;
            }
        }
    }
}

async fn cancel_downloads(
    state: &mut ManagerState,
    ids: &[DownloadId],
    complete_only: bool,
) -> usize {
    let mut removed = 0;
    let mut chunk_peer_freed = false;

    // An empty id list means the whole queue; the complete-only filter below
    // is what narrows a bulk request down to purging finished entries.
    let targets: Vec<DownloadId> = if ids.is_empty() {
        state.downloads.iter().map(|d| d.id()).collect()
    } else {
        ids.to_vec()
    };

    for id in targets {
        let Some(position) = position_of(state, id) else {
            continue;
        };
        if complete_only && state.downloads[position].status() != DownloadStatus::Complete {
            continue;
        }
        let download = state.downloads.remove(position);
        removed += 1;

        match download {
            Download::File(fd) => {
                if let Some(request) = state.hash_requests.remove(&id) {
                    request.abort.abort();
                    if state.occupied_hashes.release(&request.peer) {
                        peer_no_longer_asking_for_hashes(state).await;
                    }
                }
                let keys: Vec<(DownloadId, usize)> = state
                    .inflight
                    .keys()
                    .filter(|(download_id, _)| *download_id == id)
                    .copied()
                    .collect();
                for key in keys {
                    if let Some(transfer) = state.inflight.remove(&key) {
                        transfer.abort.abort();
                        state.number_of_downloads = state.number_of_downloads.saturating_sub(1);
                        if state.occupied_chunks.release(&transfer.peer) {
                            chunk_peer_freed = true;
                        }
                    }
                }
                if fd.status() != DownloadStatus::Complete
                    && let Some(file) = fd.file
                {
                    file.abandon().await;
                }
                tracing::debug!(id, name = %fd.entry.name, "download cancelled");
            }
            Download::Dir(dir) => {
                if state.retrieving == Some(id) {
                    state.retrieving = None;
                }
                tracing::debug!(id, name = %dir.entry.name, "directory download cancelled");
            }
        }
    }

    if chunk_peer_freed {
        scan_queue(state).await;
    }
    scan_queue_to_retrieve_entries(state);
    removed
}

async fn load_queue_from_file(state: &mut ManagerState) {
    match store::load_queue(&state.persistent_data).await {
        Ok(Some(entries)) => {
            let count = entries.len();
            for queue_entry in entries {
                add_download(
                    state,
                    queue_entry.entry,
                    queue_entry.peer_id,
                    queue_entry.complete,
                    None,
                )
                .await;
            }
            tracing::info!(count, "download queue restored");
        }
        Ok(None) => {
            tracing::warn!("no persisted download queue; starting empty");
        }
        Err(QueueStoreError::VersionMismatch { found, expected }) => {
            tracing::error!(
                found,
                expected,
                "persisted queue version mismatch; discarding the record"
            );
            if let Err(error) = store::remove_queue(&state.persistent_data).await {
                tracing::warn!(error = %error, "failed to remove stale queue record");
            }
        }
        Err(error) => {
            tracing::warn!(error = %error, "failed to load download queue; starting empty");
        }
    }
}

async fn save_queue_to_file(state: &ManagerState) {
    let entries: Vec<QueueEntry> = state
        .downloads
        .iter()
        .map(|download| QueueEntry {
            entry: download.entry().clone(),
            peer_id: download.peer_source(),
            complete: download.status() == DownloadStatus::Complete,
        })
        .collect();
    if let Err(error) = store::save_queue(&state.persistent_data, entries).await {
        tracing::error!(error = %error, "failed to save download queue");
    }
}

fn abort_all_tasks(state: &mut ManagerState) {
    for (_, transfer) in state.inflight.drain() {
        transfer.abort.abort();
    }
    for (_, request) in state.hash_requests.drain() {
        request.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::entry::CHUNK_SIZE;
    use crate::file_manager::LocalFileManager;
    use crate::file_manager::local::{DEFAULT_UNFINISHED_SUFFIX, hash_of};
    use crate::hash::Hash;
    use crate::peer::{Peer, StaticPeerManager};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio::sync::Semaphore;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("lanshare-manager-{tag}-{nanos}"));
        p
    }

    fn peer_id(n: u8) -> PeerId {
        Hash::from_bytes([n; 20])
    }

    /// Channel-driven fake peer. With a gate installed, every frame after
    /// the first of each chunk waits for one semaphore permit, so tests
    /// control exactly when transfers progress and finish.
    struct FakePeer {
        id: PeerId,
        chunks: HashMap<Hash, Vec<u8>>,
        listings: HashMap<String, Vec<Entry>>,
        hash_streams: HashMap<String, Vec<HashMessage>>,
        chunk_gate: Option<Arc<Semaphore>>,
        hash_gate: Option<Arc<Semaphore>>,
        frame_len: usize,
    }

    impl FakePeer {
        fn new(n: u8) -> Self {
            Self {
                id: peer_id(n),
                chunks: HashMap::new(),
                listings: HashMap::new(),
                hash_streams: HashMap::new(),
                chunk_gate: None,
                hash_gate: None,
                frame_len: 1024,
            }
        }

        fn serve_chunk(mut self, data: &[u8]) -> Self {
            self.chunks.insert(hash_of(data), data.to_vec());
            self
        }

        fn serve_listing(mut self, dir_name: &str, children: Vec<Entry>) -> Self {
            self.listings.insert(dir_name.to_string(), children);
            self
        }

        fn serve_hashes(mut self, file_name: &str, messages: Vec<HashMessage>) -> Self {
            self.hash_streams.insert(file_name.to_string(), messages);
            self
        }

        fn gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.chunk_gate = Some(gate);
            self
        }

        fn hash_gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.hash_gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl Peer for FakePeer {
        fn id(&self) -> PeerId {
            self.id
        }

        async fn get_hashes(
            &self,
            entry: &Entry,
        ) -> std::result::Result<mpsc::Receiver<HashMessage>, PeerError> {
            let messages = self
                .hash_streams
                .get(&entry.name)
                .cloned()
                .ok_or_else(|| PeerError::Transfer(format!("no hashes for {}", entry.name)))?;
            let gate = self.hash_gate.clone();
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for message in messages {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                if let Some(gate) = gate {
                    let Ok(permit) = gate.acquire().await else {
                        return;
                    };
                    permit.forget();
                }
            });
            Ok(rx)
        }

        async fn get_entries(
            &self,
            entry: &Entry,
        ) -> std::result::Result<Vec<Entry>, PeerError> {
            self.listings
                .get(&entry.name)
                .cloned()
                .ok_or_else(|| PeerError::EntriesUnavailable(entry.name.clone()))
        }

        async fn get_chunk(
            &self,
            chunk: Hash,
            _offset: u64,
        ) -> std::result::Result<mpsc::Receiver<std::result::Result<Vec<u8>, PeerError>>, PeerError>
        {
            let Some(data) = self.chunks.get(&chunk).cloned() else {
                return Err(PeerError::Transfer(format!("unknown chunk {chunk}")));
            };
            let gate = self.chunk_gate.clone();
            let frame_len = self.frame_len;
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let mut first = true;
                for frame in data.chunks(frame_len) {
                    if !first && let Some(gate) = &gate {
                        let Ok(permit) = gate.acquire().await else {
                            return;
                        };
                        permit.forget();
                    }
                    first = false;
                    if tx.send(Ok(frame.to_vec())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    struct Harness {
        handle: DownloadManagerHandle,
        join: tokio::task::JoinHandle<()>,
        peers: Arc<StaticPeerManager>,
        store: PersistentData,
        root: PathBuf,
    }

    async fn start_harness(tag: &str, cfg: DownloadManagerConfig) -> Harness {
        let root = temp_dir(tag);
        let store = PersistentData::open(&root.join("data"))
            .await
            .expect("open store");
        let file_manager = Arc::new(LocalFileManager::new(
            &root.join("incoming"),
            DEFAULT_UNFINISHED_SUFFIX,
        ));
        let peers = Arc::new(StaticPeerManager::new());
        let (handle, join) = start_manager(cfg, file_manager, peers.clone(), store.clone());
        Harness {
            handle,
            join,
            peers,
            store,
            root,
        }
    }

    impl Harness {
        async fn stop(self) {
            self.handle.shutdown().await.expect("shutdown");
            self.join.await.expect("join");
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    async fn wait_until<F>(handle: &DownloadManagerHandle, what: &str, pred: F) -> Vec<DownloadSnapshot>
    where
        F: Fn(&[DownloadSnapshot]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = handle.get_downloads().await.expect("get downloads");
            if pred(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; last snapshot: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn entry_with_hashes(path: &str, name: &str, data: &[u8]) -> Entry {
        let mut entry = Entry::file(path, name, data.len() as u64);
        entry.chunk_hashes = data
            .chunks(CHUNK_SIZE as usize)
            .map(hash_of)
            .collect();
        entry
    }

    fn test_config() -> DownloadManagerConfig {
        DownloadManagerConfig {
            number_of_downloaders: 3,
            rescan_period_if_error: Duration::from_millis(50),
            chunk_retry_cooldown: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn single_small_file_downloads_end_to_end() {
        let h = start_harness("single-file", test_config()).await;
        let data = vec![0x42_u8; 4096];
        h.peers
            .register(Arc::new(FakePeer::new(1).serve_chunk(&data)));

        let entry = entry_with_hashes("/", "a.bin", &data);
        let id = h
            .handle
            .add_download(entry, peer_id(1))
            .await
            .expect("add")
            .expect("not a duplicate");

        let snapshot = wait_until(&h.handle, "file complete", |s| {
            s.iter()
                .any(|d| d.id == id && d.status == DownloadStatus::Complete)
        })
        .await;
        assert_eq!(snapshot[0].bytes_transferred, 4096);

        let on_disk = std::fs::read(h.root.join("incoming/a.bin")).expect("final bytes");
        assert_eq!(on_disk, data);
        h.stop().await;
    }

    #[tokio::test]
    async fn download_rate_is_positive_while_downloading() {
        let h = start_harness("rate", test_config()).await;
        let gate = Arc::new(Semaphore::new(0));
        let data = vec![0x17_u8; 4096];
        h.peers
            .register(Arc::new(FakePeer::new(1).serve_chunk(&data).gated(gate.clone())));

        h.handle
            .add_download(entry_with_hashes("/", "slow.bin", &data), peer_id(1))
            .await
            .expect("add")
            .expect("queued");

        // Two frames produce two progress samples.
        gate.add_permits(1);
        wait_until(&h.handle, "bytes moving", |s| {
            s[0].bytes_transferred >= 2048
        })
        .await;
        assert_eq!(
            h.handle.get_downloads().await.expect("snapshot")[0].status,
            DownloadStatus::Downloading
        );
        assert!(h.handle.get_download_rate().await.expect("rate") > 0);

        gate.add_permits(16);
        wait_until(&h.handle, "completion", |s| {
            s[0].status == DownloadStatus::Complete
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn directory_placeholder_is_replaced_in_position() {
        let h = start_harness("dir-expand", test_config()).await;
        let f1 = Entry::file("/d", "f1", 10);
        let f2 = Entry::file("/d", "f2", 20);
        let f3 = Entry::file("/d", "f3", 30);
        h.peers.register(Arc::new(
            FakePeer::new(1).serve_listing("d", vec![f1.clone(), f2.clone(), f3.clone()]),
        ));

        h.handle
            .add_download(Entry::file("/", "before.bin", 1), peer_id(9))
            .await
            .expect("add before");
        h.handle
            .add_download(Entry::dir("/", "d"), peer_id(1))
            .await
            .expect("add dir");
        h.handle
            .add_download(Entry::file("/", "after.bin", 2), peer_id(9))
            .await
            .expect("add after");

        let snapshot = wait_until(&h.handle, "directory resolution", |s| {
            s.len() == 5 && s.iter().all(|d| d.kind == DownloadKind::File)
        })
        .await;
        let names: Vec<&str> = snapshot.iter().map(|d| d.entry.name.as_str()).collect();
        assert_eq!(names, ["before.bin", "f1", "f2", "f3", "after.bin"]);
        // Children inherit the directory's source peer.
        assert_eq!(snapshot[1].peer_source, peer_id(1));
        h.stop().await;
    }

    #[tokio::test]
    async fn empty_directory_resolves_to_nothing() {
        let h = start_harness("dir-empty", test_config()).await;
        h.peers
            .register(Arc::new(FakePeer::new(1).serve_listing("empty", Vec::new())));

        h.handle
            .add_download(Entry::file("/", "x.bin", 1), peer_id(9))
            .await
            .expect("add x");
        h.handle
            .add_download(Entry::dir("/", "empty"), peer_id(1))
            .await
            .expect("add dir");
        h.handle
            .add_download(Entry::file("/", "y.bin", 2), peer_id(9))
            .await
            .expect("add y");

        let snapshot = wait_until(&h.handle, "empty dir removal", |s| s.len() == 2).await;
        let names: Vec<&str> = snapshot.iter().map(|d| d.entry.name.as_str()).collect();
        assert_eq!(names, ["x.bin", "y.bin"]);
        h.stop().await;
    }

    #[tokio::test]
    async fn concurrency_cap_limits_simultaneous_chunks() {
        let mut cfg = test_config();
        cfg.number_of_downloaders = 2;
        let h = start_harness("cap", cfg).await;

        let mut gates = Vec::new();
        let mut datas = Vec::new();
        for n in 1..=3u8 {
            let gate = Arc::new(Semaphore::new(0));
            let data = vec![n; 2048];
            h.peers.register(Arc::new(
                FakePeer::new(n).serve_chunk(&data).gated(gate.clone()),
            ));
            gates.push(gate);
            datas.push(data);
        }

        for (n, data) in (1..=3u8).zip(&datas) {
            h.handle
                .add_download(
                    entry_with_hashes("/", &format!("f{n}.bin"), data),
                    peer_id(n),
                )
                .await
                .expect("add")
                .expect("queued");
        }

        let downloading = |s: &[DownloadSnapshot]| {
            s.iter()
                .filter(|d| d.status == DownloadStatus::Downloading)
                .count()
        };
        wait_until(&h.handle, "two transfers running", |s| downloading(s) == 2).await;
        // Give the scheduler a chance to (incorrectly) start a third.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(downloading(&snapshot), 2);

        let unfinished = h.handle.get_unfinished_chunks(10).await.expect("chunks");
        assert_eq!(unfinished.len(), 2);
        assert!(
            unfinished
                .iter()
                .all(|c| c.status == ChunkStatus::Downloading)
        );

        // Finish the first transfer; the third may start only now.
        gates[0].add_permits(16);
        wait_until(&h.handle, "third transfer admitted", |s| {
            s.iter().any(|d| d.status == DownloadStatus::Complete) && downloading(s) == 2
        })
        .await;

        gates[1].add_permits(16);
        gates[2].add_permits(16);
        wait_until(&h.handle, "all complete", |s| {
            s.iter().all(|d| d.status == DownloadStatus::Complete)
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn zero_downloaders_never_transfers_but_still_resolves_dirs() {
        let mut cfg = test_config();
        cfg.number_of_downloaders = 0;
        let h = start_harness("zero-cap", cfg).await;
        let data = vec![0x33_u8; 512];
        h.peers.register(Arc::new(
            FakePeer::new(1)
                .serve_chunk(&data)
                .serve_listing("d", vec![Entry::file("/d", "child.bin", 5)]),
        ));

        h.handle
            .add_download(entry_with_hashes("/", "never.bin", &data), peer_id(1))
            .await
            .expect("add file");
        h.handle
            .add_download(Entry::dir("/", "d"), peer_id(1))
            .await
            .expect("add dir");

        let snapshot = wait_until(&h.handle, "dir resolved", |s| {
            s.len() == 2 && s.iter().all(|d| d.kind == DownloadKind::File)
        })
        .await;
        assert!(
            snapshot
                .iter()
                .all(|d| d.status != DownloadStatus::Downloading)
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert!(snapshot.iter().all(|d| d.bytes_transferred == 0));
        h.stop().await;
    }

    #[tokio::test]
    async fn hash_fetch_reserves_the_role_then_schedules() {
        let h = start_harness("hashes", test_config()).await;
        let hash_gate = Arc::new(Semaphore::new(0));
        let data_a = vec![0xA1_u8; 1024];
        let data_b = vec![0xB2_u8; 1024];
        h.peers.register(Arc::new(
            FakePeer::new(1)
                .serve_chunk(&data_a)
                .serve_chunk(&data_b)
                .serve_hashes("a.bin", vec![HashMessage::Chunk(hash_of(&data_a))])
                .serve_hashes("b.bin", vec![HashMessage::Chunk(hash_of(&data_b))])
                .hash_gated(hash_gate.clone()),
        ));

        // Neither entry carries hashes; both need the side channel, and the
        // source peer serves only one hash request at a time.
        h.handle
            .add_download(Entry::file("/", "a.bin", 1024), peer_id(1))
            .await
            .expect("add a");
        h.handle
            .add_download(Entry::file("/", "b.bin", 1024), peer_id(1))
            .await
            .expect("add b");

        // The first file's hashes stream immediately, its chunk downloads
        // and completes; the stream itself stays open on the gate, so the
        // source peer remains occupied in the hashes role the whole time.
        wait_until(&h.handle, "first file complete", |s| {
            s[0].status == DownloadStatus::Complete
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(
            snapshot[1].status,
            DownloadStatus::Queued,
            "second hash request must wait for the role to free"
        );

        // End the first stream: the role frees and the second file proceeds.
        hash_gate.add_permits(1);
        wait_until(&h.handle, "second file complete", |s| {
            s[1].status == DownloadStatus::Complete
        })
        .await;
        hash_gate.add_permits(1);
        h.stop().await;
    }

    #[tokio::test]
    async fn additional_holders_from_the_stream_extend_scheduling() {
        let h = start_harness("holders", test_config()).await;
        let data = vec![0xC3_u8; 1024];
        let chunk = hash_of(&data);
        // The source knows the hashes but does not serve chunk bytes; it
        // announces peer 2 as a holder, which does.
        h.peers.register(Arc::new(FakePeer::new(1).serve_hashes(
            "h.bin",
            vec![
                HashMessage::Chunk(chunk),
                HashMessage::Holder {
                    chunk,
                    peer: peer_id(2),
                },
            ],
        )));
        h.peers
            .register(Arc::new(FakePeer::new(2).serve_chunk(&data)));

        h.handle
            .add_download(Entry::file("/", "h.bin", 1024), peer_id(1))
            .await
            .expect("add");

        wait_until(&h.handle, "complete via announced holder", |s| {
            s[0].status == DownloadStatus::Complete
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn duplicate_entries_are_rejected() {
        let h = start_harness("dup", test_config()).await;
        let entry = Entry::file("/", "dup.bin", 100);

        let first = h
            .handle
            .add_download(entry.clone(), peer_id(1))
            .await
            .expect("add");
        assert!(first.is_some());
        let second = h
            .handle
            .add_download(entry, peer_id(2))
            .await
            .expect("add again");
        assert!(second.is_none());

        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn same_source_peer_serves_one_chunk_at_a_time() {
        let h = start_harness("one-per-peer", test_config()).await;
        let gate = Arc::new(Semaphore::new(0));
        let data_a = vec![0xD4_u8; 2048];
        let data_b = vec![0xE5_u8; 2048];
        h.peers.register(Arc::new(
            FakePeer::new(1)
                .serve_chunk(&data_a)
                .serve_chunk(&data_b)
                .gated(gate.clone()),
        ));

        h.handle
            .add_download(entry_with_hashes("/", "a.bin", &data_a), peer_id(1))
            .await
            .expect("add a");
        h.handle
            .add_download(entry_with_hashes("/", "b.bin", &data_b), peer_id(1))
            .await
            .expect("add b");

        wait_until(&h.handle, "first transfer running", |s| {
            s[0].status == DownloadStatus::Downloading
        })
        .await;
        // Budget remains, but the only holder is occupied.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_ne!(snapshot[1].status, DownloadStatus::Downloading);

        gate.add_permits(64);
        wait_until(&h.handle, "both complete", |s| {
            s.iter().all(|d| d.status == DownloadStatus::Complete)
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn corrupt_chunk_fails_then_retries_after_cooldown() {
        let h = start_harness("retry", test_config()).await;
        let data = vec![0xF6_u8; 1024];
        let expected = hash_of(&data);
        // First serve corrupt bytes under the right hash, then heal the peer.
        let mut corrupt = FakePeer::new(1);
        corrupt.chunks.insert(expected, vec![0u8; 1024]);
        h.peers.register(Arc::new(corrupt));

        let mut entry = Entry::file("/", "r.bin", 1024);
        entry.chunk_hashes = vec![expected];
        h.handle
            .add_download(entry, peer_id(1))
            .await
            .expect("add");

        // The corrupt transfer fails verification and cools down.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let unfinished = h.handle.get_unfinished_chunks(10).await.expect("chunks");
            if unfinished
                .iter()
                .any(|c| c.status == ChunkStatus::Failed)
            {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for the chunk to fail verification"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Heal the peer; the cooled-down chunk is rescheduled and verifies.
        h.peers
            .register(Arc::new(FakePeer::new(1).serve_chunk(&data)));
        h.handle.refresh().await.expect("refresh");
        wait_until(&h.handle, "recovered", |s| {
            s[0].status == DownloadStatus::Complete
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn unknown_source_stays_queued_until_the_peer_appears() {
        let h = start_harness("no-source", test_config()).await;
        let data = vec![0x77_u8; 512];

        h.handle
            .add_download(entry_with_hashes("/", "late.bin", &data), peer_id(1))
            .await
            .expect("add");
        let snapshot = wait_until(&h.handle, "no-source state", |s| {
            s[0].status == DownloadStatus::NoSource
        })
        .await;
        assert_eq!(snapshot.len(), 1);

        // The peer comes online; the armed rescan picks the file up.
        h.peers
            .register(Arc::new(FakePeer::new(1).serve_chunk(&data)));
        wait_until(&h.handle, "late completion", |s| {
            s[0].status == DownloadStatus::Complete
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn pause_holds_scheduling_and_unpause_resumes() {
        let h = start_harness("pause", test_config()).await;
        let data = vec![0x88_u8; 512];

        let id = h
            .handle
            .add_download(entry_with_hashes("/", "p.bin", &data), peer_id(1))
            .await
            .expect("add")
            .expect("queued");
        h.handle
            .set_paused(vec![id], true)
            .await
            .expect("pause");

        h.peers
            .register(Arc::new(FakePeer::new(1).serve_chunk(&data)));
        h.handle.refresh().await.expect("refresh");
        tokio::time::sleep(Duration::from_millis(60)).await;
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(snapshot[0].status, DownloadStatus::Paused);
        assert_eq!(snapshot[0].bytes_transferred, 0);

        h.handle
            .set_paused(vec![id], false)
            .await
            .expect("unpause");
        wait_until(&h.handle, "resumed completion", |s| {
            s[0].status == DownloadStatus::Complete
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn cancel_releases_the_peer_and_removes_the_slot() {
        let h = start_harness("cancel", test_config()).await;
        let gate = Arc::new(Semaphore::new(0));
        let data_a = vec![0x99_u8; 2048];
        let data_b = vec![0xAA_u8; 512];
        h.peers.register(Arc::new(
            FakePeer::new(1)
                .serve_chunk(&data_a)
                .serve_chunk(&data_b)
                .gated(gate.clone()),
        ));

        let id_a = h
            .handle
            .add_download(entry_with_hashes("/", "a.bin", &data_a), peer_id(1))
            .await
            .expect("add a")
            .expect("queued");
        h.handle
            .add_download(entry_with_hashes("/", "b.bin", &data_b), peer_id(1))
            .await
            .expect("add b");

        wait_until(&h.handle, "first transfer running", |s| {
            s.iter()
                .any(|d| d.id == id_a && d.status == DownloadStatus::Downloading)
        })
        .await;

        // Cancelling the in-flight download frees its peer; the second file
        // (single frame, no gate needed) proceeds.
        let removed = h.handle.cancel(vec![id_a], false).await.expect("cancel");
        assert_eq!(removed, 1);
        wait_until(&h.handle, "second file complete", |s| {
            s.len() == 1 && s[0].status == DownloadStatus::Complete
        })
        .await;
        assert!(!h.root.join("incoming/a.bin.unfinished").exists());
        h.stop().await;
    }

    #[tokio::test]
    async fn cancel_complete_only_purges_finished_items() {
        let h = start_harness("purge", test_config()).await;
        let data = vec![0xBB_u8; 512];
        h.peers
            .register(Arc::new(FakePeer::new(1).serve_chunk(&data)));

        let done = h
            .handle
            .add_download(entry_with_hashes("/", "done.bin", &data), peer_id(1))
            .await
            .expect("add done")
            .expect("queued");
        let waiting = h
            .handle
            .add_download(Entry::file("/", "waiting.bin", 64), peer_id(7))
            .await
            .expect("add waiting")
            .expect("queued");

        wait_until(&h.handle, "first complete", |s| {
            s.iter()
                .any(|d| d.id == done && d.status == DownloadStatus::Complete)
        })
        .await;

        let removed = h
            .handle
            .cancel(vec![done, waiting], true)
            .await
            .expect("purge");
        assert_eq!(removed, 1);
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, waiting);
        h.stop().await;
    }

    #[tokio::test]
    async fn cancel_with_empty_ids_purges_every_completed_download() {
        let h = start_harness("purge-all", test_config()).await;
        let data_a = vec![0xC1_u8; 512];
        let data_b = vec![0xC2_u8; 512];
        h.peers.register(Arc::new(
            FakePeer::new(1).serve_chunk(&data_a).serve_chunk(&data_b),
        ));

        h.handle
            .add_download(entry_with_hashes("/", "done-a.bin", &data_a), peer_id(1))
            .await
            .expect("add a");
        h.handle
            .add_download(entry_with_hashes("/", "done-b.bin", &data_b), peer_id(1))
            .await
            .expect("add b");
        let waiting = h
            .handle
            .add_download(Entry::file("/", "waiting.bin", 64), peer_id(7))
            .await
            .expect("add waiting")
            .expect("queued");

        wait_until(&h.handle, "both files complete", |s| {
            s.iter()
                .filter(|d| d.status == DownloadStatus::Complete)
                .count()
                == 2
        })
        .await;

        // No ids targets the whole queue; the filter keeps the pending one.
        let removed = h.handle.cancel(Vec::new(), true).await.expect("purge all");
        assert_eq!(removed, 2);
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, waiting);
        h.stop().await;
    }

    #[tokio::test]
    async fn queue_round_trips_through_persistence() {
        let root = temp_dir("save-load");
        let store = PersistentData::open(&root.join("data"))
            .await
            .expect("open store");
        let file_manager = Arc::new(LocalFileManager::new(
            &root.join("incoming"),
            DEFAULT_UNFINISHED_SUFFIX,
        ));
        let peers = Arc::new(StaticPeerManager::new());

        let (handle, join) = start_manager(
            test_config(),
            file_manager.clone(),
            peers.clone(),
            store.clone(),
        );
        handle
            .add_download(Entry::file("/", "one.bin", 10), peer_id(1))
            .await
            .expect("add one");
        handle
            .add_download(Entry::dir("/", "two"), peer_id(2))
            .await
            .expect("add two");
        handle.shutdown().await.expect("shutdown");
        join.await.expect("join");

        let saved = store::load_queue(&store)
            .await
            .expect("load")
            .expect("record present");
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].entry.name, "one.bin");
        assert_eq!(saved[0].peer_id, peer_id(1));
        assert!(!saved[0].complete);
        assert_eq!(saved[1].entry.name, "two");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn crash_recovery_restores_order_and_complete_flags() {
        let h = start_harness("recover", test_config()).await;
        let data = vec![0xCC_u8; 512];
        h.peers
            .register(Arc::new(FakePeer::new(2).serve_chunk(&data)));

        store::save_queue(
            &h.store,
            vec![
                QueueEntry {
                    entry: Entry::file("/", "finished.bin", 512),
                    peer_id: peer_id(1),
                    complete: true,
                },
                QueueEntry {
                    entry: entry_with_hashes("/", "pending.bin", &data),
                    peer_id: peer_id(2),
                    complete: false,
                },
            ],
        )
        .await
        .expect("seed record");

        h.handle.file_cache_loaded().await.expect("cache loaded");
        let snapshot = wait_until(&h.handle, "queue restored", |s| s.len() == 2).await;
        assert_eq!(snapshot[0].entry.name, "finished.bin");
        assert_eq!(snapshot[0].status, DownloadStatus::Complete);
        assert_eq!(snapshot[1].entry.name, "pending.bin");

        // The incomplete one schedules and finishes.
        wait_until(&h.handle, "pending file downloads", |s| {
            s[1].status == DownloadStatus::Complete
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn version_mismatch_discards_the_record() {
        let h = start_harness("stale-version", test_config()).await;
        let stale = serde_json::json!({
            "version": store::FILE_QUEUE_VERSION + 7,
            "entries": [{
                "entry": Entry::file("/", "old.bin", 1),
                "peer_id": peer_id(1),
                "complete": false,
            }],
        });
        h.store
            .set(
                store::QUEUE_RECORD_NAME,
                &serde_json::to_vec(&stale).expect("serialize"),
            )
            .await
            .expect("seed stale");

        h.handle.file_cache_loaded().await.expect("cache loaded");
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert!(snapshot.is_empty());
        assert!(
            h.store
                .get(store::QUEUE_RECORD_NAME)
                .await
                .expect("get")
                .is_none(),
            "stale record must be deleted"
        );
        h.stop().await;
    }

    #[tokio::test]
    async fn file_cache_loaded_is_idempotent() {
        let h = start_harness("idempotent-load", test_config()).await;
        store::save_queue(
            &h.store,
            vec![QueueEntry {
                entry: Entry::file("/", "once.bin", 1),
                peer_id: peer_id(1),
                complete: true,
            }],
        )
        .await
        .expect("seed record");

        h.handle.file_cache_loaded().await.expect("first load");
        h.handle.file_cache_loaded().await.expect("second load");
        let snapshot = h.handle.get_downloads().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        h.stop().await;
    }
}
