use crate::download::entry::Entry;
use crate::hash::Hash;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type PeerId = Hash;

/// One message of the hash side channel. The remote streams the chunk hashes
/// of a file in order, interleaved with additional holders it knows about for
/// chunks already announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashMessage {
    /// Next chunk hash in file order.
    Chunk(Hash),
    /// Another peer known to hold an already-announced chunk.
    Holder { chunk: Hash, peer: PeerId },
}

#[derive(Debug)]
pub enum PeerError {
    NotConnected(PeerId),
    Transfer(String),
    EntriesUnavailable(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected(peer) => write!(f, "peer {peer} is not connected"),
            Self::Transfer(msg) => write!(f, "transfer failed: {msg}"),
            Self::EntriesUnavailable(msg) => write!(f, "entries unavailable: {msg}"),
        }
    }
}

impl std::error::Error for PeerError {}

/// A connected remote peer. Transport, deadlines and wire format live below
/// this trait; failures surface as `PeerError`.
#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    /// Stream the chunk hashes of `entry`. The channel closing without error
    /// marks the end of the stream; closing before all hashes arrived is a
    /// fetch failure the caller detects by count.
    async fn get_hashes(&self, entry: &Entry) -> Result<mpsc::Receiver<HashMessage>, PeerError>;

    /// One-shot flat listing of a remote directory, in directory order.
    async fn get_entries(&self, entry: &Entry) -> Result<Vec<Entry>, PeerError>;

    /// Stream the bytes of one chunk starting at `offset` within the chunk.
    /// Frames arrive in order; an `Err` frame aborts the transfer.
    async fn get_chunk(
        &self,
        chunk: Hash,
        offset: u64,
    ) -> Result<mpsc::Receiver<Result<Vec<u8>, PeerError>>, PeerError>;
}

pub trait PeerManager: Send + Sync {
    /// Resolve a peer id to a live session. Returns None when the peer is
    /// unknown or offline; the download stays queued and is retried later.
    fn get_peer(&self, id: &PeerId) -> Option<Arc<dyn Peer>>;
}

/// Registry-backed peer manager. Discovery is out of scope here; sessions are
/// registered by whatever owns the transport.
#[derive(Default)]
pub struct StaticPeerManager {
    peers: Mutex<HashMap<PeerId, Arc<dyn Peer>>>,
}

impl StaticPeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<dyn Peer>) {
        let id = peer.id();
        if self.lock_peers().insert(id, peer).is_some() {
            tracing::debug!(peer = %id, "replaced existing peer session");
        }
    }

    pub fn unregister(&self, id: &PeerId) {
        self.lock_peers().remove(id);
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<dyn Peer>>> {
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("peer registry lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }
}

impl PeerManager for StaticPeerManager {
    fn get_peer(&self, id: &PeerId) -> Option<Arc<dyn Peer>> {
        self.lock_peers().get(id).cloned()
    }
}
