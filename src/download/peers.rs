use crate::hash::Hash;
use std::collections::HashSet;

pub type PeerId = Hash;

/// Occupation role for a peer. The two roles are orthogonal: a peer may be
/// serving a hash request and a chunk transfer at the same time, but never
/// two of the same role from this manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    AskingForHashes,
    DownloadingChunk,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AskingForHashes => "asking_for_hashes",
            Self::DownloadingChunk => "downloading_chunk",
        }
    }
}

/// Set of peers currently occupied in one role.
///
/// `release` returns true exactly when the peer was present; that return is
/// the free-peer signal, observed synchronously by the caller with the
/// registry already updated. No spurious signals: releasing an absent peer
/// returns false.
#[derive(Debug)]
pub struct OccupiedPeers {
    role: PeerRole,
    peers: HashSet<PeerId>,
}

impl OccupiedPeers {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            peers: HashSet::new(),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Returns false if the peer was already occupied in this role.
    pub fn mark(&mut self, peer: PeerId) -> bool {
        let inserted = self.peers.insert(peer);
        if !inserted {
            tracing::debug!(peer = %peer, role = self.role.as_str(), "peer already occupied");
        }
        inserted
    }

    /// Returns true iff the peer was occupied and is now free.
    pub fn release(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn is_occupied(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
