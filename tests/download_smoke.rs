use async_trait::async_trait;
use lanshare::download::{
    DownloadManagerConfig, DownloadStatus, Entry, start_manager,
};
use lanshare::file_manager::LocalFileManager;
use lanshare::file_manager::local::{DEFAULT_UNFINISHED_SUFFIX, hash_of};
use lanshare::hash::Hash;
use lanshare::peer::{HashMessage, Peer, PeerError, StaticPeerManager};
use lanshare::persistence::PersistentData;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_{}_{}", std::process::id(), id))
}

/// Minimal in-memory peer: serves whole chunks by hash, no listings.
struct MemoryPeer {
    id: Hash,
    chunks: HashMap<Hash, Vec<u8>>,
}

impl MemoryPeer {
    fn serving(id: Hash, files: &[&[u8]]) -> Arc<Self> {
        let mut chunks = HashMap::new();
        for data in files {
            chunks.insert(hash_of(data), data.to_vec());
        }
        Arc::new(Self { id, chunks })
    }
}

#[async_trait]
impl Peer for MemoryPeer {
    fn id(&self) -> Hash {
        self.id
    }

    async fn get_hashes(&self, entry: &Entry) -> Result<mpsc::Receiver<HashMessage>, PeerError> {
        Err(PeerError::Transfer(format!("no hashes for {}", entry.name)))
    }

    async fn get_entries(&self, entry: &Entry) -> Result<Vec<Entry>, PeerError> {
        Err(PeerError::EntriesUnavailable(entry.name.clone()))
    }

    async fn get_chunk(
        &self,
        chunk: Hash,
        _offset: u64,
    ) -> Result<mpsc::Receiver<Result<Vec<u8>, PeerError>>, PeerError> {
        let Some(data) = self.chunks.get(&chunk).cloned() else {
            return Err(PeerError::Transfer(format!("unknown chunk {chunk}")));
        };
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(Ok(data)).await;
        });
        Ok(rx)
    }
}

#[tokio::test]
async fn download_survives_a_restart() {
    let root = unique_temp_dir("lanshare_smoke");
    let store = PersistentData::open(&root.join("data"))
        .await
        .expect("open store");
    let peer_id = Hash::from_bytes([7; 20]);
    let data = vec![0xAB_u8; 4096];

    let cfg = DownloadManagerConfig {
        number_of_downloaders: 2,
        rescan_period_if_error: Duration::from_millis(50),
        chunk_retry_cooldown: Duration::from_millis(20),
    };

    // First run: queue a file, watch it finish, shut down.
    {
        let file_manager = Arc::new(LocalFileManager::new(
            &root.join("incoming"),
            DEFAULT_UNFINISHED_SUFFIX,
        ));
        let peers = Arc::new(StaticPeerManager::new());
        peers.register(MemoryPeer::serving(peer_id, &[&data]));
        let (handle, join) = start_manager(cfg.clone(), file_manager, peers, store.clone());

        handle.file_cache_loaded().await.expect("cache loaded");

        let mut entry = Entry::file("/", "smoke.bin", data.len() as u64);
        entry.chunk_hashes = vec![hash_of(&data)];
        handle
            .add_download(entry, peer_id)
            .await
            .expect("add")
            .expect("not a duplicate");

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = handle.get_downloads().await.expect("snapshot");
            if snapshot[0].status == DownloadStatus::Complete {
                break;
            }
            assert!(Instant::now() < deadline, "download did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let on_disk = std::fs::read(root.join("incoming/smoke.bin")).expect("final bytes");
        assert_eq!(on_disk, data);

        handle.shutdown().await.expect("shutdown");
        join.await.expect("join");
    }

    // Second run: the queue record restores the entry as complete.
    {
        let file_manager = Arc::new(LocalFileManager::new(
            &root.join("incoming"),
            DEFAULT_UNFINISHED_SUFFIX,
        ));
        let peers = Arc::new(StaticPeerManager::new());
        let (handle, join) = start_manager(cfg, file_manager, peers, store);

        handle.file_cache_loaded().await.expect("cache loaded");
        let snapshot = handle.get_downloads().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].entry.name, "smoke.bin");
        assert_eq!(snapshot[0].status, DownloadStatus::Complete);

        handle.shutdown().await.expect("shutdown");
        join.await.expect("join");
    }

    let _ = std::fs::remove_dir_all(root);
}
