use crate::download::entry::Entry;
use crate::download::errors::QueueStoreError;
use crate::hash::Hash;
use crate::persistence::PersistentData;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, QueueStoreError>;

pub const FILE_QUEUE_VERSION: u32 = 1;
pub const QUEUE_RECORD_NAME: &str = "queue";

/// One persisted queue slot. Only the intent survives a restart: what to
/// download, from whom, and whether it already finished. Chunk progress is
/// recomputed from the hashes after reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry: Entry,
    pub peer_id: Hash,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct QueueRecord {
    version: u32,
    entries: Vec<QueueEntry>,
}

pub async fn save_queue(store: &PersistentData, entries: Vec<QueueEntry>) -> Result<()> {
    let record = QueueRecord {
        version: FILE_QUEUE_VERSION,
        entries,
    };
    let bytes =
        serde_json::to_vec_pretty(&record).map_err(|source| QueueStoreError::Serialize { source })?;
    store.set(QUEUE_RECORD_NAME, &bytes).await?;
    Ok(())
}

/// `Ok(None)` when no record exists. A version mismatch is a typed error so
/// the caller can delete the stale record and start empty.
pub async fn load_queue(store: &PersistentData) -> Result<Option<Vec<QueueEntry>>> {
    let Some(bytes) = store.get(QUEUE_RECORD_NAME).await? else {
        return Ok(None);
    };
    let record: QueueRecord =
        serde_json::from_slice(&bytes).map_err(|source| QueueStoreError::Parse { source })?;
    if record.version != FILE_QUEUE_VERSION {
        return Err(QueueStoreError::VersionMismatch {
            found: record.version,
            expected: FILE_QUEUE_VERSION,
        });
    }
    Ok(Some(record.entries))
}

pub async fn remove_queue(store: &PersistentData) -> Result<()> {
    store.remove(QUEUE_RECORD_NAME).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("lanshare-queue-store-{tag}-{nanos}"));
        p
    }

    fn sample_entries() -> Vec<QueueEntry> {
        vec![
            QueueEntry {
                entry: Entry::file("/", "a.bin", 100),
                peer_id: Hash::from_bytes([1; 20]),
                complete: true,
            },
            QueueEntry {
                entry: Entry::dir("/", "photos"),
                peer_id: Hash::from_bytes([2; 20]),
                complete: false,
            },
        ]
    }

    #[tokio::test]
    async fn save_load_roundtrip_preserves_order_and_flags() {
        let root = temp_dir("roundtrip");
        let store = PersistentData::open(&root).await.expect("open");
        let entries = sample_entries();

        save_queue(&store, entries.clone()).await.expect("save");
        let loaded = load_queue(&store).await.expect("load").expect("present");
        assert_eq!(loaded, entries);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let root = temp_dir("missing");
        let store = PersistentData::open(&root).await.expect("open");
        assert!(load_queue(&store).await.expect("load").is_none());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn version_mismatch_is_a_typed_error() {
        let root = temp_dir("version");
        let store = PersistentData::open(&root).await.expect("open");
        let stale = serde_json::json!({
            "version": FILE_QUEUE_VERSION + 1,
            "entries": [],
        });
        store
            .set(
                QUEUE_RECORD_NAME,
                &serde_json::to_vec(&stale).expect("serialize"),
            )
            .await
            .expect("seed stale record");

        let err = load_queue(&store).await.expect_err("must reject version");
        assert!(matches!(
            err,
            QueueStoreError::VersionMismatch {
                found,
                expected: FILE_QUEUE_VERSION,
            } if found == FILE_QUEUE_VERSION + 1
        ));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_parse_error() {
        let root = temp_dir("corrupt");
        let store = PersistentData::open(&root).await.expect("open");
        store
            .set(QUEUE_RECORD_NAME, b"{not-json")
            .await
            .expect("seed corrupt record");

        let err = load_queue(&store).await.expect_err("must reject corrupt");
        assert!(matches!(err, QueueStoreError::Parse { .. }));
        let _ = std::fs::remove_dir_all(root);
    }
}
