use crate::config::Config;
use crate::download::{DownloadManagerConfig, start_manager};
use crate::file_manager::LocalFileManager;
use crate::peer::StaticPeerManager;
use crate::persistence::PersistentData;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        data_dir = %config.data_dir,
        share_dir = %config.share_dir,
        downloaders = config.number_of_downloaders,
        "starting app"
    );

    let persistent_data = PersistentData::open(Path::new(&config.data_dir))
        .await
        .context("open persistent data store")?;
    let file_manager = Arc::new(LocalFileManager::new(
        Path::new(&config.share_dir),
        &config.unfinished_suffix,
    ));
    // Peer discovery registers live sessions here as peers come and go.
    let peer_manager = Arc::new(StaticPeerManager::new());

    let manager_cfg = DownloadManagerConfig {
        number_of_downloaders: config.number_of_downloaders,
        ..DownloadManagerConfig::default()
    };
    let (downloads, manager_join) = start_manager(
        manager_cfg,
        file_manager.clone(),
        peer_manager.clone(),
        persistent_data,
    );

    // The persisted queue is replayed only once the on-disk cache has been
    // scanned, so restored downloads see a settled share tree.
    match file_manager.scan_cache().await {
        Ok(unfinished) if !unfinished.is_empty() => {
            tracing::info!(count = unfinished.len(), "unfinished files found on disk");
        }
        Ok(_) => {}
        Err(error) => tracing::warn!(error = %error, "file cache scan failed"),
    }
    downloads
        .file_cache_loaded()
        .await
        .context("load download queue")?;

    tracing::info!("press Ctrl+C to stop");
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::warn!("received Ctrl+C");
        }
    }

    tracing::info!("shutting down gracefully");
    downloads
        .shutdown()
        .await
        .context("shut down download manager")?;
    manager_join.await.context("join download manager")?;
    Ok(())
}
