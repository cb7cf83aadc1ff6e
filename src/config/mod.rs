use crate::file_manager::local::DEFAULT_UNFINISHED_SUFFIX;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub data_dir: String,
    pub share_dir: String,
    pub number_of_downloaders: usize,
    pub unfinished_suffix: String,
}

impl Config {
    pub fn from_env() -> Self {
        let log_level = std::env::var("LANSHARE_LOG").unwrap_or_else(|_| "info".to_string());
        let data_dir = std::env::var("LANSHARE_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let share_dir =
            std::env::var("LANSHARE_SHARE_DIR").unwrap_or_else(|_| "./incoming".to_string());
        let number_of_downloaders = std::env::var("LANSHARE_DOWNLOADERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let unfinished_suffix = std::env::var("LANSHARE_UNFINISHED_SUFFIX")
            .unwrap_or_else(|_| DEFAULT_UNFINISHED_SUFFIX.to_string());
        Self {
            log_level,
            data_dir,
            share_dir,
            number_of_downloaders,
            unfinished_suffix,
        }
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG (standard in Rust ecosystem)
    // 2) LANSHARE_LOG
    // 3) default (info)

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| config.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}
