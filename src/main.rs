use lanshare::{app, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::from_env();
    config::init_tracing(&config);
    tracing::info!("lanshare booted");

    app::run(config).await
}
