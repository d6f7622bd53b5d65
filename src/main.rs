use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;

use flashsale::app::FlashSaleApp;
use flashsale::clock::SystemClock;
use flashsale::configure;
use flashsale::id_gen::IdGenerator;
use flashsale::logger::setup_logger;
use flashsale::persistence::ScyllaRepository;
use flashsale::store::RedisStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash-sale admission gate and order pipeline", long_about = None)]
struct Args {
    /// Config file (YAML or TOML); defaults to config/flashsale.yaml when present
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let config = configure::load_config(args.config.as_deref()).context("Failed to load config")?;
    setup_logger(&config)?;

    log::info!("=== Flash Sale Service ===");
    log::info!("Redis: {}", config.redis.url);
    log::info!("ScyllaDB: {:?} / {}", config.scylla.hosts, config.scylla.keyspace);
    log::info!("Order workers: {}", config.pipeline.workers);

    let store = RedisStore::connect(&config.redis.url, config.redis.connection_retries)
        .await
        .context("Failed to connect to Redis")?;
    store.ping().await.context("Redis ping failed")?;

    let ids = Arc::new(IdGenerator::new(config.machine_id));
    let repo = ScyllaRepository::connect(&config.scylla, ids)
        .await
        .context("Failed to connect to ScyllaDB")?;
    repo.ensure_schema().await?;

    let app = FlashSaleApp::new(Arc::new(store), Arc::new(repo), Arc::new(SystemClock), config);
    app.start().await.context("Failed to start order pipeline")?;
    log::info!("Flash sale service started, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    log::info!("Shutdown requested, draining order workers");
    app.shutdown().await;

    log::info!("Final metrics:\n{}", app.metrics().to_prometheus());
    Ok(())
}
