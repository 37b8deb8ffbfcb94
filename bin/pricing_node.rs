//! # Pricing Node
//!
//! Long-running process that wires the configured sources into a
//! [`PricingAggregator`], initializes them at the current head and keeps
//! their pool state current by polling new blocks.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --bin pricing_node -- --config Config.toml
//! ```
//!
//! Press Ctrl+C to release every source and exit.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use url::Url;

use dex_pricing_sdk::{
    aggregator::{AggregatorConfig, PricingAggregator},
    cache_store::{CacheStore, InMemoryCacheStore},
    catalog::{CatalogConfig, PoolCatalog, SubgraphIndexer, SubgraphSchema},
    chain::{ChainClient, EthersChainClient},
    metrics,
    multicall::Multicall,
    price_oracle::StaticPriceOracle,
    registry::AdapterRegistry,
    settings::Settings,
    sources::{ReservePoolConfig, ReservePoolSource},
    state::{BlockLogDispatcher, SyncConfig},
};

#[derive(Parser, Debug)]
#[command(name = "pricing_node", about = "Event-sourced DEX pricing node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "Config.toml")]
    config: PathBuf,

    /// Prometheus exporter listen address.
    #[cfg(feature = "observability")]
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: std::net::SocketAddr,
}

#[cfg(feature = "redis")]
async fn build_cache(settings: &Settings) -> Result<Arc<dyn CacheStore>> {
    match &settings.cache.redis_url {
        Some(url) => {
            let store = dex_pricing_sdk::cache_store::RedisCacheStore::connect(url, "pricing").await?;
            info!("Using Redis cache store at {}", url);
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryCacheStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn build_cache(settings: &Settings) -> Result<Arc<dyn CacheStore>> {
    if settings.cache.redis_url.is_some() {
        warn!("cache.redis_url is set but the redis feature is disabled, using the in-memory store");
    }
    Ok(Arc::new(InMemoryCacheStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    #[cfg(feature = "observability")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(args.metrics_addr)
            .install()
            .context("Failed to install the Prometheus exporter")?;
        info!("Metrics exported on {}", args.metrics_addr);
    }
    metrics::describe_metrics();

    // 1. Settings
    let settings = Settings::from_path(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!("Settings loaded from {} ({} sources)", args.config.display(), settings.sources.len());

    // 2. Shared infrastructure
    let chain: Arc<dyn ChainClient> = Arc::new(EthersChainClient::from_http_url(&settings.rpc.http_url)?);
    let cache = build_cache(&settings).await?;
    let multicaller = Arc::new(Multicall::new(
        chain.clone(),
        settings.contracts.multicall,
        settings.contracts.multicall_batch_size,
    ));
    let oracle = Arc::new(StaticPriceOracle::from_quotes(settings.oracle_quotes()?));
    let dispatcher = Arc::new(BlockLogDispatcher::new(chain.clone(), settings.state.max_history_blocks));

    // 3. Sources
    let catalog_config = CatalogConfig::from_settings(&settings);
    let sync_config = SyncConfig::from_settings(&settings);
    let mut registry = AdapterRegistry::new();
    for source in &settings.sources {
        let url = Url::parse(&source.subgraph_url)
            .with_context(|| format!("[{}] Invalid subgraph url", source.key))?;
        let schema = SubgraphSchema {
            entity: source.subgraph_entity.clone(),
            tvl_field: source.subgraph_tvl_field.clone(),
            with_deployer: source.subgraph_deployer_field,
        };
        let indexer = Arc::new(SubgraphIndexer::new(url, schema, catalog_config.page_timeout)?);
        let mut catalog = PoolCatalog::new(
            source.key.clone(),
            indexer,
            multicaller.clone(),
            oracle.clone(),
            cache.clone(),
            catalog_config.clone(),
        );
        if let Some(factory) = source.factory {
            catalog = catalog.with_factory(factory, &[source.pool_created_event.as_str()])?;
        }

        let mut config = ReservePoolConfig::new(source.key.clone(), source.fee_bps, source.gas_cost);
        config.calldata_gas_cost = source.calldata_gas_cost;
        config.max_pools_per_pair = source.max_pools_per_pair;
        let adapter = ReservePoolSource::new(config, Arc::new(catalog), chain.clone(), sync_config.clone())
            .with_dispatcher(dispatcher.clone())
            .with_cache(cache.clone());
        registry.register(Arc::new(adapter))?;
    }
    let keys = registry.keys();

    // 4. Aggregator
    let aggregator = PricingAggregator::new(Arc::new(registry), AggregatorConfig::from_settings(&settings))
        .with_cache(cache.clone());
    let head = chain.block_number().await.context("Failed to read the chain head")?;
    aggregator.initialize(head, &keys).await;
    let failed = dispatcher.initialize_all(head).await;
    if failed > 0 {
        warn!("{} tracked contracts failed to initialize at block {}", failed, head);
    }

    // 5. Block poller
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(
        dispatcher
            .clone()
            .run_poller(Duration::from_millis(settings.rpc.poll_interval_ms), shutdown_rx),
    );
    info!(
        "Pricing node running at block {}: {} sources, polling every {}ms",
        head,
        keys.len(),
        settings.rpc.poll_interval_ms
    );

    signal::ctrl_c().await?;
    info!("Shutdown signal received, releasing sources");
    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        warn!("Block poller ended abnormally: {}", e);
    }
    aggregator.release_resources(&keys).await;
    info!("Shutdown complete");
    Ok(())
}
