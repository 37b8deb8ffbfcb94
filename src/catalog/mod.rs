//! # Pool Catalog
//!
//! Discovers a source's pools from an external indexer, keeps them current
//! from factory pool-created events, and ranks them by on-chain TVL.
//!
//! ## Discovery
//!
//! Pages of `page_size` records are requested at a pinned block while the
//! previous page came back full. A page the indexer cannot serve at the pinned
//! block ("missing block", "not yet available") is retried once at the latest
//! block. Transient failures (timeouts, 5xx, 429) are retried with backoff.
//! The complete list is cached in the [`CacheStore`] for `pool_cache_ttl`.
//!
//! ## Eligibility
//!
//! [`PoolCatalog::refresh_eligibility`] reads both token balances of every pool
//! in one tolerant multicall (a failed call counts as a zero balance), values
//! them through the [`UsdPriceOracle`] and stores the sum as the pool's TVL.
//! Only pools at or above `min_tvl_usd` are eligible for pricing, and
//! eligibility older than the refresh interval is refreshed before use.

pub mod indexer;
pub mod subgraph;

pub use indexer::{BlockTag, IndexerError, PoolIndexer, PoolRecord};
pub use subgraph::{SubgraphIndexer, SubgraphSchema};

use anyhow::{anyhow, Result};
use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::types::{Address, Log, U256};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::cache_store::CacheStore;
use crate::contracts::BalanceOfCall;
use crate::metrics;
use crate::multicall::{Call, MultiCaller};
use crate::price_oracle::UsdPriceOracle;
use crate::settings::Settings;
use crate::state::{DecodedEvent, EventDecoder, LogSubscriber, TrackedContract};
use crate::types::PoolLiquidity;

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub page_size: usize,
    /// Inclusive TVL floor for pricing eligibility.
    pub min_tvl_usd: f64,
    pub tvl_refresh_interval: Duration,
    pub pool_cache_ttl: Duration,
    pub page_timeout: Duration,
    pub max_page_retries: usize,
    pub page_retry_base: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            min_tvl_usd: 50_000.0,
            tvl_refresh_interval: Duration::from_secs(300),
            pool_cache_ttl: Duration::from_secs(3600),
            page_timeout: Duration::from_secs(10),
            max_page_retries: 3,
            page_retry_base: Duration::from_millis(500),
        }
    }
}

impl CatalogConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let catalog = &settings.catalog;
        Self {
            page_size: catalog.page_size.max(1),
            min_tvl_usd: catalog.min_tvl_usd,
            tvl_refresh_interval: Duration::from_secs(catalog.tvl_refresh_interval_secs),
            pool_cache_ttl: Duration::from_secs(catalog.pool_cache_ttl_secs),
            page_timeout: Duration::from_millis(catalog.page_timeout_ms),
            max_page_retries: catalog.max_page_retries,
            page_retry_base: Duration::from_millis(catalog.page_retry_base_ms),
        }
    }
}

impl PoolRecord {
    pub fn contains(&self, token: Address) -> bool {
        self.token0 == token || self.token1 == token
    }

    /// True if the pool trades `a` against `b`, in either order.
    pub fn matches_pair(&self, a: Address, b: Address) -> bool {
        (self.token0 == a && self.token1 == b) || (self.token0 == b && self.token1 == a)
    }

    pub fn counterpart(&self, token: Address) -> Option<Address> {
        if self.token0 == token {
            Some(self.token1)
        } else if self.token1 == token {
            Some(self.token0)
        } else {
            None
        }
    }
}

/// Factory contract whose pool-created events extend the catalog.
struct FactoryEvents {
    contract: TrackedContract,
    decoder: EventDecoder<()>,
}

/// Pool list of one source, with TVL-based eligibility.
pub struct PoolCatalog {
    source_key: String,
    indexer: Arc<dyn PoolIndexer>,
    multicaller: Arc<dyn MultiCaller>,
    oracle: Arc<dyn UsdPriceOracle>,
    cache: Arc<dyn CacheStore>,
    config: CatalogConfig,
    factory: Option<FactoryEvents>,
    pools: ArcSwap<Vec<PoolRecord>>,
    tvl_refreshed_at: ArcSwapOption<Instant>,
    refresh_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolCatalog {
    pub fn new(
        source_key: impl Into<String>,
        indexer: Arc<dyn PoolIndexer>,
        multicaller: Arc<dyn MultiCaller>,
        oracle: Arc<dyn UsdPriceOracle>,
        cache: Arc<dyn CacheStore>,
        config: CatalogConfig,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            indexer,
            multicaller,
            oracle,
            cache,
            config,
            factory: None,
            pools: ArcSwap::from_pointee(Vec::new()),
            tvl_refreshed_at: ArcSwapOption::empty(),
            refresh_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
        }
    }

    /// Follows `factory` for new pools. `event_signatures` are human-readable
    /// events whose parameters include the pool (`pool` or `pair`) and
    /// `token0`/`token1`.
    pub fn with_factory(mut self, factory: Address, event_signatures: &[&str]) -> Result<Self> {
        let decoder = EventDecoder::from_signatures(event_signatures)?;
        let contract = TrackedContract::new(factory, decoder.topics(), self.source_key.clone());
        self.factory = Some(FactoryEvents { contract, decoder });
        Ok(self)
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Cache store key holding the discovered pool list.
    pub fn cache_key(&self) -> String {
        format!("catalog:{}:pools", self.source_key)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Discovers the pool list at `block_number` and refreshes eligibility.
    /// A failed eligibility refresh is logged and retried on next use.
    pub async fn initialize(&self, block_number: u64) -> Result<usize> {
        let discovered = self.discover_all(block_number).await?;
        let mut seen = HashSet::new();
        let pools: Vec<PoolRecord> = discovered
            .into_iter()
            .filter(|pool| seen.insert(pool.address))
            .collect();
        let count = pools.len();
        self.pools.store(Arc::new(pools));
        self.tvl_refreshed_at.store(None);
        self.initialized.store(true, Ordering::Release);
        metrics::set_catalog_pools(&self.source_key, count);
        info!("[{}] Catalog initialized with {} pools at block {}", self.source_key, count, block_number);

        if let Err(e) = self.refresh_eligibility().await {
            warn!("[{}] Initial TVL refresh failed: {}", self.source_key, e);
        }
        Ok(count)
    }

    /// Every pool the indexer knows at `block_number`, served from the cache
    /// store when a previous discovery is still fresh.
    pub async fn discover_all(&self, block_number: u64) -> Result<Vec<PoolRecord>> {
        let key = self.cache_key();
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<PoolRecord>>(&raw) {
                Ok(pools) => {
                    debug!("[{}] Pool list served from cache ({} pools)", self.source_key, pools.len());
                    metrics::increment_cache_hit("catalog");
                    return Ok(pools);
                }
                Err(e) => warn!("[{}] Discarding undecodable cached pool list: {}", self.source_key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("[{}] Pool cache read failed: {}", self.source_key, e),
        }
        metrics::increment_cache_miss("catalog");

        let page_size = self.config.page_size;
        let mut pools = Vec::new();
        let mut skip = 0;
        loop {
            let page = self.fetch_page(skip, block_number).await.map_err(|e| {
                anyhow!(
                    "[{}] Pool discovery failed at offset {}: {}",
                    self.source_key,
                    skip,
                    e
                )
            })?;
            let returned = page.len();
            pools.extend(page);
            if returned != page_size {
                break;
            }
            skip += page_size;
        }
        info!(
            "[{}] Discovered {} pools from indexer at block {}",
            self.source_key,
            pools.len(),
            block_number
        );

        self.store_pool_list(&pools).await;
        Ok(pools)
    }

    /// Writes the current pool list, factory additions included, back to the
    /// cache store.
    pub async fn persist_pools(&self) {
        let pools = self.pools.load_full();
        self.store_pool_list(&pools).await;
    }

    async fn store_pool_list(&self, pools: &[PoolRecord]) {
        match serde_json::to_string(pools) {
            Ok(raw) => {
                if let Err(e) = self
                    .cache
                    .set_with_ttl(&self.cache_key(), &raw, self.config.pool_cache_ttl)
                    .await
                {
                    warn!("[{}] Failed to cache pool list: {}", self.source_key, e);
                }
            }
            Err(e) => warn!("[{}] Failed to serialize pool list: {}", self.source_key, e),
        }
    }

    async fn fetch_page(&self, skip: usize, block_number: u64) -> Result<Vec<PoolRecord>, IndexerError> {
        let factor = (self.config.page_retry_base.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .take(self.config.max_page_retries);
        RetryIf::spawn(
            strategy,
            || self.query_page_with_fallback(skip, block_number),
            |e: &IndexerError| {
                let retry = e.is_transient();
                if retry {
                    warn!("[{}] Indexer page at offset {} failed, retrying: {}", self.source_key, skip, e);
                }
                retry
            },
        )
        .await
    }

    /// One page at the pinned block, falling back once to the latest block
    /// when the indexer has not reached it.
    async fn query_page_with_fallback(&self, skip: usize, block_number: u64) -> Result<Vec<PoolRecord>, IndexerError> {
        match self.query_page(skip, BlockTag::Number(block_number)).await {
            Err(IndexerError::BlockUnavailable(reason)) => {
                warn!(
                    "[{}] Indexer cannot serve block {} ({}), falling back to the latest block",
                    self.source_key, block_number, reason
                );
                self.query_page(skip, BlockTag::Latest).await
            }
            other => other,
        }
    }

    async fn query_page(&self, skip: usize, block: BlockTag) -> Result<Vec<PoolRecord>, IndexerError> {
        metrics::increment_indexer_page(&self.source_key, block.label());
        match timeout(
            self.config.page_timeout,
            self.indexer.query_pools(skip, self.config.page_size, block),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IndexerError::Timeout),
        }
    }

    /// Recomputes every pool's TVL from on-chain balances.
    pub async fn refresh_eligibility(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<()> {
        let started = Instant::now();
        let pools = self.pools.load_full();
        if pools.is_empty() {
            self.tvl_refreshed_at.store(Some(Arc::new(Instant::now())));
            return Ok(());
        }

        let calls: Vec<Call> = pools
            .iter()
            .flat_map(|pool| {
                [pool.token0, pool.token1].map(|token| Call {
                    target: token,
                    call_data: BalanceOfCall { account: pool.address }.encode().into(),
                })
            })
            .collect();
        let results = self.multicaller.try_aggregate(calls, None).await?;
        if results.len() != pools.len() * 2 {
            return Err(anyhow!(
                "[{}] Balance multicall returned {} results for {} calls",
                self.source_key,
                results.len(),
                pools.len() * 2
            ));
        }

        let amounts: Vec<(Address, U256)> = pools
            .iter()
            .zip(results.chunks(2))
            .flat_map(|(pool, balances)| {
                [
                    (pool.token0, balances[0].as_uint().unwrap_or_default()),
                    (pool.token1, balances[1].as_uint().unwrap_or_default()),
                ]
            })
            .collect();
        let usd = self.oracle.usd_values(&amounts).await?;

        let tvl: HashMap<Address, f64> = pools
            .iter()
            .enumerate()
            .map(|(i, pool)| {
                let value = usd.get(2 * i).copied().unwrap_or(0.0) + usd.get(2 * i + 1).copied().unwrap_or(0.0);
                (pool.address, value)
            })
            .collect();

        self.pools.rcu(|current| {
            current
                .iter()
                .cloned()
                .map(|mut pool| {
                    if let Some(value) = tvl.get(&pool.address) {
                        pool.tvl_usd = *value;
                    }
                    pool
                })
                .collect::<Vec<_>>()
        });
        self.tvl_refreshed_at.store(Some(Arc::new(Instant::now())));

        let eligible = tvl.values().filter(|v| **v >= self.config.min_tvl_usd).count();
        metrics::record_tvl_refresh(&self.source_key, started.elapsed());
        info!(
            "[{}] TVL refreshed for {} pools, {} eligible (>= ${})",
            self.source_key,
            tvl.len(),
            eligible,
            self.config.min_tvl_usd
        );
        Ok(())
    }

    pub fn is_eligibility_fresh(&self) -> bool {
        self.tvl_refreshed_at
            .load_full()
            .map_or(false, |at| at.elapsed() < self.config.tvl_refresh_interval)
    }

    /// Waits for a TVL computation younger than the refresh interval. The
    /// refresh runs on its own task: a caller's deadline never cancels it, and
    /// callers queued behind it find eligibility fresh.
    async fn ensure_fresh_eligibility(self: &Arc<Self>) -> bool {
        if self.is_eligibility_fresh() {
            return true;
        }
        let catalog = self.clone();
        let refresh = tokio::spawn(async move {
            let _guard = catalog.refresh_lock.lock().await;
            if catalog.is_eligibility_fresh() {
                return Ok(());
            }
            catalog.refresh_locked().await
        });
        match refresh.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("[{}] TVL refresh failed, no pools eligible: {}", self.source_key, e);
                false
            }
            Err(e) => {
                error!("[{}] TVL refresh task aborted, no pools eligible: {}", self.source_key, e);
                false
            }
        }
    }

    /// Eligible pools trading `a` against `b`, highest TVL first.
    pub async fn pools_for_pair(self: &Arc<Self>, a: Address, b: Address) -> Vec<PoolRecord> {
        if !self.ensure_fresh_eligibility().await {
            return Vec::new();
        }
        let mut pools: Vec<PoolRecord> = self
            .pools
            .load()
            .iter()
            .filter(|pool| pool.matches_pair(a, b) && pool.tvl_usd >= self.config.min_tvl_usd)
            .cloned()
            .collect();
        sort_by_tvl_desc(&mut pools);
        pools
    }

    /// Eligible pools containing `token`, highest TVL first.
    pub async fn top_pools_for_token(self: &Arc<Self>, token: Address, limit: usize) -> Vec<PoolLiquidity> {
        if !self.ensure_fresh_eligibility().await {
            return Vec::new();
        }
        let mut pools: Vec<PoolRecord> = self
            .pools
            .load()
            .iter()
            .filter(|pool| pool.contains(token) && pool.tvl_usd >= self.config.min_tvl_usd)
            .cloned()
            .collect();
        sort_by_tvl_desc(&mut pools);
        pools
            .into_iter()
            .take(limit)
            .map(|pool| PoolLiquidity {
                exchange: self.source_key.clone(),
                address: pool.address,
                connector_tokens: pool.counterpart(token).into_iter().collect(),
                liquidity_usd: pool.tvl_usd,
            })
            .collect()
    }

    pub fn pools(&self) -> Arc<Vec<PoolRecord>> {
        self.pools.load_full()
    }

    pub fn pool(&self, address: Address) -> Option<PoolRecord> {
        self.pools.load().iter().find(|pool| pool.address == address).cloned()
    }

    pub fn len(&self) -> usize {
        self.pools.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a pool unless already known. New pools carry zero TVL until the
    /// next eligibility refresh.
    pub fn add_pool(&self, pool: PoolRecord) -> bool {
        let mut added = false;
        self.pools.rcu(|current| {
            added = !current.iter().any(|known| known.address == pool.address);
            let mut next = Vec::clone(current);
            if added {
                next.push(pool.clone());
            }
            next
        });
        if added {
            metrics::set_catalog_pools(&self.source_key, self.len());
            info!("[{}] New pool {:?} ({:?}/{:?})", self.source_key, pool.address, pool.token0, pool.token1);
        }
        added
    }

    /// Applies a factory log. Returns true if it announced a new pool.
    pub fn handle_factory_log(&self, log: &Log) -> Result<bool> {
        let Some(factory) = &self.factory else {
            return Ok(false);
        };
        if !factory.contract.tracks(log) {
            return Ok(false);
        }
        let Some(event) = factory.decoder.decode(log)? else {
            return Ok(false);
        };
        let pool = pool_from_event(&event)?;
        Ok(self.add_pool(pool))
    }

    /// Log subscriber for the factory, if one is configured.
    pub fn factory_subscriber(self: &Arc<Self>) -> Option<Arc<dyn LogSubscriber>> {
        let factory = self.factory.as_ref()?;
        Some(Arc::new(FactorySubscriber {
            catalog: self.clone(),
            contract: factory.contract.clone(),
        }))
    }

    /// Spawns the periodic TVL refresh. Replaces any running refresh task.
    pub fn start_refresh_task(self: &Arc<Self>) {
        let catalog = Arc::downgrade(self);
        let interval = self.config.tvl_refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(catalog) = catalog.upgrade() else {
                    return;
                };
                if let Err(e) = catalog.refresh_eligibility().await {
                    warn!("[{}] Periodic TVL refresh failed: {}", catalog.source_key, e);
                }
            }
        });
        if let Ok(mut slot) = self.refresh_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stops background work.
    pub fn release_resources(&self) {
        if let Ok(mut slot) = self.refresh_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
                info!("[{}] TVL refresh task stopped", self.source_key);
            }
        }
    }
}

impl Drop for PoolCatalog {
    fn drop(&mut self) {
        self.release_resources();
    }
}

fn sort_by_tvl_desc(pools: &mut [PoolRecord]) {
    pools.sort_by(|a, b| b.tvl_usd.partial_cmp(&a.tvl_usd).unwrap_or(std::cmp::Ordering::Equal));
}

fn pool_from_event(event: &DecodedEvent) -> Result<PoolRecord> {
    let address = event
        .address("pool")
        .or_else(|_| event.address("pair"))?;
    Ok(PoolRecord {
        address,
        token0: event.address("token0")?,
        token1: event.address("token1")?,
        deployer: event.address("deployer").ok(),
        fee: event.uint("fee").ok().map(|fee| fee.low_u32()),
        tvl_usd: 0.0,
    })
}

struct FactorySubscriber {
    catalog: Arc<PoolCatalog>,
    contract: TrackedContract,
}

#[async_trait]
impl LogSubscriber for FactorySubscriber {
    fn contract(&self) -> &TrackedContract {
        &self.contract
    }

    async fn is_initialized(&self) -> bool {
        self.catalog.is_initialized()
    }

    async fn initialize(&self, block_number: u64) -> Result<()> {
        self.catalog.initialize(block_number).await.map(|_| ())
    }

    async fn on_block_logs(&self, _block_number: u64, logs: &[Log]) -> Result<()> {
        let mut added = 0;
        for log in logs {
            match self.catalog.handle_factory_log(log) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!("[{}] Skipping undecodable factory log: {}", self.catalog.source_key, e),
            }
        }
        if added > 0 {
            self.catalog.persist_pools().await;
        }
        Ok(())
    }

    async fn on_reorg(&self, _common_ancestor: u64) -> usize {
        // Pools announced on a dropped branch stay listed; they hold no
        // balance and never reach the TVL floor.
        0
    }
}
