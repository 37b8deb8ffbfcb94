//! # Pricing Aggregator
//!
//! Fans pool-identification and pricing queries out to every registered
//! [`SourceAdapter`] concurrently and merges the validated answers.
//!
//! ## Query Pipeline
//!
//! 1. Skip sources excluded by the constant-price filter, sources that cannot
//!    price fee-on-transfer tokens when the query needs it, and sources that
//!    are not initialized yet
//! 2. Identify candidate pools per source, each call under its own timeout
//! 3. Narrow the identifiers to the caller's allow-list, if any
//! 4. Price all amounts per source, each call under its own timeout
//! 5. Validate result shapes, dropping malformed results
//! 6. Drop results whose every price is zero
//! 7. Optionally add the L2 calldata cost to each result's gas estimate
//!
//! A failing, slow or malformed source only loses its own contribution. A
//! timed-out call is dropped at its deadline, which cancels the adapter's
//! future at its current `.await` point.
//!
//! ## Initialization
//!
//! Each source moves `Uninitialized -> Initializing -> Ready`. A failed first
//! attempt leaves the source in `Initializing` and schedules retries on a
//! fixed delay until one succeeds. Only `Ready` sources are queried.

use dashmap::DashMap;
use ethers::types::{Address, U256};
use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::cache_store::CacheStore;
use crate::metrics;
use crate::registry::AdapterRegistry;
use crate::settings::Settings;
use crate::source_adapter::SourceAdapter;
use crate::types::{GasCost, PoolLiquidity, PoolPrices, QuoteRequest, SwapSide, Token};

/// Pool identifiers per source key. `None` marks a source excluded by the
/// constant-price filter; `Some(vec![])` a source with nothing to offer.
pub type PoolIdentifierMap = IndexMap<String, Option<Vec<String>>>;

/// Converts an L1 calldata gas amount into L2 gas.
pub type L2GasCostFn = dyn Fn(u64) -> f64 + Send + Sync;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub pool_identifier_timeout: Duration,
    pub pool_prices_timeout: Duration,
    pub setup_retry_delay: Duration,
    pub clear_cached_state_on_init: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            pool_identifier_timeout: Duration::from_millis(1000),
            pool_prices_timeout: Duration::from_millis(3000),
            setup_retry_delay: Duration::from_secs(20),
            clear_cached_state_on_init: true,
        }
    }
}

impl AggregatorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let aggregator = &settings.aggregator;
        Self {
            pool_identifier_timeout: Duration::from_millis(aggregator.pool_identifier_timeout_ms),
            pool_prices_timeout: Duration::from_millis(aggregator.pool_prices_timeout_ms),
            setup_retry_delay: Duration::from_millis(aggregator.setup_retry_delay_ms),
            clear_cached_state_on_init: aggregator.clear_cached_state_on_init,
        }
    }
}

/// Per-query switches.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Skip sources that quote a constant rate for any size.
    pub filter_constant_price_pools: bool,
    /// When set, gas estimates are increased by the L2 cost of their calldata.
    pub l2_gas_cost: Option<Arc<L2GasCostFn>>,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("filter_constant_price_pools", &self.filter_constant_price_pools)
            .field("l2_gas_cost", &self.l2_gas_cost.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Uninitialized,
    Initializing { attempts: u32 },
    Ready,
}

/// Why a source result was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResultRejection {
    #[error("returned {got} prices for {expected} amounts")]
    PriceCount { expected: usize, got: usize },
    #[error("returned {got} gas costs for {expected} amounts")]
    GasCostCount { expected: usize, got: usize },
    #[error("amount at index {index} is 0 but gas cost is {gas}")]
    GasForZeroAmount { index: usize, gas: u64 },
    #[error("amount at index {index} is 0 but price is non-zero")]
    PriceForZeroAmount { index: usize },
}

impl ResultRejection {
    fn label(&self) -> &'static str {
        match self {
            ResultRejection::PriceCount { .. } => "price_count",
            ResultRejection::GasCostCount { .. } => "gas_cost_count",
            ResultRejection::GasForZeroAmount { .. } => "gas_for_zero_amount",
            ResultRejection::PriceForZeroAmount { .. } => "price_for_zero_amount",
        }
    }
}

/// Checks that `prices` has one price (and, if per-amount, one gas cost) per
/// amount, and that zero amounts carry zero price and zero gas.
pub fn validate_pool_prices(prices: &PoolPrices, amounts: &[U256]) -> Result<(), ResultRejection> {
    if prices.prices.len() != amounts.len() {
        return Err(ResultRejection::PriceCount {
            expected: amounts.len(),
            got: prices.prices.len(),
        });
    }
    if let GasCost::PerAmount(gas) = &prices.gas_cost {
        if gas.len() != amounts.len() {
            return Err(ResultRejection::GasCostCount {
                expected: amounts.len(),
                got: gas.len(),
            });
        }
        if let Some((index, gas)) = amounts
            .iter()
            .zip(gas)
            .enumerate()
            .find(|(_, (amount, gas))| amount.is_zero() && **gas != 0)
            .map(|(index, (_, gas))| (index, *gas))
        {
            return Err(ResultRejection::GasForZeroAmount { index, gas });
        }
    }
    if let Some(index) = amounts
        .iter()
        .zip(&prices.prices)
        .position(|(amount, price)| amount.is_zero() && !price.is_zero())
    {
        return Err(ResultRejection::PriceForZeroAmount { index });
    }
    Ok(())
}

/// Adds the L2 cost of `calldata` to the gas estimate of `prices`.
///
/// Scalar gas needs scalar calldata and must be non-zero; per-amount gas
/// needs per-amount calldata of the same length, and zero entries stay zero.
/// The pre-adjustment estimate is kept in `gas_cost_l2`.
pub fn apply_l2_gas_cost(
    mut prices: PoolPrices,
    calldata: GasCost,
    l1_to_l2: &L2GasCostFn,
) -> anyhow::Result<PoolPrices> {
    let adjusted = match (&prices.gas_cost, &calldata) {
        (GasCost::Scalar(gas), GasCost::Scalar(extra)) if *gas != 0 => {
            GasCost::Scalar(gas.saturating_add(l1_to_l2(*extra).ceil() as u64))
        }
        (GasCost::PerAmount(gas), GasCost::PerAmount(extra)) => {
            if gas.len() != extra.len() {
                anyhow::bail!(
                    "{}: calldata gas cost has {} entries for {} gas costs",
                    prices.exchange,
                    extra.len(),
                    gas.len()
                );
            }
            GasCost::PerAmount(
                gas.iter()
                    .zip(extra)
                    .map(|(gas, extra)| {
                        if *gas == 0 {
                            0
                        } else {
                            gas.saturating_add(l1_to_l2(*extra).ceil() as u64)
                        }
                    })
                    .collect(),
            )
        }
        _ => anyhow::bail!(
            "{}: calldata gas cost {:?} does not match gas cost {:?}",
            prices.exchange,
            calldata,
            prices.gas_cost
        ),
    };
    prices.gas_cost_l2 = Some(std::mem::replace(&mut prices.gas_cost, adjusted));
    prices.calldata_gas_cost = Some(calldata);
    Ok(prices)
}

/// Runs `fut` under `limit`, mapping a timeout or an error to `None`.
async fn bounded<T, F>(key: &str, phase: &'static str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    match timeout(limit, fut).await {
        Ok(Ok(value)) => {
            metrics::record_source_query(key, phase, "ok", started.elapsed());
            Some(value)
        }
        Ok(Err(e)) => {
            metrics::record_source_query(key, phase, "error", started.elapsed());
            error!("[{}] {} failed: {:#}", key, phase, e);
            None
        }
        Err(_) => {
            metrics::record_source_query(key, phase, "timeout", started.elapsed());
            warn!("[{}] {} timed out after {}ms", key, phase, limit.as_millis());
            None
        }
    }
}

/// Initializes one adapter, clearing its shared cached state first when configured.
async fn run_initialization(
    adapter: &dyn SourceAdapter,
    cache: Option<&dyn CacheStore>,
    clear_cached_state: bool,
    block_number: u64,
) -> anyhow::Result<()> {
    if clear_cached_state {
        if let (Some(cache), Some(key)) = (cache, adapter.cache_state_key()) {
            if let Err(e) = cache.delete(&key).await {
                warn!("[{}] Failed to clear cached state {}: {}", adapter.key(), key, e);
            }
        }
    }
    adapter.initialize_pricing(block_number).await
}

pub struct PricingAggregator {
    registry: Arc<AdapterRegistry>,
    cache: Option<Arc<dyn CacheStore>>,
    config: AggregatorConfig,
    statuses: Arc<DashMap<String, AdapterStatus>>,
    retry_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PricingAggregator {
    pub fn new(registry: Arc<AdapterRegistry>, config: AggregatorConfig) -> Self {
        let statuses = DashMap::new();
        for key in registry.keys() {
            statuses.insert(key, AdapterStatus::Uninitialized);
        }
        Self {
            registry,
            cache: None,
            config,
            statuses: Arc::new(statuses),
            retry_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn status(&self, key: &str) -> AdapterStatus {
        self.statuses
            .get(key)
            .map(|status| *status)
            .unwrap_or(AdapterStatus::Uninitialized)
    }

    pub fn is_ready(&self, key: &str) -> bool {
        self.status(key) == AdapterStatus::Ready
    }

    fn ready_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|entry| *entry.value() == AdapterStatus::Ready)
            .count()
    }

    /// Initializes the sources in `keys` concurrently. Idempotent: sources
    /// already ready or initializing are left alone. Sources whose first
    /// attempt fails keep retrying in the background every
    /// `setup_retry_delay`.
    pub async fn initialize(&self, block_number: u64, keys: &[String]) {
        join_all(keys.iter().map(|key| self.initialize_source(key, block_number))).await;
        metrics::set_sources_ready(self.ready_count());
        info!(
            "Pricing initialized at block {}: {}/{} sources ready",
            block_number,
            keys.iter().filter(|key| self.is_ready(key)).count(),
            keys.len()
        );
    }

    async fn initialize_source(&self, key: &str, block_number: u64) {
        let Some(adapter) = self.registry.get(key) else {
            warn!("Cannot initialize unknown source {}", key);
            return;
        };
        {
            let mut status = self
                .statuses
                .entry(key.to_string())
                .or_insert(AdapterStatus::Uninitialized);
            if *status != AdapterStatus::Uninitialized {
                debug!("[{}] Initialization skipped, status {:?}", key, *status);
                return;
            }
            *status = AdapterStatus::Initializing { attempts: 1 };
        }

        let clear = self.config.clear_cached_state_on_init;
        match run_initialization(adapter.as_ref(), self.cache.as_deref(), clear, block_number).await {
            Ok(()) => {
                metrics::increment_init_attempt(key, "ok");
                self.statuses.insert(key.to_string(), AdapterStatus::Ready);
                info!("[{}] Ready for pricing at block {}", key, block_number);
            }
            Err(e) => {
                metrics::increment_init_attempt(key, "error");
                error!(
                    "[{}] Initialization failed, retrying in {}ms: {:#}",
                    key,
                    self.config.setup_retry_delay.as_millis(),
                    e
                );
                self.spawn_init_retry(adapter, block_number);
            }
        }
    }

    fn spawn_init_retry(&self, adapter: Arc<dyn SourceAdapter>, block_number: u64) {
        let statuses = self.statuses.clone();
        let cache = self.cache.clone();
        let delay = self.config.setup_retry_delay;
        let clear = self.config.clear_cached_state_on_init;
        let handle = tokio::spawn(async move {
            let key = adapter.key().to_string();
            let mut attempts = 1u32;
            loop {
                sleep(delay).await;
                attempts += 1;
                statuses.insert(key.clone(), AdapterStatus::Initializing { attempts });
                match run_initialization(adapter.as_ref(), cache.as_deref(), clear, block_number).await {
                    Ok(()) => {
                        metrics::increment_init_attempt(&key, "ok");
                        statuses.insert(key.clone(), AdapterStatus::Ready);
                        info!("[{}] Ready for pricing after {} attempts", key, attempts);
                        return;
                    }
                    Err(e) => {
                        metrics::increment_init_attempt(&key, "error");
                        error!(
                            "[{}] Initialization attempt {} failed, retrying in {}ms: {:#}",
                            key,
                            attempts,
                            delay.as_millis(),
                            e
                        );
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.retry_tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    /// Adapter for `key` if it may be queried, or the reason it may not.
    fn queryable(&self, key: &str, phase: &'static str) -> Option<Arc<dyn SourceAdapter>> {
        let Some(adapter) = self.registry.get(key) else {
            error!("[{}] {}: unknown source", key, phase);
            return None;
        };
        if !self.is_ready(key) {
            debug!("[{}] {}: skipped, source not ready", key, phase);
            metrics::record_source_query(key, phase, "skipped", Duration::ZERO);
            return None;
        }
        Some(adapter)
    }

    /// Candidate pool identifiers per source for trading `from` into `to`.
    ///
    /// Every requested key appears in the result, in request order.
    pub async fn get_pool_identifiers(
        &self,
        from: &Token,
        to: &Token,
        side: SwapSide,
        block_number: u64,
        keys: &[String],
        filter_constant_price_pools: bool,
    ) -> PoolIdentifierMap {
        let lookups = keys.iter().map(|key| async move {
            let ids = match self.queryable(key, "identify") {
                None => Some(Vec::new()),
                Some(adapter) if filter_constant_price_pools && adapter.has_constant_price_large_amounts() => None,
                Some(adapter) => Some(
                    bounded(
                        key,
                        "identify",
                        self.config.pool_identifier_timeout,
                        adapter.get_pool_identifiers(from, to, side, block_number),
                    )
                    .await
                    .unwrap_or_default(),
                ),
            };
            (key.clone(), ids)
        });
        join_all(lookups).await.into_iter().collect()
    }

    /// Prices `request` on every source in `keys` and returns the validated,
    /// non-empty results.
    ///
    /// `limit_pools` restricts each source to its listed identifiers; a source
    /// mapped to an empty list is not called.
    pub async fn get_pool_prices(
        &self,
        request: &QuoteRequest,
        keys: &[String],
        limit_pools: Option<&PoolIdentifierMap>,
        options: &QueryOptions,
    ) -> Vec<PoolPrices> {
        let fee_on_transfer = request.transfer_fees.src_fee_to_be_exchanged();
        let queries = keys.iter().map(|key| async move {
            let limit = limit_pools.and_then(|map| map.get(key)).and_then(|ids| ids.as_deref());
            if limit.map_or(false, |ids| ids.is_empty()) {
                return None;
            }
            let adapter = self.queryable(key, "price")?;
            if fee_on_transfer && !adapter.is_fee_on_transfer_supported() {
                debug!("[{}] price: skipped, no fee-on-transfer support", key);
                return None;
            }
            if options.filter_constant_price_pools && adapter.has_constant_price_large_amounts() {
                return None;
            }
            let results = bounded(
                key,
                "price",
                self.config.pool_prices_timeout,
                adapter.get_prices_volume(request, limit),
            )
            .await
            .flatten()?;
            Some((adapter, results))
        });

        let mut merged = Vec::new();
        for (adapter, results) in join_all(queries).await.into_iter().flatten() {
            let key = adapter.key().to_string();
            let mut survivors = Vec::with_capacity(results.len());
            for prices in results {
                if let Err(rejection) = validate_pool_prices(&prices, &request.amounts) {
                    metrics::increment_rejected_result(&key, rejection.label());
                    error!("[{}] Discarding invalid result from {}: {}", key, prices.exchange, rejection);
                    continue;
                }
                if !prices.has_non_zero_price() {
                    debug!("[{}] Discarding all-zero result from {}", key, prices.exchange);
                    continue;
                }
                survivors.push(prices);
            }

            if let Some(l1_to_l2) = &options.l2_gas_cost {
                let adjusted: anyhow::Result<Vec<PoolPrices>> = survivors
                    .into_iter()
                    .map(|prices| {
                        let calldata = adapter.calldata_gas_cost(&prices);
                        apply_l2_gas_cost(prices, calldata, l1_to_l2.as_ref())
                    })
                    .collect();
                match adjusted {
                    Ok(adjusted) => merged.extend(adjusted),
                    Err(e) => {
                        metrics::increment_rejected_result(&key, "calldata_gas_cost");
                        error!("[{}] Discarding results with unusable calldata gas cost: {:#}", key, e);
                    }
                }
            } else {
                merged.extend(survivors);
            }
        }
        merged
    }

    /// Full quote: identify pools, narrow them to `allowed_pool_ids` if given,
    /// then price. Returns `None` if no source produced a valid result.
    pub async fn get_prices_volume(
        &self,
        request: &QuoteRequest,
        keys: &[String],
        allowed_pool_ids: Option<&[String]>,
        options: &QueryOptions,
    ) -> Option<Vec<PoolPrices>> {
        let mut identifiers = self
            .get_pool_identifiers(
                &request.from,
                &request.to,
                request.side,
                request.block_number,
                keys,
                options.filter_constant_price_pools,
            )
            .await;

        if let Some(allowed) = allowed_pool_ids {
            for ids in identifiers.values_mut().flatten() {
                ids.retain(|id| allowed.contains(id));
            }
        }

        let prices = self
            .get_pool_prices(request, keys, Some(&identifiers), options)
            .await;
        if prices.is_empty() {
            None
        } else {
            Some(prices)
        }
    }

    /// The `limit` most liquid pools containing `token` across all sources.
    pub async fn get_top_pools_for_token(&self, token: Address, limit: usize, keys: &[String]) -> Vec<PoolLiquidity> {
        let lookups = keys.iter().map(|key| async move {
            let adapter = self.queryable(key, "top_pools")?;
            bounded(
                key,
                "top_pools",
                self.config.pool_prices_timeout,
                adapter.get_top_pools_for_token(token, limit),
            )
            .await
        });
        let mut pools: Vec<PoolLiquidity> = join_all(lookups).await.into_iter().flatten().flatten().collect();
        pools.sort_by(|a, b| {
            b.liquidity_usd
                .partial_cmp(&a.liquidity_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        pools.truncate(limit);
        pools
    }

    /// Stops pending initialization retries and releases every source in
    /// `keys`. Failures are logged per source.
    pub async fn release_resources(&self, keys: &[String]) {
        if let Ok(mut tasks) = self.retry_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let releases = keys.iter().filter_map(|key| {
            let adapter = self.registry.get(key)?;
            Some(async move {
                if let Err(e) = adapter.release_resources().await {
                    error!("[{}] Failed to release resources: {:#}", key, e);
                }
                self.statuses.insert(key.clone(), AdapterStatus::Uninitialized);
            })
        });
        join_all(releases).await;
        metrics::set_sources_ready(self.ready_count());
        info!("Released {} sources", keys.len());
    }
}

impl Drop for PricingAggregator {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.retry_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
