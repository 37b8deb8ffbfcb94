//! Constant-product reserve pools (`x * y = k`) discovered through a
//! [`PoolCatalog`] and kept current from their `Sync` events.
//!
//! Each priced pool gets its own [`StateSynchronizer`], created on first use
//! and cold-started at the requested block. When a [`BlockLogDispatcher`] is
//! attached the synchronizer follows new blocks; without one every request
//! past the known history reconstructs the reserves with `getReserves()`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::{self, AbiEncode, ParamType};
use ethers::types::{Address, U256};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::cache_store::CacheStore;
use crate::catalog::{PoolCatalog, PoolRecord};
use crate::chain::ChainClient;
use crate::contracts::{GetReservesCall, SYNC_EVENT};
use crate::source_adapter::SourceAdapter;
use crate::state::{BlockLogDispatcher, EventDecoder, EventSource, StateSynchronizer, SyncConfig, TrackedContract};
use crate::types::{pool_identifier, GasCost, PoolLiquidity, PoolPrices, QuoteRequest, SwapSide, Token};

const FEE_DENOMINATOR: u64 = 10_000;

/// Reserves of a pair as of the end of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveState {
    pub reserve0: U256,
    pub reserve1: U256,
}

/// Event source for one pair: `Sync` replaces both reserves.
pub struct ReservePoolEvents {
    contract: TrackedContract,
    decoder: EventDecoder<ReserveState>,
    chain: Arc<dyn ChainClient>,
}

impl ReservePoolEvents {
    pub fn new(address: Address, source_key: &str, chain: Arc<dyn ChainClient>) -> Result<Self> {
        let decoder = EventDecoder::from_signatures(&[SYNC_EVENT])?.on("Sync", |_, event, _| {
            Ok(ReserveState {
                reserve0: event.uint("reserve0")?,
                reserve1: event.uint("reserve1")?,
            })
        });
        let contract = TrackedContract::new(address, decoder.topics(), source_key);
        Ok(Self {
            contract,
            decoder,
            chain,
        })
    }
}

#[async_trait]
impl EventSource for ReservePoolEvents {
    type State = ReserveState;

    fn contract(&self) -> &TrackedContract {
        &self.contract
    }

    fn decoder(&self) -> &EventDecoder<ReserveState> {
        &self.decoder
    }

    async fn generate_state(&self, block_number: u64) -> Result<ReserveState> {
        let address = self.contract.address;
        let output = self
            .chain
            .call(address, GetReservesCall.encode().into(), Some(block_number))
            .await
            .with_context(|| format!("getReserves() on {:?} at block {}", address, block_number))?;
        let decoded = abi::decode(&[ParamType::Uint(112), ParamType::Uint(112), ParamType::Uint(32)], &output)
            .with_context(|| format!("Malformed getReserves() output from {:?}", address))?;
        match (decoded.first().cloned(), decoded.get(1).cloned()) {
            (Some(reserve0), Some(reserve1)) => Ok(ReserveState {
                reserve0: reserve0.into_uint().unwrap_or_default(),
                reserve1: reserve1.into_uint().unwrap_or_default(),
            }),
            _ => anyhow::bail!("getReserves() on {:?} returned {} values", address, decoded.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReservePoolConfig {
    pub key: String,
    /// Swap fee in basis points, taken from the input amount.
    pub fee_bps: u32,
    pub gas_cost: u64,
    pub calldata_gas_cost: u64,
    /// Most liquid pools offered per token pair.
    pub max_pools_per_pair: usize,
}

impl ReservePoolConfig {
    pub fn new(key: impl Into<String>, fee_bps: u32, gas_cost: u64) -> Self {
        Self {
            key: key.into(),
            fee_bps,
            gas_cost,
            calldata_gas_cost: 2_000,
            max_pools_per_pair: 3,
        }
    }
}

/// Output for selling `amount_in`. Zero when the pool cannot quote.
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> U256 {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::zero();
    }
    let fee_factor = U256::from(FEE_DENOMINATOR.saturating_sub(fee_bps as u64));
    let quote = || -> Option<U256> {
        let in_with_fee = amount_in.checked_mul(fee_factor)?;
        let numerator = in_with_fee.checked_mul(reserve_out)?;
        let denominator = reserve_in
            .checked_mul(U256::from(FEE_DENOMINATOR))?
            .checked_add(in_with_fee)?;
        numerator.checked_div(denominator)
    };
    quote().unwrap_or_default()
}

/// Input required to buy `amount_out`. Zero when the pool cannot fill it.
pub fn amount_in(amount_out: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> U256 {
    if amount_out.is_zero() || reserve_in.is_zero() || amount_out >= reserve_out {
        return U256::zero();
    }
    let fee_factor = U256::from(FEE_DENOMINATOR.saturating_sub(fee_bps as u64));
    let quote = || -> Option<U256> {
        let numerator = reserve_in
            .checked_mul(amount_out)?
            .checked_mul(U256::from(FEE_DENOMINATOR))?;
        let denominator = (reserve_out - amount_out).checked_mul(fee_factor)?;
        numerator.checked_div(denominator)?.checked_add(U256::one())
    };
    quote().unwrap_or_default()
}

/// One whole token in base units; zero when `10^decimals` overflows.
pub fn unit_amount(decimals: u8) -> U256 {
    U256::from(10)
        .checked_pow(U256::from(decimals))
        .unwrap_or_default()
}

/// Catalog-backed constant-product source.
pub struct ReservePoolSource {
    config: ReservePoolConfig,
    catalog: Arc<PoolCatalog>,
    chain: Arc<dyn ChainClient>,
    dispatcher: Option<Arc<BlockLogDispatcher>>,
    sync_config: SyncConfig,
    cache: Option<Arc<dyn CacheStore>>,
    pools: DashMap<Address, Arc<StateSynchronizer<ReservePoolEvents>>>,
}

impl ReservePoolSource {
    pub fn new(
        config: ReservePoolConfig,
        catalog: Arc<PoolCatalog>,
        chain: Arc<dyn ChainClient>,
        sync_config: SyncConfig,
    ) -> Self {
        Self {
            config,
            catalog,
            chain,
            dispatcher: None,
            sync_config,
            cache: None,
            pools: DashMap::new(),
        }
    }

    /// Follows new blocks through `dispatcher` instead of reconstructing on demand.
    pub fn with_dispatcher(mut self, dispatcher: Arc<BlockLogDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Memoises reconstructions in `cache` when the sync config enables it.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn catalog(&self) -> &Arc<PoolCatalog> {
        &self.catalog
    }

    pub fn tracked_pools(&self) -> usize {
        self.pools.len()
    }

    async fn synchronizer(&self, address: Address, block_number: u64) -> Result<Arc<StateSynchronizer<ReservePoolEvents>>> {
        if let Some(existing) = self.pools.get(&address) {
            return Ok(existing.clone());
        }

        let events = ReservePoolEvents::new(address, &self.config.key, self.chain.clone())?;
        let mut synchronizer = StateSynchronizer::new(Arc::new(events), self.chain.clone(), self.sync_config.clone());
        if let Some(cache) = &self.cache {
            synchronizer = synchronizer.with_cache(cache.clone());
        }
        synchronizer.initialize(block_number).await?;

        let synchronizer = self.pools.entry(address).or_insert_with(|| Arc::new(synchronizer)).clone();
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.subscribe(synchronizer.clone());
        }
        debug!("[{}] Tracking reserves of {:?} from block {}", self.config.key, address, block_number);
        Ok(synchronizer)
    }

    async fn reserves(&self, pool: &PoolRecord, block_number: u64) -> Result<ReserveState> {
        let synchronizer = self.synchronizer(pool.address, block_number).await?;
        let state = synchronizer.get_state_or_generate(block_number, false).await?;
        Ok(*state)
    }

    fn quote(&self, side: SwapSide, amount: U256, reserve_in: U256, reserve_out: U256) -> U256 {
        match side {
            SwapSide::Sell => amount_out(amount, reserve_in, reserve_out, self.config.fee_bps),
            SwapSide::Buy => amount_in(amount, reserve_in, reserve_out, self.config.fee_bps),
        }
    }

    fn price_pool(&self, request: &QuoteRequest, pool: &PoolRecord, state: ReserveState) -> PoolPrices {
        let (reserve_in, reserve_out) = if pool.token0 == request.from.address {
            (state.reserve0, state.reserve1)
        } else {
            (state.reserve1, state.reserve0)
        };
        let unit_amount = match request.side {
            SwapSide::Sell => unit_amount(request.from.decimals),
            SwapSide::Buy => unit_amount(request.to.decimals),
        };
        PoolPrices {
            exchange: self.config.key.clone(),
            prices: request
                .amounts
                .iter()
                .map(|amount| self.quote(request.side, *amount, reserve_in, reserve_out))
                .collect(),
            unit: self.quote(request.side, unit_amount, reserve_in, reserve_out),
            gas_cost: GasCost::Scalar(self.config.gas_cost),
            gas_cost_l2: None,
            calldata_gas_cost: None,
            pool_identifiers: vec![pool_identifier(&self.config.key, pool.address)],
            pool_addresses: vec![pool.address],
            data: json!({
                "pool": pool.address,
                "fee_bps": self.config.fee_bps,
            }),
        }
    }
}

#[async_trait]
impl SourceAdapter for ReservePoolSource {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn cache_state_key(&self) -> Option<String> {
        Some(self.catalog.cache_key())
    }

    async fn initialize_pricing(&self, block_number: u64) -> Result<()> {
        let pools = self.catalog.initialize(block_number).await?;
        if let Some(dispatcher) = &self.dispatcher {
            if let Some(factory) = self.catalog.factory_subscriber() {
                dispatcher.subscribe(factory);
            }
        }
        self.catalog.start_refresh_task();
        info!("[{}] Pricing initialized with {} catalog pools", self.config.key, pools);
        Ok(())
    }

    async fn get_pool_identifiers(
        &self,
        from: &Token,
        to: &Token,
        _side: SwapSide,
        _block_number: u64,
    ) -> Result<Vec<String>> {
        Ok(self
            .catalog
            .pools_for_pair(from.address, to.address)
            .await
            .into_iter()
            .take(self.config.max_pools_per_pair)
            .map(|pool| pool_identifier(&self.config.key, pool.address))
            .collect())
    }

    async fn get_prices_volume(
        &self,
        request: &QuoteRequest,
        limit_pools: Option<&[String]>,
    ) -> Result<Option<Vec<PoolPrices>>> {
        let candidates: Vec<PoolRecord> = self
            .catalog
            .pools_for_pair(request.from.address, request.to.address)
            .await
            .into_iter()
            .filter(|pool| {
                limit_pools.map_or(true, |ids| ids.contains(&pool_identifier(&self.config.key, pool.address)))
            })
            .take(self.config.max_pools_per_pair)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut results = Vec::with_capacity(candidates.len());
        for pool in &candidates {
            match self.reserves(pool, request.block_number).await {
                Ok(state) => results.push(self.price_pool(request, pool, state)),
                Err(e) => warn!(
                    "[{}] No reserves for {:?} at block {}: {:#}",
                    self.config.key, pool.address, request.block_number, e
                ),
            }
        }
        Ok(if results.is_empty() { None } else { Some(results) })
    }

    fn calldata_gas_cost(&self, _prices: &PoolPrices) -> GasCost {
        GasCost::Scalar(self.config.calldata_gas_cost)
    }

    async fn get_top_pools_for_token(&self, token: Address, limit: usize) -> Result<Vec<PoolLiquidity>> {
        Ok(self.catalog.top_pools_for_token(token, limit).await)
    }

    async fn release_resources(&self) -> Result<()> {
        self.catalog.release_resources();
        if let Some(dispatcher) = &self.dispatcher {
            for entry in self.pools.iter() {
                dispatcher.unsubscribe(*entry.key(), &self.config.key);
            }
            if let Some(factory) = self.catalog.factory_subscriber() {
                let contract = factory.contract();
                dispatcher.unsubscribe(contract.address, &contract.source_key);
            }
        }
        let released = self.pools.len();
        self.pools.clear();
        info!("[{}] Released {} tracked pools", self.config.key, released);
        Ok(())
    }
}
