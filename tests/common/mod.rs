//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::abi::{encode, Token as AbiToken};
use ethers::types::{Address, Bytes, Filter, Log, ValueOrArray, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dex_pricing_sdk::catalog::{BlockTag, IndexerError, PoolIndexer, PoolRecord};
use dex_pricing_sdk::chain::{BlockHeader, ChainClient};
use dex_pricing_sdk::multicall::{Call, CallResult, MultiCaller};
use dex_pricing_sdk::source_adapter::SourceAdapter;
use dex_pricing_sdk::types::{GasCost, PoolLiquidity, PoolPrices, QuoteRequest, SwapSide, Token};

pub fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn sync_topic() -> H256 {
    H256::from(keccak256("Sync(uint112,uint112)"))
}

pub fn sync_log(pool: Address, block: u64, log_index: u64, reserve0: u64, reserve1: u64) -> Log {
    Log {
        address: pool,
        topics: vec![sync_topic()],
        data: encode(&[AbiToken::Uint(U256::from(reserve0)), AbiToken::Uint(U256::from(reserve1))]).into(),
        block_number: Some(U64::from(block)),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

fn position(log: &Log) -> (u64, u64) {
    (
        log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
        log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
    )
}

/// Chain whose reserves follow its own `Sync` logs, so a reconstruction at
/// block N always equals the fold of the canonical logs up to N.
#[derive(Default)]
pub struct MockChain {
    headers: Mutex<BTreeMap<u64, BlockHeader>>,
    logs: Mutex<Vec<Log>>,
    genesis_reserves: Mutex<HashMap<Address, (u64, u64)>>,
    pub failing_calls: AtomicUsize,
    pub calls: AtomicUsize,
    pub get_logs_calls: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_genesis_reserves(&self, pool: Address, reserve0: u64, reserve1: u64) {
        self.genesis_reserves.lock().unwrap().insert(pool, (reserve0, reserve1));
    }

    /// Appends a canonical block on top of the current tip.
    pub fn add_block(&self, number: u64, hash_byte: u8) -> BlockHeader {
        let mut headers = self.headers.lock().unwrap();
        let parent_hash = number
            .checked_sub(1)
            .and_then(|parent| headers.get(&parent))
            .map(|parent| parent.hash)
            .unwrap_or_default();
        let header = BlockHeader {
            number,
            hash: H256::repeat_byte(hash_byte),
            parent_hash,
        };
        headers.insert(number, header);
        header
    }

    /// Replaces block `number` (and its logs) with a sibling block.
    pub fn reorg_block(&self, number: u64, hash_byte: u8, logs: Vec<Log>) -> BlockHeader {
        self.logs
            .lock()
            .unwrap()
            .retain(|log| log.block_number != Some(U64::from(number)));
        self.add_logs(logs);
        self.add_block(number, hash_byte)
    }

    pub fn add_logs(&self, logs: Vec<Log>) {
        self.logs.lock().unwrap().extend(logs);
    }

    pub fn reserves_at(&self, pool: Address, block: u64) -> (u64, u64) {
        let logs = self.logs.lock().unwrap();
        let latest = logs
            .iter()
            .filter(|log| log.address == pool && log.topics.first() == Some(&sync_topic()))
            .filter(|log| position(log).0 <= block)
            .max_by_key(|log| position(log));
        match latest {
            Some(log) => {
                let reserve0 = U256::from_big_endian(&log.data[..32]).as_u64();
                let reserve1 = U256::from_big_endian(&log.data[32..64]).as_u64();
                (reserve0, reserve1)
            }
            None => self
                .genesis_reserves
                .lock()
                .unwrap()
                .get(&pool)
                .copied()
                .unwrap_or_default(),
        }
    }
}

fn filter_addresses(filter: &Filter) -> Option<Vec<Address>> {
    match &filter.address {
        Some(ValueOrArray::Value(address)) => Some(vec![*address]),
        Some(ValueOrArray::Array(addresses)) => Some(addresses.clone()),
        None => None,
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.headers.lock().unwrap().keys().next_back().copied().unwrap_or_default())
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>> {
        Ok(self.headers.lock().unwrap().get(&number).copied())
    }

    async fn call(&self, to: Address, _data: Bytes, block: Option<u64>) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("connection reset by peer"));
        }
        let block = match block {
            Some(block) => block,
            None => self.block_number().await?,
        };
        let (reserve0, reserve1) = self.reserves_at(to, block);
        Ok(encode(&[
            AbiToken::Uint(U256::from(reserve0)),
            AbiToken::Uint(U256::from(reserve1)),
            AbiToken::Uint(U256::zero()),
        ])
        .into())
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        let from = filter.get_from_block().map(|n| n.as_u64()).unwrap_or_default();
        let to = filter.get_to_block().map(|n| n.as_u64()).unwrap_or(u64::MAX);
        let addresses = filter_addresses(filter);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let (block, _) = position(log);
                block >= from
                    && block <= to
                    && addresses.as_ref().map_or(true, |addresses| addresses.contains(&log.address))
            })
            .cloned()
            .collect())
    }
}

/// Indexer serving `total` synthetic pools, or an explicit list.
pub struct MockIndexer {
    pools: Vec<PoolRecord>,
    /// Pinned queries above this block report `BlockUnavailable`.
    pub indexed_up_to: Option<u64>,
    pub transient_failures: AtomicUsize,
    pub requests: Mutex<Vec<(usize, BlockTag)>>,
}

impl MockIndexer {
    pub fn with_pools(pools: Vec<PoolRecord>) -> Self {
        Self {
            pools,
            indexed_up_to: None,
            transient_failures: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn synthetic(total: usize) -> Self {
        Self::with_pools(
            (0..total)
                .map(|i| PoolRecord {
                    address: Address::from_low_u64_be(0x1_0000 + i as u64),
                    token0: address(0xa0),
                    token1: address(0xb0),
                    deployer: None,
                    fee: None,
                    tvl_usd: 0.0,
                })
                .collect(),
        )
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_tags(&self) -> Vec<BlockTag> {
        self.requests.lock().unwrap().iter().map(|(_, tag)| *tag).collect()
    }
}

#[async_trait]
impl PoolIndexer for MockIndexer {
    async fn query_pools(&self, skip: usize, limit: usize, block: BlockTag) -> Result<Vec<PoolRecord>, IndexerError> {
        self.requests.lock().unwrap().push((skip, block));
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IndexerError::Status(503));
        }
        if let (BlockTag::Number(number), Some(indexed)) = (block, self.indexed_up_to) {
            if number > indexed {
                return Err(IndexerError::BlockUnavailable(format!(
                    "missing block: {} (latest indexed {})",
                    number, indexed
                )));
            }
        }
        Ok(self.pools.iter().skip(skip).take(limit).cloned().collect())
    }
}

/// `balanceOf` multicaller over a balance table.
#[derive(Default)]
pub struct MockMultiCaller {
    balances: Mutex<HashMap<(Address, Address), U256>>,
    failing: Mutex<HashSet<(Address, Address)>>,
    pub batches: AtomicUsize,
    /// Latency of every batch.
    pub delay: Mutex<Duration>,
}

impl MockMultiCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, token: Address, account: Address, balance: u64) {
        self.balances.lock().unwrap().insert((token, account), U256::from(balance));
    }

    pub fn fail_balance(&self, token: Address, account: Address) {
        self.failing.lock().unwrap().insert((token, account));
    }
}

#[async_trait]
impl MultiCaller for MockMultiCaller {
    async fn try_aggregate(&self, calls: Vec<Call>, _block: Option<u64>) -> Result<Vec<CallResult>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let balances = self.balances.lock().unwrap();
        let failing = self.failing.lock().unwrap();
        Ok(calls
            .iter()
            .map(|call| {
                // balanceOf(address): 4-byte selector, then the account left-padded to 32 bytes.
                let account = Address::from_slice(&call.call_data[16..36]);
                if failing.contains(&(call.target, account)) {
                    return CallResult {
                        success: false,
                        return_data: Bytes::default(),
                    };
                }
                let balance = balances.get(&(call.target, account)).copied().unwrap_or_default();
                CallResult {
                    success: true,
                    return_data: encode(&[AbiToken::Uint(balance)]).into(),
                }
            })
            .collect())
    }
}

pub fn pool_prices(exchange: &str, prices: &[u64], gas_cost: GasCost) -> PoolPrices {
    PoolPrices {
        exchange: exchange.to_string(),
        prices: prices.iter().copied().map(U256::from).collect(),
        unit: U256::from(1),
        gas_cost,
        gas_cost_l2: None,
        calldata_gas_cost: None,
        pool_identifiers: vec![format!("{}_pool", exchange)],
        pool_addresses: vec![],
        data: serde_json::Value::Null,
    }
}

/// Source with scripted answers, latency and failures.
pub struct MockAdapter {
    key: String,
    pub delay: Duration,
    pub pool_ids: Vec<String>,
    pub prices: Option<Vec<PoolPrices>>,
    pub fail_prices: bool,
    pub constant_price: bool,
    pub fee_on_transfer: bool,
    pub cache_key: Option<String>,
    pub calldata: GasCost,
    pub top_pools: Vec<PoolLiquidity>,
    pub init_failures: AtomicUsize,
    pub init_calls: AtomicUsize,
    pub identify_calls: AtomicUsize,
    pub price_calls: AtomicUsize,
    pub released: AtomicBool,
    pub last_limit: Mutex<Option<Vec<String>>>,
}

impl MockAdapter {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            delay: Duration::ZERO,
            pool_ids: vec![format!("{}_pool", key)],
            prices: None,
            fail_prices: false,
            constant_price: false,
            fee_on_transfer: false,
            cache_key: None,
            calldata: GasCost::Scalar(0),
            top_pools: vec![],
            init_failures: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            identify_calls: AtomicUsize::new(0),
            price_calls: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            last_limit: Mutex::new(None),
        }
    }

    pub fn with_prices(mut self, prices: Vec<PoolPrices>) -> Self {
        self.prices = Some(prices);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_init(self, failures: usize) -> Self {
        self.init_failures.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn key(&self) -> &str {
        &self.key
    }

    fn has_constant_price_large_amounts(&self) -> bool {
        self.constant_price
    }

    fn is_fee_on_transfer_supported(&self) -> bool {
        self.fee_on_transfer
    }

    fn cache_state_key(&self) -> Option<String> {
        self.cache_key.clone()
    }

    async fn initialize_pricing(&self, _block_number: u64) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("{} state endpoint unavailable", self.key));
        }
        Ok(())
    }

    async fn get_pool_identifiers(&self, _from: &Token, _to: &Token, _side: SwapSide, _block_number: u64) -> Result<Vec<String>> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.pool_ids.clone())
    }

    async fn get_prices_volume(&self, _request: &QuoteRequest, limit_pools: Option<&[String]>) -> Result<Option<Vec<PoolPrices>>> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_limit.lock().unwrap() = limit_pools.map(|ids| ids.to_vec());
        tokio::time::sleep(self.delay).await;
        if self.fail_prices {
            return Err(anyhow!("{} pricing reverted", self.key));
        }
        Ok(self.prices.clone())
    }

    fn calldata_gas_cost(&self, _prices: &PoolPrices) -> GasCost {
        self.calldata.clone()
    }

    async fn get_top_pools_for_token(&self, _token: Address, _limit: usize) -> Result<Vec<PoolLiquidity>> {
        Ok(self.top_pools.clone())
    }

    async fn release_resources(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}
