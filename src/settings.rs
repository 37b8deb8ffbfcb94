use anyhow::{anyhow, Result};
use config::{Config, ConfigError, File};
use ethers::types::Address;
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;

use crate::price_oracle::TokenQuote;

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    pub http_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct Contracts {
    #[serde(default = "default_multicall")]
    pub multicall: Address,
    #[serde(default = "default_multicall_batch_size")]
    pub multicall_batch_size: usize,
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            multicall: default_multicall(),
            multicall_batch_size: default_multicall_batch_size(),
        }
    }
}

// Multicall3 has the same address on every major EVM chain.
fn default_multicall() -> Address {
    Address::from([
        0xca, 0x11, 0xbd, 0xe0, 0x59, 0x77, 0xb3, 0x63, 0x11, 0x67, 0x02, 0x88, 0x62, 0xbE, 0x2a, 0x17, 0x39, 0x76,
        0xCA, 0x11,
    ])
}

fn default_multicall_batch_size() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct Aggregator {
    #[serde(default = "default_pool_identifier_timeout_ms")]
    pub pool_identifier_timeout_ms: u64,
    #[serde(default = "default_pool_prices_timeout_ms")]
    pub pool_prices_timeout_ms: u64,
    #[serde(default = "default_setup_retry_delay_ms")]
    pub setup_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub clear_cached_state_on_init: bool,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            pool_identifier_timeout_ms: default_pool_identifier_timeout_ms(),
            pool_prices_timeout_ms: default_pool_prices_timeout_ms(),
            setup_retry_delay_ms: default_setup_retry_delay_ms(),
            clear_cached_state_on_init: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_pool_identifier_timeout_ms() -> u64 {
    1000
}
fn default_pool_prices_timeout_ms() -> u64 {
    3000
}
fn default_setup_retry_delay_ms() -> u64 {
    20_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct Catalog {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_min_tvl_usd")]
    pub min_tvl_usd: f64,
    #[serde(default = "default_tvl_refresh_interval_secs")]
    pub tvl_refresh_interval_secs: u64,
    #[serde(default = "default_pool_cache_ttl_secs")]
    pub pool_cache_ttl_secs: u64,
    #[serde(default = "default_page_timeout_ms")]
    pub page_timeout_ms: u64,
    #[serde(default = "default_max_page_retries")]
    pub max_page_retries: usize,
    #[serde(default = "default_page_retry_base_ms")]
    pub page_retry_base_ms: u64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            min_tvl_usd: default_min_tvl_usd(),
            tvl_refresh_interval_secs: default_tvl_refresh_interval_secs(),
            pool_cache_ttl_secs: default_pool_cache_ttl_secs(),
            page_timeout_ms: default_page_timeout_ms(),
            max_page_retries: default_max_page_retries(),
            page_retry_base_ms: default_page_retry_base_ms(),
        }
    }
}

fn default_page_size() -> usize {
    1000
}
fn default_min_tvl_usd() -> f64 {
    50_000.0
}
fn default_tvl_refresh_interval_secs() -> u64 {
    300
}
fn default_pool_cache_ttl_secs() -> u64 {
    3600
}
fn default_page_timeout_ms() -> u64 {
    10_000
}
fn default_max_page_retries() -> usize {
    3
}
fn default_page_retry_base_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct State {
    #[serde(default = "default_max_history_blocks")]
    pub max_history_blocks: usize,
    #[serde(default = "default_init_retry_base_ms")]
    pub init_retry_base_ms: u64,
    #[serde(default = "default_init_retry_max_ms")]
    pub init_retry_max_ms: u64,
    #[serde(default = "default_init_max_retries")]
    pub init_max_retries: usize,
    /// 0 disables memoisation of reconstructed states.
    #[serde(default)]
    pub state_cache_ttl_secs: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            max_history_blocks: default_max_history_blocks(),
            init_retry_base_ms: default_init_retry_base_ms(),
            init_retry_max_ms: default_init_retry_max_ms(),
            init_max_retries: default_init_max_retries(),
            state_cache_ttl_secs: 0,
        }
    }
}

fn default_max_history_blocks() -> usize {
    64
}
fn default_init_retry_base_ms() -> u64 {
    200
}
fn default_init_retry_max_ms() -> u64 {
    5000
}
fn default_init_max_retries() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Cache {
    /// In-memory store when unset or when built without the `redis` feature.
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct OracleToken {
    pub usd_price: f64,
    pub decimals: u8,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Oracle {
    /// Token address -> USD price and decimals.
    #[serde(default)]
    pub tokens: HashMap<String, OracleToken>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Source {
    pub key: String,
    pub subgraph_url: String,
    /// Pool entity of the subgraph: `pairs` (V2) or `pools` (V3/Algebra).
    #[serde(default = "default_subgraph_entity")]
    pub subgraph_entity: String,
    #[serde(default = "default_subgraph_tvl_field")]
    pub subgraph_tvl_field: String,
    #[serde(default)]
    pub subgraph_deployer_field: bool,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default = "default_pool_created_event")]
    pub pool_created_event: String,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u32,
    #[serde(default = "default_gas_cost")]
    pub gas_cost: u64,
    #[serde(default = "default_calldata_gas_cost")]
    pub calldata_gas_cost: u64,
    #[serde(default = "default_max_pools_per_pair")]
    pub max_pools_per_pair: usize,
}

fn default_subgraph_entity() -> String {
    "pairs".to_string()
}
fn default_subgraph_tvl_field() -> String {
    "reserveUSD".to_string()
}
fn default_pool_created_event() -> String {
    "event PairCreated(address indexed token0, address indexed token1, address pair, uint256 index)".to_string()
}
fn default_fee_bps() -> u32 {
    30
}
fn default_gas_cost() -> u64 {
    90_000
}
fn default_calldata_gas_cost() -> u64 {
    2_000
}
fn default_max_pools_per_pair() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rpc: Rpc,
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default)]
    pub aggregator: Aggregator,
    #[serde(default)]
    pub catalog: Catalog,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub oracle: Oracle,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        apply_env_overrides(&mut settings);
        Ok(settings)
    }

    /// Oracle quotes with parsed token addresses.
    pub fn oracle_quotes(&self) -> Result<Vec<(Address, TokenQuote)>> {
        self.oracle
            .tokens
            .iter()
            .map(|(token, quote)| {
                let address: Address = token
                    .trim()
                    .parse()
                    .map_err(|e| anyhow!("Invalid oracle token address {}: {}", token, e))?;
                Ok((
                    address,
                    TokenQuote {
                        usd_price: quote.usd_price,
                        decimals: quote.decimals,
                    },
                ))
            })
            .collect()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Some(url) = non_empty_env("PRICING_RPC_HTTP_URL") {
        settings.rpc.http_url = url;
    }
    if let Some(url) = non_empty_env("PRICING_REDIS_URL") {
        settings.cache.redis_url = Some(url);
    }

    // JSON object: { source_key: subgraph_url }
    if let Some(raw) = non_empty_env("PRICING_SUBGRAPH_URLS") {
        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(urls) => {
                for source in settings.sources.iter_mut() {
                    if let Some(url) = urls.get(&source.key).filter(|url| !url.trim().is_empty()) {
                        source.subgraph_url = url.clone();
                    }
                }
            }
            Err(e) => warn!("Failed to parse PRICING_SUBGRAPH_URLS as JSON: {}", e),
        }
    }
}
