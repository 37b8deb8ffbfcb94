//! Integration tests for pool discovery and TVL eligibility

mod common;

use common::{address, MockIndexer, MockMultiCaller};
use dex_pricing_sdk::cache_store::InMemoryCacheStore;
use dex_pricing_sdk::catalog::{BlockTag, CatalogConfig, PoolCatalog, PoolRecord};
use dex_pricing_sdk::cache_store::CacheStore;
use dex_pricing_sdk::price_oracle::{StaticPriceOracle, TokenQuote};
use dex_pricing_sdk::state::LogSubscriber;
use ethers::abi::{encode, Token as AbiToken};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const USD: u8 = 0xd0;
const OTHER: u8 = 0xe0;

fn record(pool: u8, token0: u8, token1: u8) -> PoolRecord {
    PoolRecord {
        address: address(pool),
        token0: address(token0),
        token1: address(token1),
        deployer: None,
        fee: None,
        tvl_usd: 0.0,
    }
}

/// One raw unit of `USD` or `USD + 1` is worth exactly $1; `OTHER` has no price.
fn oracle() -> Arc<StaticPriceOracle> {
    let dollar = TokenQuote {
        usd_price: 1.0,
        decimals: 0,
    };
    Arc::new(StaticPriceOracle::from_quotes([(address(USD), dollar), (address(USD + 1), dollar)]))
}

fn catalog(indexer: Arc<MockIndexer>, multicaller: Arc<MockMultiCaller>, cache: Arc<InMemoryCacheStore>) -> PoolCatalog {
    PoolCatalog::new(
        "ReservePools",
        indexer,
        multicaller,
        oracle(),
        cache,
        CatalogConfig {
            page_retry_base: Duration::from_millis(10),
            ..Default::default()
        },
    )
}

/// Paging stops at the first short page
#[tokio::test]
async fn test_paging_terminates_on_short_page() {
    let indexer = Arc::new(MockIndexer::synthetic(2437));
    let catalog = catalog(indexer.clone(), Arc::new(MockMultiCaller::new()), Arc::new(InMemoryCacheStore::new()));

    let pools = catalog.discover_all(100).await.expect("discovery succeeds");

    assert_eq!(pools.len(), 2437);
    assert_eq!(indexer.request_count(), 3);
    let skips: Vec<usize> = indexer.requests.lock().unwrap().iter().map(|(skip, _)| *skip).collect();
    assert_eq!(skips, vec![0, 1000, 2000]);
}

/// An exactly full last page costs one extra, empty request
#[tokio::test]
async fn test_paging_with_exact_multiple() {
    let indexer = Arc::new(MockIndexer::synthetic(2000));
    let catalog = catalog(indexer.clone(), Arc::new(MockMultiCaller::new()), Arc::new(InMemoryCacheStore::new()));

    let pools = catalog.discover_all(100).await.unwrap();

    assert_eq!(pools.len(), 2000);
    assert_eq!(indexer.request_count(), 3);
}

/// Unindexed historical blocks fall back once to the latest block
#[tokio::test]
async fn test_unavailable_block_falls_back_to_latest() {
    let mut indexer = MockIndexer::synthetic(10);
    indexer.indexed_up_to = Some(90);
    let indexer = Arc::new(indexer);
    let catalog = catalog(indexer.clone(), Arc::new(MockMultiCaller::new()), Arc::new(InMemoryCacheStore::new()));

    let pools = catalog.discover_all(100).await.unwrap();

    assert_eq!(pools.len(), 10);
    assert_eq!(indexer.request_tags(), vec![BlockTag::Number(100), BlockTag::Latest]);
}

/// Transient indexer failures are retried
#[tokio::test(start_paused = true)]
async fn test_transient_page_failures_are_retried() {
    let indexer = Arc::new(MockIndexer::synthetic(5));
    indexer.transient_failures.store(2, Ordering::SeqCst);
    let catalog = catalog(indexer.clone(), Arc::new(MockMultiCaller::new()), Arc::new(InMemoryCacheStore::new()));

    let pools = catalog.discover_all(100).await.unwrap();

    assert_eq!(pools.len(), 5);
    assert_eq!(indexer.request_count(), 3);
}

/// A cached pool list short-circuits paging
#[tokio::test]
async fn test_cache_hit_skips_indexer() {
    let cache = Arc::new(InMemoryCacheStore::new());
    let first = Arc::new(MockIndexer::synthetic(7));
    catalog(first.clone(), Arc::new(MockMultiCaller::new()), cache.clone())
        .discover_all(100)
        .await
        .unwrap();

    let second = Arc::new(MockIndexer::synthetic(7));
    let pools = catalog(second.clone(), Arc::new(MockMultiCaller::new()), cache)
        .discover_all(100)
        .await
        .unwrap();

    assert_eq!(pools.len(), 7);
    assert_eq!(first.request_count(), 1);
    assert_eq!(second.request_count(), 0);
}

/// The TVL floor is inclusive
#[tokio::test]
async fn test_tvl_floor_is_inclusive() {
    let indexer = Arc::new(MockIndexer::with_pools(vec![record(1, USD, OTHER), record(2, USD, OTHER)]));
    let multicaller = Arc::new(MockMultiCaller::new());
    multicaller.set_balance(address(USD), address(1), 49_999);
    multicaller.set_balance(address(USD), address(2), 50_000);
    let catalog = Arc::new(catalog(indexer, multicaller, Arc::new(InMemoryCacheStore::new())));

    catalog.initialize(100).await.unwrap();
    let eligible = catalog.pools_for_pair(address(USD), address(OTHER)).await;

    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].address, address(2));
    assert_eq!(eligible[0].tvl_usd, 50_000.0);
}

/// A failed balance call counts as zero without failing the batch
#[tokio::test]
async fn test_partial_multicall_failure() {
    let indexer = Arc::new(MockIndexer::with_pools(vec![record(1, USD, USD + 1), record(2, USD, OTHER)]));
    let multicaller = Arc::new(MockMultiCaller::new());
    let oracle_token = address(USD + 1);
    multicaller.set_balance(address(USD), address(1), 30_000);
    multicaller.set_balance(oracle_token, address(1), 40_000);
    multicaller.fail_balance(oracle_token, address(1));
    multicaller.set_balance(address(USD), address(2), 70_000);
    let catalog = catalog(indexer, multicaller, Arc::new(InMemoryCacheStore::new()));

    catalog.initialize(100).await.unwrap();

    assert_eq!(catalog.pool(address(1)).unwrap().tvl_usd, 30_000.0);
    assert_eq!(catalog.pool(address(2)).unwrap().tvl_usd, 70_000.0);
}

/// Eligible pools come back by descending TVL, ties in discovery order
#[tokio::test]
async fn test_pair_selection_order() {
    let indexer = Arc::new(MockIndexer::with_pools(vec![
        record(1, USD, OTHER),
        record(2, OTHER, USD),
        record(3, USD, OTHER),
        record(4, USD, 0xf0),
    ]));
    let multicaller = Arc::new(MockMultiCaller::new());
    multicaller.set_balance(address(USD), address(1), 60_000);
    multicaller.set_balance(address(USD), address(2), 90_000);
    multicaller.set_balance(address(USD), address(3), 60_000);
    multicaller.set_balance(address(USD), address(4), 99_000);
    let catalog = Arc::new(catalog(indexer, multicaller, Arc::new(InMemoryCacheStore::new())));
    catalog.initialize(100).await.unwrap();

    let pools = catalog.pools_for_pair(address(OTHER), address(USD)).await;
    let order: Vec<Address> = pools.iter().map(|p| p.address).collect();
    assert_eq!(order, vec![address(2), address(1), address(3)]);

    let top = catalog.top_pools_for_token(address(USD), 2).await;
    assert_eq!(top[0].address, address(4));
    assert_eq!(top[0].connector_tokens, vec![address(0xf0)]);
    assert_eq!(top[1].address, address(2));
}

/// Stale eligibility is refreshed before it is used
#[tokio::test(start_paused = true)]
async fn test_stale_eligibility_is_refreshed() {
    let indexer = Arc::new(MockIndexer::with_pools(vec![record(1, USD, OTHER)]));
    let multicaller = Arc::new(MockMultiCaller::new());
    multicaller.set_balance(address(USD), address(1), 10_000);
    let catalog = Arc::new(catalog(indexer, multicaller.clone(), Arc::new(InMemoryCacheStore::new())));
    catalog.initialize(100).await.unwrap();
    assert!(catalog.pools_for_pair(address(USD), address(OTHER)).await.is_empty());

    multicaller.set_balance(address(USD), address(1), 80_000);
    assert!(catalog.pools_for_pair(address(USD), address(OTHER)).await.is_empty());
    assert_eq!(multicaller.batches.load(Ordering::SeqCst), 1);

    tokio::time::advance(catalog.config().tvl_refresh_interval + Duration::from_secs(1)).await;
    let eligible = catalog.pools_for_pair(address(USD), address(OTHER)).await;
    assert_eq!(eligible.len(), 1);
    assert_eq!(multicaller.batches.load(Ordering::SeqCst), 2);
}

fn pair_created(factory: Address, token1: u8, pool: u8) -> Log {
    Log {
        address: factory,
        topics: vec![
            H256::from(keccak256("PairCreated(address,address,address,uint256)")),
            H256::from(address(USD)),
            H256::from(address(token1)),
        ],
        data: encode(&[AbiToken::Address(address(pool)), AbiToken::Uint(U256::from(2))]).into(),
        ..Default::default()
    }
}

/// Factory events append new pools with zero TVL, once
#[tokio::test]
async fn test_factory_event_appends_pool() {
    let factory = address(0xfa);
    let catalog = catalog(
        Arc::new(MockIndexer::with_pools(vec![record(1, USD, OTHER)])),
        Arc::new(MockMultiCaller::new()),
        Arc::new(InMemoryCacheStore::new()),
    )
    .with_factory(
        factory,
        &["event PairCreated(address indexed token0, address indexed token1, address pair, uint256 index)"],
    )
    .unwrap();
    catalog.initialize(100).await.unwrap();

    let log = pair_created(factory, 0xf1, 9);

    assert!(catalog.handle_factory_log(&log).unwrap());
    assert!(!catalog.handle_factory_log(&log).unwrap());
    assert_eq!(catalog.len(), 2);
    let added = catalog.pool(address(9)).unwrap();
    assert_eq!(added.token1, address(0xf1));
    assert_eq!(added.tvl_usd, 0.0);
}

/// A query cancelled by its deadline does not cancel the TVL refresh it started
#[tokio::test(start_paused = true)]
async fn test_cancelled_query_keeps_refresh_running() {
    let indexer = Arc::new(MockIndexer::with_pools(vec![record(1, USD, OTHER)]));
    let multicaller = Arc::new(MockMultiCaller::new());
    multicaller.set_balance(address(USD), address(1), 80_000);
    let catalog = Arc::new(catalog(indexer, multicaller.clone(), Arc::new(InMemoryCacheStore::new())));
    catalog.initialize(100).await.unwrap();
    assert_eq!(catalog.pools_for_pair(address(USD), address(OTHER)).await.len(), 1);

    multicaller.set_balance(address(USD), address(1), 10_000);
    *multicaller.delay.lock().unwrap() = Duration::from_secs(5);
    tokio::time::advance(catalog.config().tvl_refresh_interval + Duration::from_secs(1)).await;
    let query = tokio::time::timeout(
        Duration::from_secs(1),
        catalog.pools_for_pair(address(USD), address(OTHER)),
    )
    .await;
    assert!(query.is_err());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(catalog.is_eligibility_fresh());
    assert_eq!(catalog.pool(address(1)).unwrap().tvl_usd, 10_000.0);
    assert!(catalog.pools_for_pair(address(USD), address(OTHER)).await.is_empty());
    assert_eq!(multicaller.batches.load(Ordering::SeqCst), 2);
}

/// Pools announced by the factory reach the cached pool list
#[tokio::test]
async fn test_factory_pools_are_written_to_cache() {
    let factory = address(0xfa);
    let cache = Arc::new(InMemoryCacheStore::new());
    let live = Arc::new(
        catalog(
            Arc::new(MockIndexer::with_pools(vec![record(1, USD, OTHER)])),
            Arc::new(MockMultiCaller::new()),
            cache.clone(),
        )
        .with_factory(
            factory,
            &["event PairCreated(address indexed token0, address indexed token1, address pair, uint256 index)"],
        )
        .unwrap(),
    );
    live.initialize(100).await.unwrap();
    let subscriber = live.factory_subscriber().expect("factory configured");

    subscriber
        .on_block_logs(101, &[pair_created(factory, 0xf1, 9)])
        .await
        .unwrap();

    let raw = cache.get(&live.cache_key()).await.unwrap().expect("pool list cached");
    let cached: Vec<PoolRecord> = serde_json::from_str(&raw).unwrap();
    let addresses: Vec<Address> = cached.iter().map(|pool| pool.address).collect();
    assert_eq!(addresses, vec![address(1), address(9)]);

    let cold = Arc::new(MockIndexer::with_pools(vec![record(1, USD, OTHER)]));
    let restarted = catalog(cold.clone(), Arc::new(MockMultiCaller::new()), cache);
    assert_eq!(restarted.discover_all(102).await.unwrap().len(), 2);
    assert_eq!(cold.request_count(), 0);
}
