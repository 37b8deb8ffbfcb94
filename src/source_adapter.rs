//! # Source Adapter Trait
//!
//! This module defines the abstraction every liquidity source implements to be
//! priced by the [`PricingAggregator`](crate::aggregator::PricingAggregator).
//!
//! ## Overview
//!
//! A source adapter wraps one AMM design (constant product, concentrated
//! liquidity, stable swap, ...) behind a uniform interface: initialize, name
//! the pools that can trade a pair, price a list of amounts, and report gas.
//! The aggregator never inspects source internals; it only applies timeouts,
//! capability filters and result validation around these calls.
//!
//! ## Adding a New Source
//!
//! 1. Implement `SourceAdapter` for your source
//! 2. Back its state with a [`StateSynchronizer`](crate::state::StateSynchronizer)
//!    and its pool list with a [`PoolCatalog`](crate::catalog::PoolCatalog) where applicable
//! 3. Register it in the [`AdapterRegistry`](crate::registry::AdapterRegistry)
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use dex_pricing_sdk::source_adapter::SourceAdapter;
//! use dex_pricing_sdk::types::{GasCost, PoolLiquidity, PoolPrices, QuoteRequest, SwapSide, Token};
//! use ethers::types::Address;
//!
//! struct FixedRate;
//!
//! #[async_trait]
//! impl SourceAdapter for FixedRate {
//!     fn key(&self) -> &str {
//!         "FixedRate"
//!     }
//!
//!     fn has_constant_price_large_amounts(&self) -> bool {
//!         true
//!     }
//!
//!     async fn initialize_pricing(&self, _block_number: u64) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn get_pool_identifiers(&self, _from: &Token, _to: &Token, _side: SwapSide, _block_number: u64) -> Result<Vec<String>> {
//!         Ok(vec!["FixedRate_main".to_string()])
//!     }
//!
//!     async fn get_prices_volume(&self, _request: &QuoteRequest, _limit_pools: Option<&[String]>) -> Result<Option<Vec<PoolPrices>>> {
//!         // One output per input, 1:1
//!         Ok(None)
//!     }
//!
//!     fn calldata_gas_cost(&self, _prices: &PoolPrices) -> GasCost {
//!         GasCost::Scalar(1_000)
//!     }
//!
//!     async fn get_top_pools_for_token(&self, _token: Address, _limit: usize) -> Result<Vec<PoolLiquidity>> {
//!         Ok(vec![])
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use ethers::types::Address;

use crate::types::{GasCost, PoolLiquidity, PoolPrices, QuoteRequest, SwapSide, Token};

/// The trait every pricing source implements.
///
/// # Thread Safety
///
/// Adapters must be `Send + Sync`: the aggregator queries all of them
/// concurrently and may query one adapter from several requests at once.
///
/// # Cancellation
///
/// Identification and pricing calls run under a timeout and are dropped when
/// it expires. Implementations must leave no partial state behind when a
/// future is dropped at an `.await` point.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Unique key of the source, used in pool identifiers, logs and metrics.
    fn key(&self) -> &str;

    /// True if the source quotes a constant rate regardless of size.
    ///
    /// Such sources are skipped when the caller filters constant-price pools.
    fn has_constant_price_large_amounts(&self) -> bool {
        false
    }

    /// True if the source can price tokens that charge a transfer fee.
    fn is_fee_on_transfer_supported(&self) -> bool {
        false
    }

    /// Cache-store key of state shared across processes, cleared before
    /// initialization when the aggregator is configured to do so.
    fn cache_state_key(&self) -> Option<String> {
        None
    }

    /// Prepares the source for pricing at `block_number`: discovers pools,
    /// builds initial state, starts background refresh.
    ///
    /// # Errors
    ///
    /// Any error leaves the source unavailable for quoting; the aggregator
    /// retries initialization on a fixed delay until it succeeds.
    async fn initialize_pricing(&self, block_number: u64) -> Result<()>;

    /// Identifiers of the pools able to trade `from` for `to`.
    ///
    /// Identifiers have the form `<key>_<pool address>`. An empty list means
    /// the source has nothing for this pair.
    async fn get_pool_identifiers(
        &self,
        from: &Token,
        to: &Token,
        side: SwapSide,
        block_number: u64,
    ) -> Result<Vec<String>>;

    /// Prices every amount of `request`.
    ///
    /// # Parameters
    ///
    /// - `request`: tokens, amounts, side, block and transfer fees
    /// - `limit_pools`: restrict pricing to these identifiers; `None` means any pool
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the source cannot price the request. Each returned
    /// [`PoolPrices`] must carry exactly one price per amount.
    async fn get_prices_volume(
        &self,
        request: &QuoteRequest,
        limit_pools: Option<&[String]>,
    ) -> Result<Option<Vec<PoolPrices>>>;

    /// Calldata size of executing `prices`, expressed in L1 gas units. Used
    /// to estimate the extra cost of posting calldata on L2s.
    fn calldata_gas_cost(&self, prices: &PoolPrices) -> GasCost;

    /// The `limit` most liquid pools containing `token`.
    async fn get_top_pools_for_token(&self, token: Address, limit: usize) -> Result<Vec<PoolLiquidity>>;

    /// Stops background tasks and drops subscriptions.
    async fn release_resources(&self) -> Result<()> {
        Ok(())
    }
}
