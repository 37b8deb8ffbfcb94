//! Value types shared by the state cache, the pool catalog and the aggregator.

pub mod pool;
pub mod quote;

pub use pool::{pool_identifier, PoolLiquidity};
pub use quote::{GasCost, PoolPrices, QuoteRequest, SwapSide, Token, TransferFees};
