//! # DEX Pricing SDK
//!
//! Concurrent price aggregation over heterogeneous AMM liquidity sources,
//! backed by an event-sourced cache of on-chain pool state.
//!
//! ## Overview
//!
//! - **State**: every tracked contract keeps block-indexed immutable
//!   snapshots, advanced by folding its logs in `(block, log index)` order and
//!   rolled back on chain reorganizations
//! - **Catalog**: pools are discovered from an external indexer, extended by
//!   factory events and ranked by on-chain TVL
//! - **Aggregation**: quotes fan out to every source under per-call timeouts;
//!   slow, failing or malformed sources only lose their own contribution
//!
//! ## Architecture
//!
//! ### Chain Layer
//! [`chain::ChainClient`] abstracts reads (headers, calls, logs);
//! [`multicall::Multicall`] batches calls through Multicall3 `aggregate3`.
//!
//! ### State Layer
//! [`state::StateSynchronizer`] owns the snapshot history of one contract and
//! [`state::BlockLogDispatcher`] feeds it per-block logs, detecting reorgs
//! from parent hashes.
//!
//! ### Source Layer
//! [`source_adapter::SourceAdapter`] is the pricing contract every source
//! implements; [`sources::ReservePoolSource`] is a constant-product source
//! built on a [`catalog::PoolCatalog`].
//!
//! ### Aggregation Layer
//! [`aggregator::PricingAggregator`] initializes sources, queries them
//! concurrently and validates their answers.

// Core Types
/// Quotes, pool results and identifiers
pub mod types;

// Infrastructure
/// Key/value cache with TTL (in-memory or Redis)
pub mod cache_store;
/// Chain read boundary
pub mod chain;
/// Contract ABI bindings
pub mod contracts;
/// Tolerant batched calls
pub mod multicall;
/// USD valuation of token amounts
pub mod price_oracle;

// State Layer
/// Event-sourced contract state
pub mod state;

// Sources
/// Indexer-backed pool discovery and TVL eligibility
pub mod catalog;
/// Trait every pricing source implements
pub mod source_adapter;
/// Registered sources by key
pub mod registry;
/// Concrete sources
pub mod sources;

// Aggregation
/// Concurrent fan-out, validation and initialization of sources
pub mod aggregator;

// Utilities
/// Configuration management
pub mod settings;
/// Metrics collection
pub mod metrics;

pub use aggregator::{AggregatorConfig, PoolIdentifierMap, PricingAggregator, QueryOptions};
pub use registry::AdapterRegistry;
pub use source_adapter::SourceAdapter;
pub use types::{GasCost, PoolLiquidity, PoolPrices, QuoteRequest, SwapSide, Token, TransferFees};
