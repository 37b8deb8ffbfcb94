use ethers::types::Address;
use serde::{Deserialize, Serialize};

/// Builds the identifier a source reports for one of its pools: `<source>_<address>`.
///
/// Addresses are rendered as full lowercase hex so identifiers survive a
/// round-trip through caches and allow-lists unchanged.
pub fn pool_identifier(source_key: &str, address: Address) -> String {
    format!("{}_{:?}", source_key, address)
}

/// A pool ranked by USD liquidity, as returned by top-pools queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolLiquidity {
    pub exchange: String,
    pub address: Address,
    /// Tokens reachable from the queried token through this pool.
    pub connector_tokens: Vec<Address>,
    pub liquidity_usd: f64,
}
