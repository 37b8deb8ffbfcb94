use ethers::prelude::*;

// Constant-product pair interface. `Sync` carries the full post-update
// reserves, so folding it reproduces `getReserves()` exactly.

abigen!(
    IReservePool,
    r#"[
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)
        function token0() external view returns (address)
        function token1() external view returns (address)
    ]"#,
);

/// Reserve update event, with parameter names the state handlers look up.
pub const SYNC_EVENT: &str = "event Sync(uint112 reserve0, uint112 reserve1)";
