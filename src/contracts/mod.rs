// Contracts Module - ABI bindings used for calldata encoding

pub mod erc20;
pub mod reserve_pool;

pub use erc20::{BalanceOfCall, Erc20};
pub use reserve_pool::{GetReservesCall, IReservePool, SYNC_EVENT};
