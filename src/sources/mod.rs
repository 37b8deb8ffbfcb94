// Sources Module - concrete pricing sources

pub mod reserve_pools;

pub use reserve_pools::{ReservePoolConfig, ReservePoolEvents, ReservePoolSource, ReserveState};
