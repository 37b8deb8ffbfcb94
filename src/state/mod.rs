//! # Event-Sourced State Cache
//!
//! Keeps a per-block history of immutable state snapshots for each tracked
//! contract and advances it by folding decoded logs, so that pricing never has
//! to re-read full on-chain state on every block.
//!
//! ## Pieces
//!
//! - [`EventDecoder`]: maps a log's first topic to an ABI event, decodes it and
//!   dispatches to a pure handler `(state, event, log) -> state`.
//! - [`EventSource`]: what a tracked contract provides: its address and
//!   topics, its decoder, and full reconstruction at an arbitrary block.
//! - [`StateSynchronizer`]: owns the snapshot history of one contract and
//!   implements cold start, log folding, reorg rollback and replay.
//! - [`BlockLogDispatcher`]: follows the canonical chain, fetches logs once for
//!   all subscribers and routes them by address, detecting reorgs from block
//!   hashes.
//!
//! ## Guarantees
//!
//! For any block `N`, folding every log after a snapshot at `M < N` yields the
//! same state as reconstructing at `N`. Logs are applied in `(block, log index)`
//! order and at most once; logs at or before the synchronizer's cursor are
//! ignored.

pub mod decoder;
pub mod dispatcher;
pub mod synchronizer;

pub use decoder::{DecodedEvent, EventDecoder};
pub use dispatcher::{BlockLogDispatcher, DispatchReport};
pub use synchronizer::{StateSynchronizer, SyncConfig};

use async_trait::async_trait;
use ethers::types::{Address, Log, H256};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("log is missing its block number or log index")]
    MissingPosition,
    #[error("failed to decode {event} log: {reason}")]
    Decode { event: String, reason: String },
    #[error("event {event} has no parameter {param} of the expected type")]
    MissingParam { event: String, param: String },
    #[error("handler for {event} rejected the log: {reason}")]
    Handler { event: String, reason: String },
    #[error("state reconstruction for {address:?} at block {block} failed: {reason}")]
    Reconstruction {
        address: Address,
        block: u64,
        reason: String,
    },
    #[error("no state for {0:?}: contract has not been initialized")]
    NotInitialized(Address),
}

/// A contract whose state is followed through its logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContract {
    pub address: Address,
    /// Event topics (first topic) the contract's state depends on.
    pub topics: Vec<H256>,
    /// Owning source, used for log and metric labels.
    pub source_key: String,
}

impl TrackedContract {
    pub fn new(address: Address, topics: impl IntoIterator<Item = H256>, source_key: impl Into<String>) -> Self {
        let mut topics: Vec<H256> = topics.into_iter().collect();
        topics.sort();
        topics.dedup();
        Self {
            address,
            topics,
            source_key: source_key.into(),
        }
    }

    pub fn tracks(&self, log: &Log) -> bool {
        log.address == self.address
            && log
                .topics
                .first()
                .map_or(false, |topic| self.topics.binary_search(topic).is_ok())
    }
}

/// Position up to which a synchronizer's state is known good.
///
/// `log_index == None` means every log of `block_number` has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCursor {
    pub block_number: u64,
    pub log_index: Option<u64>,
}

impl BlockCursor {
    pub fn at_block(block_number: u64) -> Self {
        Self {
            block_number,
            log_index: None,
        }
    }

    pub fn at_log(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index: Some(log_index),
        }
    }

    /// True if a log at this position has not been applied yet.
    pub fn admits(&self, block_number: u64, log_index: u64) -> bool {
        match block_number.cmp(&self.block_number) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.log_index.map_or(false, |applied| log_index > applied),
        }
    }

    /// True if the state at `block_number` is fully known.
    pub fn covers(&self, block_number: u64) -> bool {
        block_number < self.block_number
            || (block_number == self.block_number && self.log_index.is_none())
    }
}

/// `(block number, log index)` of a log, the order in which logs are applied.
pub fn log_position(log: &Log) -> Result<(u64, u64), SyncError> {
    let block = log.block_number.ok_or(SyncError::MissingPosition)?;
    let index = log.log_index.ok_or(SyncError::MissingPosition)?;
    Ok((block.as_u64(), index.as_u64()))
}

/// Sorts logs into application order, dropping logs without a position.
pub fn sort_logs(logs: &mut Vec<Log>) {
    logs.retain(|log| log_position(log).is_ok());
    logs.sort_by_key(|log| log_position(log).unwrap_or((0, 0)));
}

/// A tracked contract with event-sourced state.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    type State: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn contract(&self) -> &TrackedContract;

    fn decoder(&self) -> &EventDecoder<Self::State>;

    /// Full reconstruction of the state as of the end of `block_number`.
    async fn generate_state(&self, block_number: u64) -> anyhow::Result<Self::State>;
}

/// Receiver of per-block logs from the [`BlockLogDispatcher`].
#[async_trait]
pub trait LogSubscriber: Send + Sync {
    fn contract(&self) -> &TrackedContract;

    async fn is_initialized(&self) -> bool;

    async fn initialize(&self, block_number: u64) -> anyhow::Result<()>;

    /// Every log of `block_number` emitted by the contract, in log-index order.
    /// Called for every block the dispatcher processes, with an empty slice
    /// when the contract emitted nothing.
    async fn on_block_logs(&self, block_number: u64, logs: &[Log]) -> anyhow::Result<()>;

    /// Drops everything above `common_ancestor`. Returns the number of
    /// snapshots discarded.
    async fn on_reorg(&self, common_ancestor: u64) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_admits_only_later_positions() {
        let partial = BlockCursor::at_log(10, 3);
        assert!(!partial.admits(9, 100));
        assert!(!partial.admits(10, 3));
        assert!(partial.admits(10, 4));
        assert!(partial.admits(11, 0));
        assert!(!partial.covers(10));
        assert!(partial.covers(9));

        let full = BlockCursor::at_block(10);
        assert!(!full.admits(10, 99));
        assert!(full.admits(11, 0));
        assert!(full.covers(10));
        assert!(!full.covers(11));
    }

    #[test]
    fn tracked_contract_matches_address_and_topic() {
        let address = Address::repeat_byte(7);
        let topic = H256::repeat_byte(1);
        let contract = TrackedContract::new(address, [topic, topic], "test");
        assert_eq!(contract.topics.len(), 1);

        let mut log = Log {
            address,
            topics: vec![topic],
            ..Default::default()
        };
        assert!(contract.tracks(&log));
        log.topics = vec![H256::repeat_byte(2)];
        assert!(!contract.tracks(&log));
        log.topics.clear();
        assert!(!contract.tracks(&log));
    }
}
