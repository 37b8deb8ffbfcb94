use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};

/// Block an indexer query is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl BlockTag {
    pub fn label(&self) -> &'static str {
        match self {
            BlockTag::Number(_) => "pinned",
            BlockTag::Latest => "latest",
        }
    }
}

/// A pool record as reported by an external indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub deployer: Option<Address>,
    pub fee: Option<u32>,
    /// Indexer-reported TVL; replaced by on-chain balances at the first eligibility refresh.
    pub tvl_usd: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// The indexer has not synced the requested block yet.
    #[error("indexer data for block is unavailable: {0}")]
    BlockUnavailable(String),
    #[error("indexer request timed out")]
    Timeout,
    #[error("indexer transport error: {0}")]
    Transport(String),
    #[error("indexer returned HTTP {0}")]
    Status(u16),
    #[error("indexer query failed: {0}")]
    Query(String),
    #[error("malformed indexer response: {0}")]
    Malformed(String),
}

impl IndexerError {
    /// Errors worth retrying with the same query.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexerError::Timeout | IndexerError::Transport(_) => true,
            IndexerError::Status(code) => *code == 429 || *code >= 500,
            IndexerError::BlockUnavailable(_) | IndexerError::Query(_) | IndexerError::Malformed(_) => false,
        }
    }

    /// Classifies an error message returned in a GraphQL `errors` array.
    pub fn from_query_message(message: &str) -> Self {
        if message.contains("missing block") || message.contains("not yet available") {
            IndexerError::BlockUnavailable(message.to_string())
        } else {
            IndexerError::Query(message.to_string())
        }
    }
}

/// Paged pool enumeration from an external indexer.
#[async_trait]
pub trait PoolIndexer: Send + Sync {
    /// Up to `limit` pools starting at offset `skip`, as of `block`.
    async fn query_pools(&self, skip: usize, limit: usize, block: BlockTag) -> Result<Vec<PoolRecord>, IndexerError>;
}
