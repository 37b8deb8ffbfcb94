//! Read-only chain access used by state reconstruction, log replay, reorg
//! detection and multicalls.
//!
//! Everything above this module talks to [`ChainClient`] rather than to an
//! ethers `Middleware`, so tests can script block hashes and logs directly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;

/// The parts of a block header needed to follow the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// Header of the canonical block at `number`, or `None` if the node does not have it yet.
    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>>;

    /// `eth_call` against `to`, at `block` or at the latest block.
    async fn call(&self, to: Address, data: Bytes, block: Option<u64>) -> Result<Bytes>;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>>;
}

/// [`ChainClient`] over any ethers middleware (HTTP, WS, IPC).
pub struct EthersChainClient<M: Middleware> {
    provider: Arc<M>,
}

impl<M: Middleware> EthersChainClient<M> {
    pub fn new(provider: Arc<M>) -> Self {
        Self { provider }
    }
}

impl EthersChainClient<Provider<Http>> {
    pub fn from_http_url(url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| anyhow!("Invalid RPC url {}: {}", url, e))?;
        Ok(Self::new(Arc::new(provider)))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersChainClient<M> {
    async fn block_number(&self) -> Result<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| anyhow!("eth_blockNumber failed: {}", e))?;
        Ok(number.as_u64())
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>> {
        let block = self
            .provider
            .get_block(number)
            .await
            .map_err(|e| anyhow!("eth_getBlockByNumber({}) failed: {}", number, e))?;
        Ok(block.and_then(|block| {
            block.hash.map(|hash| BlockHeader {
                number,
                hash,
                parent_hash: block.parent_hash,
            })
        }))
    }

    async fn call(&self, to: Address, data: Bytes, block: Option<u64>) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let block_id = block.map(|number| BlockId::Number(BlockNumber::Number(number.into())));
        self.provider
            .call(&tx, block_id)
            .await
            .map_err(|e| anyhow!("eth_call to {:?} failed: {}", to, e))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| anyhow!("eth_getLogs failed: {}", e))
    }
}
