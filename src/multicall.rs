use crate::chain::ChainClient;
use crate::metrics;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::types::{Address, Bytes, U256};
use log::{debug, warn};
use std::sync::Arc;

/// A single contract call to be batched in a multicall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
}

/// Outcome of one batched call. Failed calls keep their revert data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub success: bool,
    pub return_data: Bytes,
}

impl CallResult {
    /// First word of the return data as an unsigned integer, if the call succeeded.
    pub fn as_uint(&self) -> Option<U256> {
        if !self.success {
            return None;
        }
        decode_uint(&self.return_data)
    }
}

pub fn decode_uint(data: &[u8]) -> Option<U256> {
    if data.len() < 32 {
        return None;
    }
    Some(U256::from_big_endian(&data[..32]))
}

/// Tolerant batch execution: individual call failures are reported per call
/// and never fail the batch.
#[async_trait]
pub trait MultiCaller: Send + Sync {
    async fn try_aggregate(&self, calls: Vec<Call>, block: Option<u64>) -> Result<Vec<CallResult>>;
}

/// Multicall3 `aggregate3` executor with `allowFailure` set on every call.
///
/// Identical calls are coalesced before encoding and results are fanned back
/// out in request order. Calls are chunked to `batch_size` per request.
#[derive(Clone)]
pub struct Multicall {
    chain: Arc<dyn ChainClient>,
    multicall_address: Address,
    batch_size: usize,
}

impl Multicall {
    pub fn new(chain: Arc<dyn ChainClient>, multicall_address: Address, batch_size: usize) -> Self {
        Self {
            chain,
            multicall_address,
            batch_size: batch_size.max(1),
        }
    }

    async fn execute_chunk(&self, calls: &[Call], block: Option<u64>) -> Result<Vec<CallResult>> {
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let calldata = aggregate3_function().encode_input(&[Token::Array(call_tokens)])?;
        let response = self
            .chain
            .call(self.multicall_address, calldata.into(), block)
            .await?;

        let results = decode_aggregate3_output(&response)?;
        if results.len() != calls.len() {
            return Err(anyhow!(
                "Multicall returned {} results for {} calls",
                results.len(),
                calls.len()
            ));
        }
        Ok(results)
    }
}

#[async_trait]
impl MultiCaller for Multicall {
    async fn try_aggregate(&self, calls: Vec<Call>, block: Option<u64>) -> Result<Vec<CallResult>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let mut unique_calls = indexmap::IndexSet::new();
        let original_indices: Vec<usize> = calls
            .iter()
            .map(|call| unique_calls.insert_full(call.clone()).0)
            .collect();
        let unique_calls: Vec<Call> = unique_calls.into_iter().collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_calls.len()
        );

        let mut unique_results = Vec::with_capacity(unique_calls.len());
        for chunk in unique_calls.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(chunk.len());
            unique_results.extend(self.execute_chunk(chunk, block).await?);
        }

        let failed = unique_results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!("Multicall: {} of {} calls failed", failed, unique_results.len());
            metrics::increment_multicall_failed_calls(failed as u64);
        }

        Ok(original_indices
            .into_iter()
            .map(|index| unique_results[index].clone())
            .collect())
    }
}

fn call3_results_type() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes])))
}

/// `aggregate3((address target, bool allowFailure, bytes callData)[]) returns ((bool success, bytes returnData)[])`
#[allow(deprecated)]
pub(crate) fn aggregate3_function() -> Function {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: call3_results_type(),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

fn decode_aggregate3_output(response: &[u8]) -> Result<Vec<CallResult>> {
    let decoded = ethers::abi::decode(&[call3_results_type()], response)?;
    let results = decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_array())
        .ok_or_else(|| anyhow!("Invalid multicall response format"))?;

    results
        .into_iter()
        .map(|token| match token {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Bool(success), Token::Bytes(data)] => Ok(CallResult {
                    success: *success,
                    return_data: Bytes::from(data.clone()),
                }),
                _ => Err(anyhow!("Invalid multicall result tuple")),
            },
            _ => Err(anyhow!("Invalid multicall result entry")),
        })
        .collect()
}
