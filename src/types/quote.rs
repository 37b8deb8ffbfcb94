use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwapSide {
    /// Amounts are inputs; prices are outputs.
    Sell,
    /// Amounts are desired outputs; prices are required inputs.
    Buy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub fn new(address: Address, decimals: u8) -> Self {
        Self { address, decimals }
    }
}

/// Transfer taxes (in basis points) charged by the tokens of a quote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFees {
    pub src_fee: u32,
    pub dest_fee: u32,
    pub src_dex_fee: u32,
    pub dest_dex_fee: u32,
}

impl TransferFees {
    /// True when the source token loses value on transfer, which only
    /// fee-on-transfer capable sources can price correctly.
    pub fn src_fee_to_be_exchanged(&self) -> bool {
        self.src_fee != 0 || self.src_dex_fee != 0
    }
}

/// Gas estimate reported by a source: one value for every amount, or one per amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GasCost {
    Scalar(u64),
    PerAmount(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRequest {
    pub from: Token,
    pub to: Token,
    pub amounts: Vec<U256>,
    pub side: SwapSide,
    pub block_number: u64,
    pub transfer_fees: TransferFees,
}

impl QuoteRequest {
    pub fn new(from: Token, to: Token, amounts: Vec<U256>, side: SwapSide, block_number: u64) -> Self {
        Self {
            from,
            to,
            amounts,
            side,
            block_number,
            transfer_fees: TransferFees::default(),
        }
    }

    pub fn with_transfer_fees(mut self, transfer_fees: TransferFees) -> Self {
        self.transfer_fees = transfer_fees;
        self
    }
}

/// One source's answer for one pool (or route) across all requested amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolPrices {
    pub exchange: String,
    /// One price per requested amount, same order.
    pub prices: Vec<U256>,
    /// Price of one whole unit of the quoted token.
    pub unit: U256,
    pub gas_cost: GasCost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_cost_l2: Option<GasCost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calldata_gas_cost: Option<GasCost>,
    pub pool_identifiers: Vec<String>,
    pub pool_addresses: Vec<Address>,
    /// Opaque per-source data consumed when the route is executed.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PoolPrices {
    pub fn has_non_zero_price(&self) -> bool {
        self.prices.iter().any(|price| !price.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_on_transfer_detection() {
        assert!(!TransferFees::default().src_fee_to_be_exchanged());
        let fees = TransferFees {
            src_dex_fee: 100,
            ..Default::default()
        };
        assert!(fees.src_fee_to_be_exchanged());
        let dest_only = TransferFees {
            dest_fee: 100,
            ..Default::default()
        };
        assert!(!dest_only.src_fee_to_be_exchanged());
    }

    #[test]
    fn gas_cost_serializes_untagged() {
        let scalar = serde_json::to_string(&GasCost::Scalar(21_000)).unwrap();
        assert_eq!(scalar, "21000");
        let per_amount: GasCost = serde_json::from_str("[0, 90000]").unwrap();
        assert_eq!(per_amount, GasCost::PerAmount(vec![0, 90_000]));
    }
}
