// src/price_oracle.rs

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use log::debug;
use serde::{Deserialize, Serialize};

/// USD valuation of raw token amounts, used to rank pools by liquidity.
#[async_trait]
pub trait UsdPriceOracle: Send + Sync {
    /// One USD value per `(token, raw amount)` pair, same order. Tokens the
    /// oracle cannot price are valued at zero.
    async fn usd_values(&self, amounts: &[(Address, U256)]) -> Result<Vec<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenQuote {
    pub usd_price: f64,
    pub decimals: u8,
}

/// Oracle over a fixed price table, loaded from configuration and updatable
/// at runtime.
#[derive(Debug, Default)]
pub struct StaticPriceOracle {
    quotes: DashMap<Address, TokenQuote>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_quotes(quotes: impl IntoIterator<Item = (Address, TokenQuote)>) -> Self {
        let oracle = Self::new();
        for (token, quote) in quotes {
            oracle.set_quote(token, quote);
        }
        oracle
    }

    pub fn set_quote(&self, token: Address, quote: TokenQuote) {
        self.quotes.insert(token, quote);
    }

    pub fn quote(&self, token: &Address) -> Option<TokenQuote> {
        self.quotes.get(token).map(|q| *q)
    }
}

#[async_trait]
impl UsdPriceOracle for StaticPriceOracle {
    async fn usd_values(&self, amounts: &[(Address, U256)]) -> Result<Vec<f64>> {
        Ok(amounts
            .iter()
            .map(|(token, amount)| match self.quote(token) {
                Some(quote) => to_units(*amount, quote.decimals) * quote.usd_price,
                None => {
                    debug!("No USD price for {:?}, valuing at zero", token);
                    0.0
                }
            })
            .collect())
    }
}

/// Converts a raw integer amount into whole token units.
pub fn to_units(amount: U256, decimals: u8) -> f64 {
    let raw = amount
        .0
        .iter()
        .rev()
        .fold(0f64, |acc, limb| acc * 18_446_744_073_709_551_616f64 + *limb as f64);
    raw / 10f64.powi(decimals as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_raw_amounts_to_units() {
        assert_eq!(to_units(U256::from(1_500_000u64), 6), 1.5);
        assert_eq!(to_units(U256::exp10(18) * 3, 18), 3.0);
        assert_eq!(to_units(U256::zero(), 18), 0.0);
    }

    #[tokio::test]
    async fn unknown_tokens_are_worth_zero() {
        let usdc = Address::repeat_byte(1);
        let oracle = StaticPriceOracle::from_quotes([(
            usdc,
            TokenQuote {
                usd_price: 1.0,
                decimals: 6,
            },
        )]);

        let values = oracle
            .usd_values(&[
                (usdc, U256::from(25_000_000_000u64)),
                (Address::repeat_byte(2), U256::exp10(30)),
            ])
            .await
            .unwrap();
        assert_eq!(values, vec![25_000.0, 0.0]);
    }
}
