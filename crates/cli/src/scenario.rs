//! Scenario file format: listed assets, risk parameters and an action
//! sequence, all in one JSON document.
//!
//! Participants and assets are referred to by name; addresses are derived
//! deterministically from the name so scenario files stay readable.
//! Fractions (rates, factors) are plain JSON numbers; amounts are decimal
//! strings of raw underlying units so they stay exact.

use std::collections::HashSet;
use std::path::Path;

use alloy_primitives::{keccak256, Address, U256};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Maximum fraction of a borrower's debt liquidatable per call
    #[serde(default = "default_close_factor")]
    pub close_factor: f64,
    pub assets: Vec<AssetConfig>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetConfig {
    pub symbol: String,
    /// Pool supply rate per block, as a fraction (e.g. 1e-6)
    #[serde(default)]
    pub supply_rate_per_block: f64,
    /// Pool borrow rate per block, as a fraction
    #[serde(default)]
    pub borrow_rate_per_block: f64,
    /// Third-party cash seeded into the pool (scaled-balance flavor only)
    #[serde(default = "default_zero_amount")]
    pub pool_liquidity: String,
    /// Oracle price in reference units
    #[serde(default = "default_price")]
    pub price: f64,
    #[serde(default = "default_collateral_factor")]
    pub collateral_factor: f64,
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: f64,
    #[serde(default = "default_liquidation_bonus")]
    pub liquidation_bonus: f64,
    #[serde(default)]
    pub market: MarketConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MarketConfig {
    pub max_iterations: u32,
    pub fee_rate: f64,
    pub p2p_cursor: f64,
    pub dust: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            fee_rate: 0.0,
            p2p_cursor: 0.5,
            dust: default_zero_amount(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Action {
    Supply {
        user: String,
        asset: String,
        amount: String,
    },
    Borrow {
        user: String,
        asset: String,
        amount: String,
    },
    Withdraw {
        user: String,
        asset: String,
        amount: String,
    },
    Repay {
        user: String,
        asset: String,
        amount: String,
    },
    Liquidate {
        liquidator: String,
        borrower: String,
        borrowed: String,
        collateral: String,
        amount: String,
    },
    /// Advance the pool and the block clock
    Advance { blocks: u64 },
    /// Accrue a market and re-derive its growth rates from the pool
    Refresh { asset: String },
    /// Reprice an asset on the oracle
    SetPrice { asset: String, price: f64 },
}

impl Action {
    /// Asset symbols this action refers to.
    pub fn asset_symbols(&self) -> Vec<&str> {
        match self {
            Action::Supply { asset, .. }
            | Action::Borrow { asset, .. }
            | Action::Withdraw { asset, .. }
            | Action::Repay { asset, .. }
            | Action::Refresh { asset }
            | Action::SetPrice { asset, .. } => vec![asset],
            Action::Liquidate {
                borrowed,
                collateral,
                ..
            } => vec![borrowed, collateral],
            Action::Advance { .. } => Vec::new(),
        }
    }

    /// The amount operand, if the action carries one.
    pub fn amount(&self) -> Option<&str> {
        match self {
            Action::Supply { amount, .. }
            | Action::Borrow { amount, .. }
            | Action::Withdraw { amount, .. }
            | Action::Repay { amount, .. }
            | Action::Liquidate { amount, .. } => Some(amount),
            _ => None,
        }
    }

    /// One-line description for the action log.
    pub fn describe(&self) -> String {
        match self {
            Action::Supply { user, asset, amount } => format!("supply {amount} {asset} for {user}"),
            Action::Borrow { user, asset, amount } => format!("borrow {amount} {asset} for {user}"),
            Action::Withdraw { user, asset, amount } => {
                format!("withdraw {amount} {asset} for {user}")
            }
            Action::Repay { user, asset, amount } => format!("repay {amount} {asset} for {user}"),
            Action::Liquidate {
                liquidator,
                borrower,
                borrowed,
                collateral,
                amount,
            } => format!(
                "liquidate {borrower}: {liquidator} repays {amount} {borrowed}, seizes {collateral}"
            ),
            Action::Advance { blocks } => format!("advance {blocks} blocks"),
            Action::Refresh { asset } => format!("refresh rates for {asset}"),
            Action::SetPrice { asset, price } => format!("set price of {asset} to {price}"),
        }
    }
}

impl Scenario {
    /// Loads and validates a scenario file.
    pub fn load(path: &Path) -> Result<Scenario> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario file {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&raw).context("parsing scenario file")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Checks internal consistency without executing anything.
    pub fn validate(&self) -> Result<()> {
        ratio_to_wad(self.close_factor).context("close_factor")?;
        if self.assets.is_empty() {
            bail!("scenario lists no assets");
        }

        let mut symbols: HashSet<&str> = HashSet::new();
        for asset in &self.assets {
            if !symbols.insert(&asset.symbol) {
                bail!("duplicate asset symbol {:?}", asset.symbol);
            }
            rate_to_ray(asset.supply_rate_per_block)
                .with_context(|| format!("supply_rate_per_block of {}", asset.symbol))?;
            rate_to_ray(asset.borrow_rate_per_block)
                .with_context(|| format!("borrow_rate_per_block of {}", asset.symbol))?;
            price_to_wad(asset.price).with_context(|| format!("price of {}", asset.symbol))?;
            ratio_to_wad(asset.collateral_factor)
                .with_context(|| format!("collateral_factor of {}", asset.symbol))?;
            ratio_to_wad(asset.liquidation_threshold)
                .with_context(|| format!("liquidation_threshold of {}", asset.symbol))?;
            ratio_to_wad(asset.liquidation_bonus)
                .with_context(|| format!("liquidation_bonus of {}", asset.symbol))?;
            ratio_to_wad(asset.market.fee_rate)
                .with_context(|| format!("market fee_rate of {}", asset.symbol))?;
            ratio_to_wad(asset.market.p2p_cursor)
                .with_context(|| format!("market p2p_cursor of {}", asset.symbol))?;
            parse_amount(&asset.pool_liquidity)
                .with_context(|| format!("pool_liquidity of {}", asset.symbol))?;
            parse_amount(&asset.market.dust)
                .with_context(|| format!("market dust of {}", asset.symbol))?;
        }

        for (index, action) in self.actions.iter().enumerate() {
            for symbol in action.asset_symbols() {
                if !symbols.contains(symbol) {
                    bail!("action #{index} refers to unknown asset {symbol:?}");
                }
            }
            if let Some(amount) = action.amount() {
                parse_amount(amount).with_context(|| format!("amount in action #{index}"))?;
            }
        }
        Ok(())
    }
}

/// Deterministic address for a scenario name.
pub fn name_to_address(name: &str) -> Address {
    Address::from_slice(&keccak256(name.as_bytes())[12..])
}

/// WAD-scaled ratio from a plain fraction in [0, 1].
pub fn ratio_to_wad(value: f64) -> Result<U256> {
    if !(0.0..=1.0).contains(&value) {
        bail!("ratio {value} must be between 0 and 1");
    }
    Ok(U256::from((value * 1e18) as u128))
}

/// RAY-scaled per-block rate from a plain fraction in [0, 1].
pub fn rate_to_ray(value: f64) -> Result<U256> {
    if !(0.0..=1.0).contains(&value) {
        bail!("per-block rate {value} must be between 0 and 1");
    }
    Ok(U256::from((value * 1e27) as u128))
}

/// WAD-scaled price from a non-negative multiplier.
pub fn price_to_wad(value: f64) -> Result<U256> {
    if !value.is_finite() || value < 0.0 {
        bail!("price {value} must be a non-negative number");
    }
    Ok(U256::from((value * 1e18) as u128))
}

/// Exact decimal amount of raw underlying units.
pub fn parse_amount(value: &str) -> Result<U256> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid amount {value:?}"))
}

fn default_close_factor() -> f64 {
    0.5
}

fn default_zero_amount() -> String {
    "0".to_string()
}

fn default_price() -> f64 {
    1.0
}

fn default_collateral_factor() -> f64 {
    0.8
}

fn default_liquidation_threshold() -> f64 {
    0.85
}

fn default_liquidation_bonus() -> f64 {
    0.05
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_scenario(actions: &str) -> String {
        format!(
            r#"{{
                "assets": [{{"symbol": "DAI"}}],
                "actions": {actions}
            }}"#
        )
    }

    #[test]
    fn test_parse_minimal() {
        let raw = minimal_scenario(r#"[{"op": "supply", "user": "alice", "asset": "DAI", "amount": "100"}]"#);
        let scenario: Scenario = serde_json::from_str(&raw).unwrap();
        scenario.validate().unwrap();
        assert_eq!(scenario.assets.len(), 1);
        assert_eq!(scenario.close_factor, 0.5);
    }

    #[test]
    fn test_unknown_asset_rejected() {
        let raw = minimal_scenario(r#"[{"op": "supply", "user": "alice", "asset": "ETH", "amount": "1"}]"#);
        let scenario: Scenario = serde_json::from_str(&raw).unwrap();
        let err = scenario.validate().unwrap_err().to_string();
        assert!(err.contains("unknown asset"));
    }

    #[test]
    fn test_bad_amount_rejected() {
        let raw = minimal_scenario(r#"[{"op": "supply", "user": "alice", "asset": "DAI", "amount": "12x"}]"#);
        let scenario: Scenario = serde_json::from_str(&raw).unwrap();
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let raw = r#"{
            "assets": [{"symbol": "DAI"}, {"symbol": "DAI"}],
            "actions": []
        }"#;
        let scenario: Scenario = serde_json::from_str(raw).unwrap();
        let err = scenario.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_name_addresses_are_stable_and_distinct() {
        assert_eq!(name_to_address("alice"), name_to_address("alice"));
        assert_ne!(name_to_address("alice"), name_to_address("bob"));
    }

    #[test]
    fn test_ratio_bounds() {
        assert!(ratio_to_wad(0.8).is_ok());
        assert!(ratio_to_wad(1.2).is_err());
        assert!(ratio_to_wad(-0.1).is_err());
    }
}
