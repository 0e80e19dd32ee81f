//! Price oracle and risk parameters, consumed read-only by the engine.

use std::collections::HashMap;

use alloy_primitives::U256;

use crate::error::Asset;

/// Risk parameters for one asset (all WAD-scaled ratios).
#[derive(Debug, Clone, Copy)]
pub struct RiskParams {
    /// Fraction of collateral value usable as borrow capacity
    pub collateral_factor: U256,
    /// Fraction of collateral value below which the position is
    /// liquidatable; at least the collateral factor
    pub liquidation_threshold: U256,
    /// Extra fraction of the repaid value a liquidator may seize
    pub liquidation_bonus: U256,
}

/// Asset prices and risk parameters, read-only.
///
/// Prices are WAD-scaled in a common reference unit; any asset the oracle
/// does not know yields `None` and aborts the calling operation.
pub trait PriceOracle {
    /// Price of one underlying unit of the asset.
    fn asset_price(&self, asset: Asset) -> Option<U256>;

    /// Risk parameters for the asset.
    fn risk_params(&self, asset: Asset) -> Option<RiskParams>;

    /// Maximum fraction of a borrower's debt liquidatable in one call
    /// (WAD-scaled).
    fn close_factor(&self) -> U256;
}

/// A fixed, table-driven oracle for tests and scenario runs.
#[derive(Debug, Clone)]
pub struct StaticOracle {
    prices: HashMap<Asset, U256>,
    risk: HashMap<Asset, RiskParams>,
    close_factor: U256,
}

impl StaticOracle {
    pub fn new(close_factor: U256) -> Self {
        Self {
            prices: HashMap::new(),
            risk: HashMap::new(),
            close_factor,
        }
    }

    /// Sets the price for an asset.
    pub fn set_price(&mut self, asset: Asset, price: U256) {
        self.prices.insert(asset, price);
    }

    /// Sets the risk parameters for an asset.
    pub fn set_risk_params(&mut self, asset: Asset, params: RiskParams) {
        self.risk.insert(asset, params);
    }
}

impl PriceOracle for StaticOracle {
    fn asset_price(&self, asset: Asset) -> Option<U256> {
        self.prices.get(&asset).copied()
    }

    fn risk_params(&self, asset: Asset) -> Option<RiskParams> {
        self.risk.get(&asset).copied()
    }

    fn close_factor(&self) -> U256 {
        self.close_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::WAD;
    use alloy_primitives::Address;

    #[test]
    fn test_static_oracle_lookups() {
        let asset = Address::repeat_byte(1);
        let mut oracle = StaticOracle::new(WAD / U256::from(2));
        oracle.set_price(asset, WAD);
        oracle.set_risk_params(
            asset,
            RiskParams {
                collateral_factor: U256::from(800_000_000_000_000_000u64),
                liquidation_threshold: U256::from(850_000_000_000_000_000u64),
                liquidation_bonus: U256::from(80_000_000_000_000_000u64),
            },
        );

        assert_eq!(oracle.asset_price(asset), Some(WAD));
        assert!(oracle.risk_params(asset).is_some());
        assert_eq!(oracle.asset_price(Address::repeat_byte(2)), None);
        assert_eq!(oracle.close_factor(), WAD / U256::from(2));
    }
}
