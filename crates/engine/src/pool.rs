//! The pool gateway: the external pooled lending protocol the overlay
//! falls back to.
//!
//! The engine only ever talks to the pool through the [`PoolGateway`]
//! capability trait. Two in-memory implementations are provided, modeling
//! the two unit systems found in production pools: [`ExchangeRatePool`]
//! mints units at a floating exchange rate captured per interaction, and
//! [`ScaledBalancePool`] keeps scaled balances under monotone
//! liquidity/debt indexes and enforces a cash constraint. Both advance
//! deterministically by block for tests and the scenario runner.

use std::collections::HashMap;

use alloy_primitives::U256;
use thiserror::Error;

use crate::error::Asset;
use crate::math::{mul_div, Rounding, RAY};

/// Errors surfaced by a pool gateway.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The asset is not listed on the pool
    #[error("asset {0} is not listed on the pool")]
    UnknownAsset(Asset),

    /// The protocol's pool deposit cannot cover the withdrawal
    #[error("pool balance {available} cannot cover withdrawal of {requested}")]
    InsufficientBalance { requested: U256, available: U256 },

    /// The pool has too little free liquidity for the borrow
    #[error("pool liquidity {available} cannot cover borrow of {requested}")]
    InsufficientLiquidity { requested: U256, available: U256 },

    /// Arithmetic overflow in pool accounting
    #[error("arithmetic overflow in pool accounting")]
    Arithmetic,
}

/// The pool's supply/borrow primitives and rate queries, as consumed by the
/// matching engine.
///
/// All amounts are underlying; the unit-denominated return values use the
/// pool's own floating exchange rate, read fresh at each call.
pub trait PoolGateway {
    /// Deposits `amount` underlying; returns the pool units minted.
    fn supply(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError>;

    /// Withdraws `amount` underlying; returns the pool units burned.
    fn withdraw(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError>;

    /// Borrows `amount` underlying; returns the debt units minted.
    fn borrow(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError>;

    /// Repays `amount` underlying of debt; returns the debt units burned.
    fn repay(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError>;

    /// The protocol's deposit balance, in pool units.
    fn supply_balance(&self, asset: Asset) -> Result<U256, PoolError>;

    /// The protocol's debt balance, in pool debt units.
    fn borrow_balance(&self, asset: Asset) -> Result<U256, PoolError>;

    /// Underlying value of one pool supply unit (RAY-scaled).
    fn supply_exchange_rate(&self, asset: Asset) -> Result<U256, PoolError>;

    /// Underlying value of one pool debt unit (RAY-scaled).
    fn borrow_exchange_rate(&self, asset: Asset) -> Result<U256, PoolError>;

    /// The pool's current supply rate, RAY-scaled growth per block.
    fn supply_rate_per_block(&self, asset: Asset) -> Result<U256, PoolError>;

    /// The pool's current borrow rate, RAY-scaled growth per block.
    fn borrow_rate_per_block(&self, asset: Asset) -> Result<U256, PoolError>;
}

fn convert(amount: U256, numerator: U256, denominator: U256, rounding: Rounding) -> Result<U256, PoolError> {
    mul_div(amount, numerator, denominator, rounding).map_err(|_| PoolError::Arithmetic)
}

// ==================== Exchange-rate flavored pool ====================

#[derive(Debug, Clone)]
struct ExchangeRateAsset {
    supply_rate: U256,
    borrow_rate: U256,
    supply_exchange_rate: U256,
    borrow_exchange_rate: U256,
    supplied: U256,
    borrowed: U256,
}

/// A pool whose units are minted at the exchange rate in force at each
/// interaction; the exchange rate itself grows with the per-block rates.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRatePool {
    assets: HashMap<Asset, ExchangeRateAsset>,
}

impl ExchangeRatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists an asset with the given RAY-scaled per-block rates.
    pub fn list_asset(&mut self, asset: Asset, supply_rate: U256, borrow_rate: U256) {
        self.assets.insert(
            asset,
            ExchangeRateAsset {
                supply_rate,
                borrow_rate,
                supply_exchange_rate: RAY,
                borrow_exchange_rate: RAY,
                supplied: U256::ZERO,
                borrowed: U256::ZERO,
            },
        );
    }

    /// Advances every asset's exchange rates by `blocks` of linear growth.
    pub fn advance_blocks(&mut self, blocks: u64) -> Result<(), PoolError> {
        let blocks = U256::from(blocks);
        for state in self.assets.values_mut() {
            let supply_factor = RAY
                .checked_add(state.supply_rate.checked_mul(blocks).ok_or(PoolError::Arithmetic)?)
                .ok_or(PoolError::Arithmetic)?;
            let borrow_factor = RAY
                .checked_add(state.borrow_rate.checked_mul(blocks).ok_or(PoolError::Arithmetic)?)
                .ok_or(PoolError::Arithmetic)?;
            state.supply_exchange_rate =
                convert(state.supply_exchange_rate, supply_factor, RAY, Rounding::Down)?;
            state.borrow_exchange_rate =
                convert(state.borrow_exchange_rate, borrow_factor, RAY, Rounding::Up)?;
        }
        Ok(())
    }

    fn asset(&self, asset: Asset) -> Result<&ExchangeRateAsset, PoolError> {
        self.assets.get(&asset).ok_or(PoolError::UnknownAsset(asset))
    }

    fn asset_mut(&mut self, asset: Asset) -> Result<&mut ExchangeRateAsset, PoolError> {
        self.assets.get_mut(&asset).ok_or(PoolError::UnknownAsset(asset))
    }
}

impl PoolGateway for ExchangeRatePool {
    fn supply(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.supply_exchange_rate, Rounding::Down)?;
        state.supplied = state.supplied.checked_add(units).ok_or(PoolError::Arithmetic)?;
        Ok(units)
    }

    fn withdraw(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.supply_exchange_rate, Rounding::Up)?;
        if units > state.supplied {
            return Err(PoolError::InsufficientBalance {
                requested: amount,
                available: state.supplied,
            });
        }
        state.supplied -= units;
        Ok(units)
    }

    fn borrow(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.borrow_exchange_rate, Rounding::Up)?;
        state.borrowed = state.borrowed.checked_add(units).ok_or(PoolError::Arithmetic)?;
        Ok(units)
    }

    fn repay(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.borrow_exchange_rate, Rounding::Down)?;
        let units = crate::math::min(units, state.borrowed);
        state.borrowed -= units;
        Ok(units)
    }

    fn supply_balance(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.supplied)
    }

    fn borrow_balance(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.borrowed)
    }

    fn supply_exchange_rate(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.supply_exchange_rate)
    }

    fn borrow_exchange_rate(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.borrow_exchange_rate)
    }

    fn supply_rate_per_block(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.supply_rate)
    }

    fn borrow_rate_per_block(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.borrow_rate)
    }
}

// ==================== Scaled-balance flavored pool ====================

#[derive(Debug, Clone)]
struct ScaledBalanceAsset {
    liquidity_rate: U256,
    borrow_rate: U256,
    liquidity_index: U256,
    debt_index: U256,
    scaled_supply: U256,
    scaled_debt: U256,
    /// Free underlying available for withdrawals and borrows, including
    /// liquidity contributed by other pool participants
    cash: U256,
}

/// A pool that tracks scaled balances under monotone liquidity and debt
/// indexes, with an explicit cash constraint on outflows.
#[derive(Debug, Clone, Default)]
pub struct ScaledBalancePool {
    assets: HashMap<Asset, ScaledBalanceAsset>,
}

impl ScaledBalancePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists an asset with the given RAY-scaled per-block rates and an
    /// initial amount of third-party cash.
    pub fn list_asset(
        &mut self,
        asset: Asset,
        liquidity_rate: U256,
        borrow_rate: U256,
        initial_cash: U256,
    ) {
        self.assets.insert(
            asset,
            ScaledBalanceAsset {
                liquidity_rate,
                borrow_rate,
                liquidity_index: RAY,
                debt_index: RAY,
                scaled_supply: U256::ZERO,
                scaled_debt: U256::ZERO,
                cash: initial_cash,
            },
        );
    }

    /// Advances every asset's indexes by `blocks` of linear growth.
    pub fn advance_blocks(&mut self, blocks: u64) -> Result<(), PoolError> {
        let blocks = U256::from(blocks);
        for state in self.assets.values_mut() {
            let liquidity_factor = RAY
                .checked_add(state.liquidity_rate.checked_mul(blocks).ok_or(PoolError::Arithmetic)?)
                .ok_or(PoolError::Arithmetic)?;
            let debt_factor = RAY
                .checked_add(state.borrow_rate.checked_mul(blocks).ok_or(PoolError::Arithmetic)?)
                .ok_or(PoolError::Arithmetic)?;
            state.liquidity_index =
                convert(state.liquidity_index, liquidity_factor, RAY, Rounding::Down)?;
            state.debt_index = convert(state.debt_index, debt_factor, RAY, Rounding::Up)?;
        }
        Ok(())
    }

    fn asset(&self, asset: Asset) -> Result<&ScaledBalanceAsset, PoolError> {
        self.assets.get(&asset).ok_or(PoolError::UnknownAsset(asset))
    }

    fn asset_mut(&mut self, asset: Asset) -> Result<&mut ScaledBalanceAsset, PoolError> {
        self.assets.get_mut(&asset).ok_or(PoolError::UnknownAsset(asset))
    }
}

impl PoolGateway for ScaledBalancePool {
    fn supply(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.liquidity_index, Rounding::Down)?;
        state.scaled_supply = state.scaled_supply.checked_add(units).ok_or(PoolError::Arithmetic)?;
        state.cash = state.cash.checked_add(amount).ok_or(PoolError::Arithmetic)?;
        Ok(units)
    }

    fn withdraw(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.liquidity_index, Rounding::Up)?;
        if units > state.scaled_supply {
            return Err(PoolError::InsufficientBalance {
                requested: amount,
                available: state.scaled_supply,
            });
        }
        if amount > state.cash {
            return Err(PoolError::InsufficientLiquidity {
                requested: amount,
                available: state.cash,
            });
        }
        state.scaled_supply -= units;
        state.cash -= amount;
        Ok(units)
    }

    fn borrow(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        if amount > state.cash {
            return Err(PoolError::InsufficientLiquidity {
                requested: amount,
                available: state.cash,
            });
        }
        let units = convert(amount, RAY, state.debt_index, Rounding::Up)?;
        state.scaled_debt = state.scaled_debt.checked_add(units).ok_or(PoolError::Arithmetic)?;
        state.cash -= amount;
        Ok(units)
    }

    fn repay(&mut self, asset: Asset, amount: U256) -> Result<U256, PoolError> {
        let state = self.asset_mut(asset)?;
        let units = convert(amount, RAY, state.debt_index, Rounding::Down)?;
        let units = crate::math::min(units, state.scaled_debt);
        state.scaled_debt -= units;
        state.cash = state.cash.checked_add(amount).ok_or(PoolError::Arithmetic)?;
        Ok(units)
    }

    fn supply_balance(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.scaled_supply)
    }

    fn borrow_balance(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.scaled_debt)
    }

    fn supply_exchange_rate(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.liquidity_index)
    }

    fn borrow_exchange_rate(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.debt_index)
    }

    fn supply_rate_per_block(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.liquidity_rate)
    }

    fn borrow_rate_per_block(&self, asset: Asset) -> Result<U256, PoolError> {
        Ok(self.asset(asset)?.borrow_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn asset() -> Asset {
        Address::repeat_byte(0xAA)
    }

    fn rate(n: u64) -> U256 {
        RAY / U256::from(1_000_000) * U256::from(n)
    }

    #[test]
    fn test_exchange_rate_pool_supply_withdraw() {
        let mut pool = ExchangeRatePool::new();
        pool.list_asset(asset(), rate(1), rate(2));

        let units = pool.supply(asset(), U256::from(100)).unwrap();
        assert_eq!(units, U256::from(100));
        assert_eq!(pool.supply_balance(asset()).unwrap(), U256::from(100));

        let burned = pool.withdraw(asset(), U256::from(40)).unwrap();
        assert_eq!(burned, U256::from(40));
        assert_eq!(pool.supply_balance(asset()).unwrap(), U256::from(60));
    }

    #[test]
    fn test_exchange_rate_pool_accrual() {
        let mut pool = ExchangeRatePool::new();
        pool.list_asset(asset(), rate(1), rate(2));
        pool.supply(asset(), U256::from(1_000_000)).unwrap();

        pool.advance_blocks(1000).unwrap();

        // Rates grew: 1e-6/block supply over 1000 blocks = +0.1%
        let rate = pool.supply_exchange_rate(asset()).unwrap();
        assert!(rate > RAY);

        // Same units, more underlying
        let units = pool.supply_balance(asset()).unwrap();
        let value = crate::math::to_underlying(units, rate, Rounding::Down).unwrap();
        assert!(value > U256::from(1_000_000));
    }

    #[test]
    fn test_exchange_rate_pool_overdraw_fails() {
        let mut pool = ExchangeRatePool::new();
        pool.list_asset(asset(), rate(1), rate(2));
        pool.supply(asset(), U256::from(10)).unwrap();

        let r = pool.withdraw(asset(), U256::from(11));
        assert!(matches!(r, Err(PoolError::InsufficientBalance { .. })));
    }

    #[test]
    fn test_exchange_rate_pool_unknown_asset() {
        let mut pool = ExchangeRatePool::new();
        let r = pool.supply(asset(), U256::from(1));
        assert_eq!(r, Err(PoolError::UnknownAsset(asset())));
    }

    #[test]
    fn test_scaled_pool_borrow_respects_cash() {
        let mut pool = ScaledBalancePool::new();
        pool.list_asset(asset(), rate(1), rate(2), U256::from(50));

        // 50 of third-party cash is available
        pool.borrow(asset(), U256::from(30)).unwrap();
        let r = pool.borrow(asset(), U256::from(30));
        assert!(matches!(r, Err(PoolError::InsufficientLiquidity { .. })));

        // Supplying replenishes cash
        pool.supply(asset(), U256::from(100)).unwrap();
        pool.borrow(asset(), U256::from(30)).unwrap();
    }

    #[test]
    fn test_scaled_pool_repay_caps_at_debt() {
        let mut pool = ScaledBalancePool::new();
        pool.list_asset(asset(), rate(1), rate(2), U256::from(100));
        pool.borrow(asset(), U256::from(60)).unwrap();

        let burned = pool.repay(asset(), U256::from(60)).unwrap();
        assert_eq!(burned, U256::from(60));
        assert_eq!(pool.borrow_balance(asset()).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_scaled_pool_indexes_advance() {
        let mut pool = ScaledBalancePool::new();
        pool.list_asset(asset(), rate(1), rate(2), U256::ZERO);
        pool.advance_blocks(500).unwrap();

        let liquidity = pool.supply_exchange_rate(asset()).unwrap();
        let debt = pool.borrow_exchange_rate(asset()).unwrap();
        assert!(liquidity > RAY);
        assert!(debt > liquidity); // borrow rate is higher
    }
}
