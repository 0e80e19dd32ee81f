//! Per-asset market state: peer-to-peer exchange rates and their growth.
//!
//! Each listed asset carries two RAY-scaled exchange rates that convert
//! between P2P units and underlying: the supply P2P rate (what matched
//! suppliers earn) and the borrow P2P rate (what matched borrowers pay).
//! Both start at 1.0 and only ever increase. Their per-block growth is
//! derived from the pool's own rates: the P2P rate sits between the pool
//! supply and borrow rates at a configurable cursor, and a fee rate skims a
//! share of the remaining spread on each side into the protocol's balance.
//!
//! Accrual uses a first-order expansion, `rate * (1 + growth * blocks)`,
//! rather than full compounding. The supply rate rounds down, the borrow
//! rate rounds up, and the supply rate is clamped to the borrow rate, so the
//! weak ordering `supply_p2p_rate <= borrow_p2p_rate` survives every accrual.

use alloy_primitives::U256;

use crate::error::{Asset, EngineError};
use crate::math::{
    self, min, ray_mul_down, ray_mul_up, wad_mul_up, zero_floor_sub, RAY, WAD,
};

/// Listing-time parameters for a market.
#[derive(Debug, Clone, Copy)]
pub struct MarketParams {
    /// Maximum registry entries visited during one matching or rebalancing
    /// pass
    pub max_iterations: u32,
    /// Share of the rate spread skimmed to the protocol (WAD-scaled)
    pub fee_rate: U256,
    /// Position of the P2P rate within the pool spread (WAD-scaled;
    /// 0 = pool supply rate, 1 = pool borrow rate)
    pub p2p_cursor: U256,
    /// Underlying amounts below this are ignored rather than tracked
    pub dust: U256,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            fee_rate: U256::ZERO,
            p2p_cursor: WAD / U256::from(2),
            dust: U256::ZERO,
        }
    }
}

/// State of one listed market.
#[derive(Debug, Clone)]
pub struct Market {
    /// The market's asset
    pub asset: Asset,

    /// Exchange rate from supply-side P2P units to underlying (RAY-scaled,
    /// monotone non-decreasing, starts at 1.0)
    pub supply_p2p_rate: U256,

    /// Exchange rate from borrow-side P2P units to underlying (RAY-scaled,
    /// monotone non-decreasing, starts at 1.0)
    pub borrow_p2p_rate: U256,

    /// Per-block growth applied to the supply P2P rate (RAY-scaled)
    pub supply_growth_per_block: U256,

    /// Per-block growth applied to the borrow P2P rate (RAY-scaled)
    pub borrow_growth_per_block: U256,

    /// Block at which the rates were last advanced
    pub last_update_block: u64,

    /// Bound on matching work per call
    pub max_iterations: u32,

    /// Share of the rate spread skimmed to the protocol (WAD-scaled)
    pub fee_rate: U256,

    /// Position of the P2P rate within the pool spread (WAD-scaled)
    pub p2p_cursor: U256,

    /// Dust threshold in underlying units
    pub dust: U256,

    /// Total matched supply across the market, in supply-side P2P units
    pub total_p2p_supply: U256,

    /// Total matched borrow across the market, in borrow-side P2P units
    pub total_p2p_borrow: U256,

    /// Supply-side amount nominally matched but resting on the pool, in
    /// pool supply units
    pub supply_delta: U256,

    /// Borrow-side amount nominally matched but resting on the pool, in
    /// pool borrow units
    pub borrow_delta: U256,

    /// Underlying skimmed to the protocol so far
    pub protocol_fees: U256,
}

impl Market {
    /// Creates a freshly listed market with both rates at 1.0 and no growth.
    ///
    /// Growth rates stay zero until [`Market::refresh_growth`] is called
    /// with the pool's current rates.
    pub fn new(asset: Asset, params: MarketParams, block: u64) -> Self {
        Self {
            asset,
            supply_p2p_rate: RAY,
            borrow_p2p_rate: RAY,
            supply_growth_per_block: U256::ZERO,
            borrow_growth_per_block: U256::ZERO,
            last_update_block: block,
            max_iterations: params.max_iterations,
            fee_rate: params.fee_rate,
            p2p_cursor: params.p2p_cursor,
            dust: params.dust,
            total_p2p_supply: U256::ZERO,
            total_p2p_borrow: U256::ZERO,
            supply_delta: U256::ZERO,
            borrow_delta: U256::ZERO,
            protocol_fees: U256::ZERO,
        }
    }

    /// Advances both P2P rates to `block` and accrues the protocol fee.
    ///
    /// Uses the first-order expansion `rate * (1 + growth * blocks)`. The
    /// supply rate rounds down and the borrow rate rounds up; the supply
    /// rate is then clamped to the borrow rate so the weak ordering holds.
    /// The fee for the period is the matched borrow interest not passed on
    /// to matched suppliers.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidAccrualBlock`] if `block` is before the last
    /// update.
    pub fn accrue(&mut self, block: u64) -> Result<(), EngineError> {
        if block < self.last_update_block {
            return Err(EngineError::InvalidAccrualBlock {
                block,
                last_update: self.last_update_block,
            });
        }
        let elapsed = block - self.last_update_block;
        if elapsed == 0 {
            return Ok(());
        }

        let elapsed = U256::from(elapsed);
        let supply_factor = RAY
            .checked_add(
                self.supply_growth_per_block
                    .checked_mul(elapsed)
                    .ok_or(EngineError::ArithmeticOverflow)?,
            )
            .ok_or(EngineError::ArithmeticOverflow)?;
        let borrow_factor = RAY
            .checked_add(
                self.borrow_growth_per_block
                    .checked_mul(elapsed)
                    .ok_or(EngineError::ArithmeticOverflow)?,
            )
            .ok_or(EngineError::ArithmeticOverflow)?;

        let new_supply_rate = ray_mul_down(self.supply_p2p_rate, supply_factor)?;
        let new_borrow_rate = ray_mul_up(self.borrow_p2p_rate, borrow_factor)?;
        let new_supply_rate = min(new_supply_rate, new_borrow_rate);

        // Matched borrowers pay more over the period than matched suppliers
        // receive; the difference is the protocol's skim.
        let supply_interest = ray_mul_down(
            self.total_p2p_supply,
            new_supply_rate - self.supply_p2p_rate,
        )?;
        let borrow_interest = ray_mul_down(
            self.total_p2p_borrow,
            new_borrow_rate - self.borrow_p2p_rate,
        )?;
        self.protocol_fees = self
            .protocol_fees
            .checked_add(zero_floor_sub(borrow_interest, supply_interest))
            .ok_or(EngineError::ArithmeticOverflow)?;

        self.supply_p2p_rate = new_supply_rate;
        self.borrow_p2p_rate = new_borrow_rate;
        self.last_update_block = block;
        Ok(())
    }

    /// Recomputes the per-block growth rates from the pool's current rates.
    ///
    /// The mid rate sits at `p2p_cursor` within the pool spread; the fee
    /// rate then skims a share of each side's remaining distance to the mid
    /// rate. The resulting growths satisfy
    /// `pool_supply <= supply_growth <= borrow_growth <= pool_borrow`.
    /// Only the growth rates change; accumulated exchange rates are never
    /// rewritten.
    pub fn refresh_growth(
        &mut self,
        pool_supply_rate: U256,
        pool_borrow_rate: U256,
    ) -> Result<(), EngineError> {
        let low = min(pool_supply_rate, pool_borrow_rate);
        let high = math::max(pool_supply_rate, pool_borrow_rate);
        let spread = high - low;

        let mid = low
            .checked_add(math::wad_mul_down(self.p2p_cursor, spread)?)
            .ok_or(EngineError::ArithmeticOverflow)?;

        let supply_growth = mid - min(wad_mul_up(self.fee_rate, mid - low)?, mid - low);
        let borrow_growth = mid
            .checked_add(wad_mul_up(self.fee_rate, high - mid)?)
            .ok_or(EngineError::ArithmeticOverflow)?;

        self.supply_growth_per_block = supply_growth;
        self.borrow_growth_per_block = min(borrow_growth, high);
        Ok(())
    }

    /// Returns the current spread between the borrow and supply P2P rates.
    pub fn rate_spread(&self) -> U256 {
        zero_floor_sub(self.borrow_p2p_rate, self.supply_p2p_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn test_market() -> Market {
        Market::new(Address::ZERO, MarketParams::default(), 100)
    }

    /// ~0.0001% per block, RAY-scaled
    fn growth(n: u64) -> U256 {
        RAY / U256::from(1_000_000) * U256::from(n)
    }

    #[test]
    fn test_new_market_rates_start_at_one() {
        let market = test_market();
        assert_eq!(market.supply_p2p_rate, RAY);
        assert_eq!(market.borrow_p2p_rate, RAY);
        assert_eq!(market.last_update_block, 100);
    }

    #[test]
    fn test_accrue_before_last_update_fails() {
        let mut market = test_market();
        let r = market.accrue(99);
        assert_eq!(
            r,
            Err(EngineError::InvalidAccrualBlock {
                block: 99,
                last_update: 100
            })
        );
    }

    #[test]
    fn test_accrue_same_block_is_noop() {
        let mut market = test_market();
        market.accrue(100).unwrap();
        assert_eq!(market.supply_p2p_rate, RAY);
        assert_eq!(market.borrow_p2p_rate, RAY);
    }

    #[test]
    fn test_accrue_linear_growth() {
        let mut market = test_market();
        market.supply_growth_per_block = growth(1);
        market.borrow_growth_per_block = growth(2);

        market.accrue(200).unwrap();

        // 100 blocks at 1e-6 and 2e-6 per block
        assert_eq!(market.supply_p2p_rate, RAY + growth(1) * U256::from(100));
        assert_eq!(market.borrow_p2p_rate, RAY + growth(2) * U256::from(100));
        assert_eq!(market.last_update_block, 200);
    }

    #[test]
    fn test_rates_monotone_and_ordered() {
        let mut market = test_market();
        market.supply_growth_per_block = growth(3);
        market.borrow_growth_per_block = growth(3);

        let mut prev_supply = market.supply_p2p_rate;
        let mut prev_borrow = market.borrow_p2p_rate;
        for block in [150, 151, 400, 1000] {
            market.accrue(block).unwrap();
            assert!(market.supply_p2p_rate >= prev_supply);
            assert!(market.borrow_p2p_rate >= prev_borrow);
            assert!(market.supply_p2p_rate <= market.borrow_p2p_rate);
            prev_supply = market.supply_p2p_rate;
            prev_borrow = market.borrow_p2p_rate;
        }
    }

    #[test]
    fn test_fee_accrues_from_spread() {
        let mut market = test_market();
        market.supply_growth_per_block = growth(1);
        market.borrow_growth_per_block = growth(2);
        // 1M matched on both sides at unit rates
        market.total_p2p_supply = U256::from(1_000_000_000_000u64);
        market.total_p2p_borrow = U256::from(1_000_000_000_000u64);

        market.accrue(200).unwrap();

        // Borrow interest exceeds supply interest by the spread growth
        assert!(market.protocol_fees > U256::ZERO);
    }

    #[test]
    fn test_no_fee_without_matched_volume() {
        let mut market = test_market();
        market.supply_growth_per_block = growth(1);
        market.borrow_growth_per_block = growth(2);

        market.accrue(200).unwrap();
        assert_eq!(market.protocol_fees, U256::ZERO);
    }

    #[test]
    fn test_refresh_growth_between_pool_rates() {
        let mut market = test_market();
        market.fee_rate = WAD / U256::from(10); // 10%

        let pool_supply = growth(10);
        let pool_borrow = growth(30);
        market.refresh_growth(pool_supply, pool_borrow).unwrap();

        let s = market.supply_growth_per_block;
        let b = market.borrow_growth_per_block;
        assert!(pool_supply <= s);
        assert!(s <= b);
        assert!(b <= pool_borrow);

        // With a 50% cursor the mid rate is the average; the fee pushes the
        // two growths apart around it
        let mid = (pool_supply + pool_borrow) / U256::from(2);
        assert!(s < mid);
        assert!(b > mid);
    }

    #[test]
    fn test_refresh_growth_zero_fee_collapses_to_mid() {
        let mut market = test_market();
        let pool_supply = growth(10);
        let pool_borrow = growth(30);
        market.refresh_growth(pool_supply, pool_borrow).unwrap();

        let mid = (pool_supply + pool_borrow) / U256::from(2);
        assert_eq!(market.supply_growth_per_block, mid);
        assert_eq!(market.borrow_growth_per_block, mid);
    }

    #[test]
    fn test_refresh_growth_inverted_pool_rates() {
        // A pool quoting supply above borrow still yields ordered growths
        let mut market = test_market();
        market.refresh_growth(growth(30), growth(10)).unwrap();
        assert!(market.supply_growth_per_block <= market.borrow_growth_per_block);
    }
}
