//! The matching engine: bounded greedy matching over the ordered
//! registries.
//!
//! Every public operation is one atomic step: accrue the market's P2P
//! rates, validate, run the bounded matching walk, push any residual to the
//! pool gateway, then commit positions and registries. Work per call is
//! capped by the market's `max_iterations`: a matching or rebalancing walk
//! visits at most that many registry entries, and whatever cannot be
//! rebalanced within the budget is carried as a market-level delta instead
//! of failing the call.
//!
//! Operations mutate a clone of the per-asset shard and swap it in only on
//! success, so a failed call leaves engine state exactly as it found it.

use std::collections::HashMap;

use alloy_primitives::{Address, U256};

use crate::error::{Asset, EngineError};
use crate::market::{Market, MarketParams};
use crate::math::{
    min, mul_div_down, to_scaled, to_underlying, wad_mul_down, wad_mul_up, zero_floor_sub,
    Rounding, WAD,
};
use crate::oracle::PriceOracle;
use crate::pool::PoolGateway;
use crate::position::{AccountPosition, Position};
use crate::registry::OrderedRegistry;

/// Result of a liquidation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidationOutcome {
    /// The account that repaid the debt and receives the seized collateral
    pub liquidator: Address,
    /// The account that was liquidated
    pub borrower: Address,
    /// Underlying debt repaid
    pub repaid: U256,
    /// Underlying collateral seized
    pub seized: U256,
}

/// A user's aggregate debt and collateral values, in oracle reference units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountHealth {
    /// Value of all debt, rounded up
    pub debt_value: U256,
    /// Collateral value scaled by each asset's collateral factor
    pub borrow_capacity: U256,
    /// Collateral value scaled by each asset's liquidation threshold
    pub liquidation_capacity: U256,
}

impl AccountHealth {
    /// Whether the account is above the liquidation threshold.
    pub fn is_healthy(&self) -> bool {
        self.debt_value <= self.liquidation_capacity
    }
}

/// Which risk ratio weighs collateral in an aggregate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RiskBasis {
    BorrowPower,
    Liquidation,
}

/// All state for one listed market: exchange rates, both registries and
/// both position maps. Cloned at the start of each operation and committed
/// on success.
#[derive(Debug, Clone)]
struct Shard {
    market: Market,
    suppliers: OrderedRegistry,
    borrowers: OrderedRegistry,
    supply_positions: HashMap<Address, Position>,
    borrow_positions: HashMap<Address, Position>,
}

impl Shard {
    fn new(market: Market) -> Self {
        Self {
            market,
            suppliers: OrderedRegistry::new(),
            borrowers: OrderedRegistry::new(),
            supply_positions: HashMap::new(),
            borrow_positions: HashMap::new(),
        }
    }

    fn supply_of(&self, user: Address) -> Position {
        self.supply_positions.get(&user).copied().unwrap_or_default()
    }

    fn borrow_of(&self, user: Address) -> Position {
        self.borrow_positions.get(&user).copied().unwrap_or_default()
    }

    /// Stores the supply position, collapsing dust components and keeping
    /// the registry ranking in sync with the on-pool underlying value.
    fn set_supply(&mut self, user: Address, pos: Position, pool_rate: U256) -> Result<(), EngineError> {
        let mut pos = pos;
        if !pos.on_pool.is_zero() && pos.on_pool_underlying(pool_rate)? < self.market.dust {
            pos.on_pool = U256::ZERO;
        }
        if !pos.in_p2p.is_zero()
            && pos.in_p2p_underlying(self.market.supply_p2p_rate)? < self.market.dust
        {
            self.market.total_p2p_supply = zero_floor_sub(self.market.total_p2p_supply, pos.in_p2p);
            pos.in_p2p = U256::ZERO;
        }
        if pos.is_empty() {
            self.supply_positions.remove(&user);
            self.suppliers.remove(user);
        } else {
            self.supply_positions.insert(user, pos);
            self.suppliers.upsert(user, pos.on_pool_underlying(pool_rate)?);
        }
        Ok(())
    }

    /// Stores the borrow position, collapsing dust components and keeping
    /// the registry ranking in sync with the on-pool underlying value.
    fn set_borrow(&mut self, user: Address, pos: Position, pool_rate: U256) -> Result<(), EngineError> {
        let mut pos = pos;
        if !pos.on_pool.is_zero() && pos.on_pool_underlying(pool_rate)? < self.market.dust {
            pos.on_pool = U256::ZERO;
        }
        if !pos.in_p2p.is_zero()
            && pos.in_p2p_underlying(self.market.borrow_p2p_rate)? < self.market.dust
        {
            self.market.total_p2p_borrow = zero_floor_sub(self.market.total_p2p_borrow, pos.in_p2p);
            pos.in_p2p = U256::ZERO;
        }
        if pos.is_empty() {
            self.borrow_positions.remove(&user);
            self.borrowers.remove(user);
        } else {
            self.borrow_positions.insert(user, pos);
            self.borrowers.upsert(user, pos.on_pool_underlying(pool_rate)?);
        }
        Ok(())
    }

    /// Moves up to `target` underlying of borrowers' pool debt into P2P,
    /// largest positions first. Each visited entry consumes one unit of
    /// `budget`. Returns the underlying matched; the caller repays that
    /// much debt on the pool.
    fn match_borrowers(
        &mut self,
        pool_borrow_rate: U256,
        target: U256,
        budget: &mut u32,
    ) -> Result<U256, EngineError> {
        let mut remaining = target;
        let candidates: Vec<(Address, U256)> = self.borrowers.head(*budget as usize).collect();
        for (user, _) in candidates {
            if remaining.is_zero() || *budget == 0 {
                break;
            }
            *budget -= 1;
            let mut pos = self.borrow_of(user);
            let matched = min(remaining, pos.on_pool_underlying(pool_borrow_rate)?);
            if matched.is_zero() {
                continue;
            }
            pos.on_pool = zero_floor_sub(pos.on_pool, to_scaled(matched, pool_borrow_rate, Rounding::Up)?);
            let p2p_units = to_scaled(matched, self.market.borrow_p2p_rate, Rounding::Up)?;
            pos.in_p2p += p2p_units;
            self.market.total_p2p_borrow += p2p_units;
            self.set_borrow(user, pos, pool_borrow_rate)?;
            remaining -= matched;
        }
        Ok(target - remaining)
    }

    /// Moves up to `target` underlying of suppliers' pool deposits into
    /// P2P, largest positions first. Returns the underlying matched; the
    /// caller withdraws that much from the pool.
    fn match_suppliers(
        &mut self,
        pool_supply_rate: U256,
        target: U256,
        budget: &mut u32,
    ) -> Result<U256, EngineError> {
        let mut remaining = target;
        let candidates: Vec<(Address, U256)> = self.suppliers.head(*budget as usize).collect();
        for (user, _) in candidates {
            if remaining.is_zero() || *budget == 0 {
                break;
            }
            *budget -= 1;
            let mut pos = self.supply_of(user);
            let matched = min(remaining, pos.on_pool_underlying(pool_supply_rate)?);
            if matched.is_zero() {
                continue;
            }
            pos.on_pool = zero_floor_sub(pos.on_pool, to_scaled(matched, pool_supply_rate, Rounding::Up)?);
            let p2p_units = to_scaled(matched, self.market.supply_p2p_rate, Rounding::Down)?;
            pos.in_p2p += p2p_units;
            self.market.total_p2p_supply += p2p_units;
            self.set_supply(user, pos, pool_supply_rate)?;
            remaining -= matched;
        }
        Ok(target - remaining)
    }

    /// Pushes up to `target` underlying of matched borrowers' debt back
    /// onto the pool, smallest on-pool positions (the most-matched
    /// borrowers) first. Returns the underlying demoted; the caller borrows
    /// that much from the pool.
    fn unmatch_borrowers(
        &mut self,
        pool_borrow_rate: U256,
        target: U256,
        budget: &mut u32,
    ) -> Result<U256, EngineError> {
        let mut remaining = target;
        let candidates: Vec<(Address, U256)> = self.borrowers.tail(*budget as usize).collect();
        for (user, _) in candidates {
            if remaining.is_zero() || *budget == 0 {
                break;
            }
            *budget -= 1;
            let mut pos = self.borrow_of(user);
            let matched = min(remaining, pos.in_p2p_underlying(self.market.borrow_p2p_rate)?);
            if matched.is_zero() {
                continue;
            }
            let p2p_units = to_scaled(matched, self.market.borrow_p2p_rate, Rounding::Down)?;
            pos.in_p2p -= p2p_units;
            self.market.total_p2p_borrow = zero_floor_sub(self.market.total_p2p_borrow, p2p_units);
            pos.on_pool += to_scaled(matched, pool_borrow_rate, Rounding::Up)?;
            self.set_borrow(user, pos, pool_borrow_rate)?;
            remaining -= matched;
        }
        Ok(target - remaining)
    }

    /// Pushes up to `target` underlying of matched suppliers' deposits back
    /// onto the pool, smallest on-pool positions first. Returns the
    /// underlying demoted; the caller deposits that much into the pool.
    fn unmatch_suppliers(
        &mut self,
        pool_supply_rate: U256,
        target: U256,
        budget: &mut u32,
    ) -> Result<U256, EngineError> {
        let mut remaining = target;
        let candidates: Vec<(Address, U256)> = self.suppliers.tail(*budget as usize).collect();
        for (user, _) in candidates {
            if remaining.is_zero() || *budget == 0 {
                break;
            }
            *budget -= 1;
            let mut pos = self.supply_of(user);
            let matched = min(remaining, pos.in_p2p_underlying(self.market.supply_p2p_rate)?);
            if matched.is_zero() {
                continue;
            }
            let p2p_units = min(
                to_scaled(matched, self.market.supply_p2p_rate, Rounding::Up)?,
                pos.in_p2p,
            );
            pos.in_p2p -= p2p_units;
            self.market.total_p2p_supply = zero_floor_sub(self.market.total_p2p_supply, p2p_units);
            pos.on_pool += to_scaled(matched, pool_supply_rate, Rounding::Down)?;
            self.set_supply(user, pos, pool_supply_rate)?;
            remaining -= matched;
        }
        Ok(target - remaining)
    }
}

/// The peer-to-peer overlay over a pool gateway and a price oracle.
///
/// Holds one market shard per listed asset. Calls execute one at a time to
/// completion; markets are independent except through a user's aggregate
/// collateral, which is only ever read.
#[derive(Debug)]
pub struct MatchingEngine<P, O> {
    pool: P,
    oracle: O,
    shards: HashMap<Asset, Shard>,
}

impl<P: PoolGateway, O: PriceOracle> MatchingEngine<P, O> {
    /// Creates an engine over the given pool gateway and oracle.
    pub fn new(pool: P, oracle: O) -> Self {
        Self {
            pool,
            oracle,
            shards: HashMap::new(),
        }
    }

    /// Read access to the pool gateway.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Mutable access to the pool gateway, for drivers that advance it.
    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    /// Read access to the oracle.
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Mutable access to the oracle, for drivers that reprice assets.
    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    /// Whether the asset has a created market.
    pub fn is_listed(&self, asset: Asset) -> bool {
        self.shards.contains_key(&asset)
    }

    /// The market state for a listed asset.
    pub fn market(&self, asset: Asset) -> Result<&Market, EngineError> {
        Ok(&self.shard(asset)?.market)
    }

    /// All listed markets, in no particular order.
    pub fn markets(&self) -> impl Iterator<Item = &Market> + '_ {
        self.shards.values().map(|shard| &shard.market)
    }

    /// The user's supply and borrow positions on a market.
    pub fn position_of(&self, asset: Asset, user: Address) -> Result<AccountPosition, EngineError> {
        let shard = self.shard(asset)?;
        Ok(AccountPosition {
            supply: shard.supply_of(user),
            borrow: shard.borrow_of(user),
        })
    }

    /// Every account with a position on the market, sorted by address.
    pub fn account_positions(
        &self,
        asset: Asset,
    ) -> Result<Vec<(Address, AccountPosition)>, EngineError> {
        let shard = self.shard(asset)?;
        let mut users: Vec<Address> = shard
            .supply_positions
            .keys()
            .chain(shard.borrow_positions.keys())
            .copied()
            .collect();
        users.sort_unstable();
        users.dedup();
        Ok(users
            .into_iter()
            .map(|user| {
                (
                    user,
                    AccountPosition {
                        supply: shard.supply_of(user),
                        borrow: shard.borrow_of(user),
                    },
                )
            })
            .collect())
    }

    /// The user's aggregate debt and collateral values across all markets.
    pub fn health_of(&self, user: Address) -> Result<AccountHealth, EngineError> {
        let (borrow_capacity, debt_value) = self.account_values(user, RiskBasis::BorrowPower, &[])?;
        let (liquidation_capacity, _) = self.account_values(user, RiskBasis::Liquidation, &[])?;
        Ok(AccountHealth {
            debt_value,
            borrow_capacity,
            liquidation_capacity,
        })
    }

    /// Lists a market for the asset. The initial P2P growth rates are
    /// derived from the pool's current rates.
    ///
    /// # Errors
    ///
    /// [`EngineError::MarketAlreadyListed`] for a duplicate listing;
    /// pool errors if the pool does not know the asset.
    pub fn create_market(
        &mut self,
        asset: Asset,
        params: MarketParams,
        block: u64,
    ) -> Result<(), EngineError> {
        if self.shards.contains_key(&asset) {
            return Err(EngineError::MarketAlreadyListed { asset });
        }
        let pool_supply_rate = self.pool.supply_rate_per_block(asset)?;
        let pool_borrow_rate = self.pool.borrow_rate_per_block(asset)?;
        let mut market = Market::new(asset, params, block);
        market.refresh_growth(pool_supply_rate, pool_borrow_rate)?;
        self.shards.insert(asset, Shard::new(market));
        Ok(())
    }

    /// Accrues the market to `block` and re-derives its P2P growth rates
    /// from the pool's current rates.
    pub fn refresh_rates(&mut self, asset: Asset, block: u64) -> Result<(), EngineError> {
        if !self.shards.contains_key(&asset) {
            return Err(EngineError::MarketNotListed { asset });
        }
        let pool_supply_rate = self.pool.supply_rate_per_block(asset)?;
        let pool_borrow_rate = self.pool.borrow_rate_per_block(asset)?;
        let shard = self
            .shards
            .get_mut(&asset)
            .ok_or(EngineError::MarketNotListed { asset })?;
        shard.market.accrue(block)?;
        shard.market.refresh_growth(pool_supply_rate, pool_borrow_rate)
    }

    /// Supplies `amount` underlying for `user`.
    ///
    /// Matched against the borrow delta first, then against borrowers' pool
    /// debt head-first, up to `max_iterations` entries; the remainder is
    /// deposited into the pool. Returns the updated supply position.
    pub fn supply(
        &mut self,
        user: Address,
        asset: Asset,
        amount: U256,
        block: u64,
    ) -> Result<Position, EngineError> {
        if amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        let mut shard = self.shard(asset)?.clone();
        shard.market.accrue(block)?;
        if amount < shard.market.dust {
            return Err(EngineError::AmountBelowDust {
                amount,
                dust: shard.market.dust,
            });
        }

        let pool_supply_rate = self.pool.supply_exchange_rate(asset)?;
        let pool_borrow_rate = self.pool.borrow_exchange_rate(asset)?;

        let mut remaining = amount;
        let mut pool_repay = U256::ZERO;

        if !shard.market.borrow_delta.is_zero() {
            let delta_underlying =
                to_underlying(shard.market.borrow_delta, pool_borrow_rate, Rounding::Down)?;
            let matched = min(remaining, delta_underlying);
            if !matched.is_zero() {
                let units = min(
                    to_scaled(matched, pool_borrow_rate, Rounding::Up)?,
                    shard.market.borrow_delta,
                );
                shard.market.borrow_delta -= units;
                pool_repay += matched;
                remaining -= matched;
            }
        }

        if !remaining.is_zero() {
            let mut budget = shard.market.max_iterations;
            let matched = shard.match_borrowers(pool_borrow_rate, remaining, &mut budget)?;
            pool_repay += matched;
            remaining -= matched;
        }

        let mut pos = shard.supply_of(user);
        let matched_total = amount - remaining;
        if !matched_total.is_zero() {
            let p2p_units = to_scaled(matched_total, shard.market.supply_p2p_rate, Rounding::Down)?;
            pos.in_p2p += p2p_units;
            shard.market.total_p2p_supply += p2p_units;
        }
        if !pool_repay.is_zero() {
            self.pool.repay(asset, pool_repay)?;
        }
        if !remaining.is_zero() {
            pos.on_pool += self.pool.supply(asset, remaining)?;
        }
        shard.set_supply(user, pos, pool_supply_rate)?;

        let result = shard.supply_of(user);
        self.shards.insert(asset, shard);
        Ok(result)
    }

    /// Borrows `amount` underlying for `user`.
    ///
    /// The user's aggregate collateral must cover the new debt at the
    /// configured collateral factors. Matched against the supply delta
    /// first, then against suppliers' pool deposits head-first; the
    /// remainder is borrowed from the pool. Returns the updated borrow
    /// position.
    pub fn borrow(
        &mut self,
        user: Address,
        asset: Asset,
        amount: U256,
        block: u64,
    ) -> Result<Position, EngineError> {
        if amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        let mut shard = self.shard(asset)?.clone();
        shard.market.accrue(block)?;
        if amount < shard.market.dust {
            return Err(EngineError::AmountBelowDust {
                amount,
                dust: shard.market.dust,
            });
        }

        let (borrow_capacity, debt_value) =
            self.account_values(user, RiskBasis::BorrowPower, &[(asset, &shard)])?;
        let price = self
            .oracle
            .asset_price(asset)
            .ok_or(EngineError::UnknownOraclePrice { asset })?;
        let new_debt_value = debt_value + wad_mul_up(amount, price)?;
        if new_debt_value > borrow_capacity {
            return Err(EngineError::InsufficientCollateral {
                user,
                debt_value: new_debt_value,
                borrow_capacity,
            });
        }

        let pool_supply_rate = self.pool.supply_exchange_rate(asset)?;
        let pool_borrow_rate = self.pool.borrow_exchange_rate(asset)?;

        let mut remaining = amount;
        let mut pool_withdraw = U256::ZERO;

        if !shard.market.supply_delta.is_zero() {
            let delta_underlying =
                to_underlying(shard.market.supply_delta, pool_supply_rate, Rounding::Down)?;
            let matched = min(remaining, delta_underlying);
            if !matched.is_zero() {
                let units = min(
                    to_scaled(matched, pool_supply_rate, Rounding::Up)?,
                    shard.market.supply_delta,
                );
                shard.market.supply_delta -= units;
                pool_withdraw += matched;
                remaining -= matched;
            }
        }

        if !remaining.is_zero() {
            let mut budget = shard.market.max_iterations;
            let matched = shard.match_suppliers(pool_supply_rate, remaining, &mut budget)?;
            pool_withdraw += matched;
            remaining -= matched;
        }

        let mut pos = shard.borrow_of(user);
        let matched_total = amount - remaining;
        if !matched_total.is_zero() {
            let p2p_units = to_scaled(matched_total, shard.market.borrow_p2p_rate, Rounding::Up)?;
            pos.in_p2p += p2p_units;
            shard.market.total_p2p_borrow += p2p_units;
        }
        if !pool_withdraw.is_zero() {
            self.pool.withdraw(asset, pool_withdraw)?;
        }
        if !remaining.is_zero() {
            pos.on_pool += self.pool.borrow(asset, remaining)?;
        }
        shard.set_borrow(user, pos, pool_borrow_rate)?;

        let result = shard.borrow_of(user);
        self.shards.insert(asset, shard);
        Ok(result)
    }

    /// Withdraws `amount` underlying of supply for `user`.
    ///
    /// Amount zero is a state-free no-op. The on-pool balance is drained
    /// first; withdrawn P2P volume is re-funded by shrinking the supply
    /// delta, promoting replacement suppliers, then demoting matched
    /// borrowers, all within one `max_iterations` budget. Whatever the
    /// budget cannot rebalance is carried as borrow delta and funded by a
    /// direct pool borrow — the call never fails for lack of iterations.
    pub fn withdraw(
        &mut self,
        user: Address,
        asset: Asset,
        amount: U256,
        block: u64,
    ) -> Result<Position, EngineError> {
        if amount.is_zero() {
            return Ok(self.shard(asset)?.supply_of(user));
        }
        let mut shard = self.shard(asset)?.clone();
        shard.market.accrue(block)?;

        let pool_supply_rate = self.pool.supply_exchange_rate(asset)?;
        let pool_borrow_rate = self.pool.borrow_exchange_rate(asset)?;

        let pos = shard.supply_of(user);
        let available = pos.total_underlying(pool_supply_rate, shard.market.supply_p2p_rate)?;
        if amount > available {
            return Err(EngineError::InsufficientPosition { user, asset });
        }

        // Removing supply shrinks the user's collateral; their debt must
        // still be covered afterwards.
        if self.has_outstanding_debt(user, &[(asset, &shard)]) {
            let (borrow_capacity, debt_value) =
                self.account_values(user, RiskBasis::BorrowPower, &[(asset, &shard)])?;
            let price = self
                .oracle
                .asset_price(asset)
                .ok_or(EngineError::UnknownOraclePrice { asset })?;
            let params = self
                .oracle
                .risk_params(asset)
                .ok_or(EngineError::UnknownRiskParams { asset })?;
            let removed_capacity =
                wad_mul_up(wad_mul_up(amount, price)?, params.collateral_factor)?;
            if debt_value > zero_floor_sub(borrow_capacity, removed_capacity) {
                return Err(EngineError::InsufficientCollateral {
                    user,
                    debt_value,
                    borrow_capacity: zero_floor_sub(borrow_capacity, removed_capacity),
                });
            }
        }

        self.apply_withdraw(&mut shard, user, asset, amount, pool_supply_rate, pool_borrow_rate)?;

        let result = shard.supply_of(user);
        self.shards.insert(asset, shard);
        Ok(result)
    }

    /// Repays `amount` underlying of `user`'s debt.
    ///
    /// Amount zero is a state-free no-op. Pool debt is repaid first;
    /// repaid P2P volume is re-balanced by shrinking the borrow delta,
    /// promoting replacement borrowers, then demoting matched suppliers,
    /// with the remainder carried as supply delta.
    pub fn repay(
        &mut self,
        user: Address,
        asset: Asset,
        amount: U256,
        block: u64,
    ) -> Result<Position, EngineError> {
        if amount.is_zero() {
            return Ok(self.shard(asset)?.borrow_of(user));
        }
        let mut shard = self.shard(asset)?.clone();
        shard.market.accrue(block)?;

        let pool_supply_rate = self.pool.supply_exchange_rate(asset)?;
        let pool_borrow_rate = self.pool.borrow_exchange_rate(asset)?;

        let pos = shard.borrow_of(user);
        let debt = pos.total_underlying(pool_borrow_rate, shard.market.borrow_p2p_rate)?;
        if amount > debt {
            return Err(EngineError::InsufficientPosition { user, asset });
        }

        self.apply_repay(&mut shard, user, asset, amount, pool_supply_rate, pool_borrow_rate)?;

        let result = shard.borrow_of(user);
        self.shards.insert(asset, shard);
        Ok(result)
    }

    /// Liquidates an unhealthy borrower: repays `repay_amount` of their
    /// debt in `borrowed_asset` and seizes the oracle-priced equivalent
    /// plus the liquidation bonus from their `collateral_asset` supply,
    /// pool-first on both legs.
    pub fn liquidate(
        &mut self,
        liquidator: Address,
        borrowed_asset: Asset,
        collateral_asset: Asset,
        borrower: Address,
        repay_amount: U256,
        block: u64,
    ) -> Result<LiquidationOutcome, EngineError> {
        if repay_amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        let mut debt_shard = self.shard(borrowed_asset)?.clone();
        debt_shard.market.accrue(block)?;
        let mut coll_shard = if collateral_asset == borrowed_asset {
            None
        } else {
            let mut shard = self.shard(collateral_asset)?.clone();
            shard.market.accrue(block)?;
            Some(shard)
        };

        let mut overrides: Vec<(Asset, &Shard)> = vec![(borrowed_asset, &debt_shard)];
        if let Some(shard) = coll_shard.as_ref() {
            overrides.push((collateral_asset, shard));
        }
        let (liquidation_capacity, debt_value) =
            self.account_values(borrower, RiskBasis::Liquidation, &overrides)?;
        if debt_value <= liquidation_capacity {
            return Err(EngineError::BorrowerHealthy { borrower });
        }

        let pool_borrow_rate = self.pool.borrow_exchange_rate(borrowed_asset)?;
        let debt_pos = debt_shard.borrow_of(borrower);
        let market_debt =
            debt_pos.total_underlying(pool_borrow_rate, debt_shard.market.borrow_p2p_rate)?;
        let max_repay = wad_mul_down(market_debt, self.oracle.close_factor())?;
        if repay_amount > max_repay {
            return Err(EngineError::RepayExceedsCloseFactor {
                amount: repay_amount,
                max_repay,
            });
        }

        let borrowed_price = self
            .oracle
            .asset_price(borrowed_asset)
            .ok_or(EngineError::UnknownOraclePrice { asset: borrowed_asset })?;
        let collateral_price = self
            .oracle
            .asset_price(collateral_asset)
            .ok_or(EngineError::UnknownOraclePrice { asset: collateral_asset })?;
        let bonus = self
            .oracle
            .risk_params(collateral_asset)
            .ok_or(EngineError::UnknownRiskParams { asset: collateral_asset })?
            .liquidation_bonus;
        let seized = wad_mul_down(
            mul_div_down(repay_amount, borrowed_price, collateral_price)?,
            WAD + bonus,
        )?;

        let pool_supply_rate_coll = self.pool.supply_exchange_rate(collateral_asset)?;
        {
            let shard = coll_shard.as_ref().unwrap_or(&debt_shard);
            let coll_pos = shard.supply_of(borrower);
            let available =
                coll_pos.total_underlying(pool_supply_rate_coll, shard.market.supply_p2p_rate)?;
            if seized > available {
                return Err(EngineError::InsufficientPosition {
                    user: borrower,
                    asset: collateral_asset,
                });
            }
        }

        let pool_supply_rate = self.pool.supply_exchange_rate(borrowed_asset)?;
        self.apply_repay(
            &mut debt_shard,
            borrower,
            borrowed_asset,
            repay_amount,
            pool_supply_rate,
            pool_borrow_rate,
        )?;

        let pool_borrow_rate_coll = self.pool.borrow_exchange_rate(collateral_asset)?;
        let shard = coll_shard.as_mut().unwrap_or(&mut debt_shard);
        self.apply_withdraw(
            shard,
            borrower,
            collateral_asset,
            seized,
            pool_supply_rate_coll,
            pool_borrow_rate_coll,
        )?;

        self.shards.insert(borrowed_asset, debt_shard);
        if let Some(shard) = coll_shard {
            self.shards.insert(collateral_asset, shard);
        }
        Ok(LiquidationOutcome {
            liquidator,
            borrower,
            repaid: repay_amount,
            seized,
        })
    }

    // ==================== Internals ====================

    fn shard(&self, asset: Asset) -> Result<&Shard, EngineError> {
        self.shards
            .get(&asset)
            .ok_or(EngineError::MarketNotListed { asset })
    }

    /// The withdraw waterfall: pool balance, then P2P backed by the supply
    /// delta, promoted suppliers, demoted borrowers and finally the borrow
    /// delta.
    fn apply_withdraw(
        &mut self,
        shard: &mut Shard,
        user: Address,
        asset: Asset,
        amount: U256,
        pool_supply_rate: U256,
        pool_borrow_rate: U256,
    ) -> Result<(), EngineError> {
        let mut pos = shard.supply_of(user);
        let mut remaining = amount;
        let mut pool_withdraw_total = U256::ZERO;
        let mut pool_borrow_total = U256::ZERO;

        let from_pool = min(remaining, pos.on_pool_underlying(pool_supply_rate)?);
        if !from_pool.is_zero() {
            pos.on_pool =
                zero_floor_sub(pos.on_pool, to_scaled(from_pool, pool_supply_rate, Rounding::Up)?);
            pool_withdraw_total += from_pool;
            remaining -= from_pool;
        }

        if !remaining.is_zero() {
            let p2p_units = min(
                to_scaled(remaining, shard.market.supply_p2p_rate, Rounding::Up)?,
                pos.in_p2p,
            );
            pos.in_p2p -= p2p_units;
            shard.market.total_p2p_supply =
                zero_floor_sub(shard.market.total_p2p_supply, p2p_units);
        }
        shard.set_supply(user, pos, pool_supply_rate)?;

        if !remaining.is_zero() {
            let mut unfunded = remaining;

            if !shard.market.supply_delta.is_zero() {
                let delta_underlying =
                    to_underlying(shard.market.supply_delta, pool_supply_rate, Rounding::Down)?;
                let matched = min(unfunded, delta_underlying);
                if !matched.is_zero() {
                    let units = min(
                        to_scaled(matched, pool_supply_rate, Rounding::Up)?,
                        shard.market.supply_delta,
                    );
                    shard.market.supply_delta -= units;
                    pool_withdraw_total += matched;
                    unfunded -= matched;
                }
            }

            let mut budget = shard.market.max_iterations;
            if !unfunded.is_zero() {
                let promoted = shard.match_suppliers(pool_supply_rate, unfunded, &mut budget)?;
                pool_withdraw_total += promoted;
                unfunded -= promoted;
            }
            if !unfunded.is_zero() {
                let demoted = shard.unmatch_borrowers(pool_borrow_rate, unfunded, &mut budget)?;
                pool_borrow_total += demoted;
                unfunded -= demoted;
            }
            if !unfunded.is_zero() {
                shard.market.borrow_delta += to_scaled(unfunded, pool_borrow_rate, Rounding::Up)?;
                pool_borrow_total += unfunded;
            }
        }

        if !pool_withdraw_total.is_zero() {
            self.pool.withdraw(asset, pool_withdraw_total)?;
        }
        if !pool_borrow_total.is_zero() {
            self.pool.borrow(asset, pool_borrow_total)?;
        }
        Ok(())
    }

    /// The repay waterfall: pool debt, then P2P backed by the borrow delta,
    /// promoted borrowers, demoted suppliers and finally the supply delta.
    fn apply_repay(
        &mut self,
        shard: &mut Shard,
        user: Address,
        asset: Asset,
        amount: U256,
        pool_supply_rate: U256,
        pool_borrow_rate: U256,
    ) -> Result<(), EngineError> {
        let mut pos = shard.borrow_of(user);
        let mut remaining = amount;
        let mut pool_repay_total = U256::ZERO;
        let mut pool_supply_total = U256::ZERO;

        let from_pool = min(remaining, pos.on_pool_underlying(pool_borrow_rate)?);
        if !from_pool.is_zero() {
            let units = min(
                to_scaled(from_pool, pool_borrow_rate, Rounding::Down)?,
                pos.on_pool,
            );
            pos.on_pool -= units;
            pool_repay_total += from_pool;
            remaining -= from_pool;
        }

        if !remaining.is_zero() {
            let p2p_units = min(
                to_scaled(remaining, shard.market.borrow_p2p_rate, Rounding::Down)?,
                pos.in_p2p,
            );
            pos.in_p2p -= p2p_units;
            shard.market.total_p2p_borrow =
                zero_floor_sub(shard.market.total_p2p_borrow, p2p_units);
        }
        shard.set_borrow(user, pos, pool_borrow_rate)?;

        if !remaining.is_zero() {
            let mut unfunded = remaining;

            if !shard.market.borrow_delta.is_zero() {
                let delta_underlying =
                    to_underlying(shard.market.borrow_delta, pool_borrow_rate, Rounding::Down)?;
                let matched = min(unfunded, delta_underlying);
                if !matched.is_zero() {
                    let units = min(
                        to_scaled(matched, pool_borrow_rate, Rounding::Up)?,
                        shard.market.borrow_delta,
                    );
                    shard.market.borrow_delta -= units;
                    pool_repay_total += matched;
                    unfunded -= matched;
                }
            }

            let mut budget = shard.market.max_iterations;
            if !unfunded.is_zero() {
                let promoted = shard.match_borrowers(pool_borrow_rate, unfunded, &mut budget)?;
                pool_repay_total += promoted;
                unfunded -= promoted;
            }
            if !unfunded.is_zero() {
                let demoted = shard.unmatch_suppliers(pool_supply_rate, unfunded, &mut budget)?;
                pool_supply_total += demoted;
                unfunded -= demoted;
            }
            if !unfunded.is_zero() {
                shard.market.supply_delta += to_scaled(unfunded, pool_supply_rate, Rounding::Down)?;
                pool_supply_total += unfunded;
            }
        }

        if !pool_repay_total.is_zero() {
            self.pool.repay(asset, pool_repay_total)?;
        }
        if !pool_supply_total.is_zero() {
            self.pool.supply(asset, pool_supply_total)?;
        }
        Ok(())
    }

    /// Whether the user has any debt on any market, with `overrides`
    /// substituting in-flight shard clones.
    fn has_outstanding_debt(&self, user: Address, overrides: &[(Asset, &Shard)]) -> bool {
        self.shards.iter().any(|(asset, stored)| {
            let shard = overrides
                .iter()
                .find(|(a, _)| a == asset)
                .map_or(stored, |(_, s)| *s);
            !shard.borrow_of(user).is_empty()
        })
    }

    /// Aggregate (collateral capacity, debt value) for the user across all
    /// markets, in oracle reference units. Collateral rounds down, debt
    /// rounds up.
    fn account_values(
        &self,
        user: Address,
        basis: RiskBasis,
        overrides: &[(Asset, &Shard)],
    ) -> Result<(U256, U256), EngineError> {
        let mut capacity = U256::ZERO;
        let mut debt = U256::ZERO;
        for (asset, stored) in &self.shards {
            let shard = overrides
                .iter()
                .find(|(a, _)| a == asset)
                .map_or(stored, |(_, s)| *s);
            let supply = shard.supply_of(user);
            let borrow = shard.borrow_of(user);
            if supply.is_empty() && borrow.is_empty() {
                continue;
            }
            let price = self
                .oracle
                .asset_price(*asset)
                .ok_or(EngineError::UnknownOraclePrice { asset: *asset })?;
            if !supply.is_empty() {
                let params = self
                    .oracle
                    .risk_params(*asset)
                    .ok_or(EngineError::UnknownRiskParams { asset: *asset })?;
                let factor = match basis {
                    RiskBasis::BorrowPower => params.collateral_factor,
                    RiskBasis::Liquidation => params.liquidation_threshold,
                };
                let pool_rate = self.pool.supply_exchange_rate(*asset)?;
                let underlying = supply.total_underlying(pool_rate, shard.market.supply_p2p_rate)?;
                capacity += wad_mul_down(wad_mul_down(underlying, price)?, factor)?;
            }
            if !borrow.is_empty() {
                let pool_rate = self.pool.borrow_exchange_rate(*asset)?;
                let on_pool = to_underlying(borrow.on_pool, pool_rate, Rounding::Up)?;
                let in_p2p =
                    to_underlying(borrow.in_p2p, shard.market.borrow_p2p_rate, Rounding::Up)?;
                debt += wad_mul_up(on_pool + in_p2p, price)?;
            }
        }
        Ok((capacity, debt))
    }
}
