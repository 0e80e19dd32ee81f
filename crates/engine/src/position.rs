//! Position tracking for one user on one side of a market.

use alloy_primitives::U256;

use crate::error::EngineError;
use crate::math::{to_underlying, Rounding};

/// One user's balance on one side (supply or borrow) of a market.
///
/// `on_pool` is held in the pool's own scaled units and converts to
/// underlying through the pool's exchange rate; `in_p2p` is held in P2P
/// units and converts through the market's P2P rate for that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    /// Balance deposited into or borrowed from the pool, in pool units
    pub on_pool: U256,
    /// Balance matched peer-to-peer, in P2P units
    pub in_p2p: U256,
}

impl Position {
    /// Whether both components are zero.
    pub fn is_empty(&self) -> bool {
        self.on_pool.is_zero() && self.in_p2p.is_zero()
    }

    /// Underlying value of the on-pool component, rounded down.
    pub fn on_pool_underlying(&self, pool_rate: U256) -> Result<U256, EngineError> {
        to_underlying(self.on_pool, pool_rate, Rounding::Down)
    }

    /// Underlying value of the P2P component, rounded down.
    pub fn in_p2p_underlying(&self, p2p_rate: U256) -> Result<U256, EngineError> {
        to_underlying(self.in_p2p, p2p_rate, Rounding::Down)
    }

    /// Total underlying value of the position, rounded down per component.
    pub fn total_underlying(&self, pool_rate: U256, p2p_rate: U256) -> Result<U256, EngineError> {
        let on_pool = self.on_pool_underlying(pool_rate)?;
        let in_p2p = self.in_p2p_underlying(p2p_rate)?;
        on_pool
            .checked_add(in_p2p)
            .ok_or(EngineError::ArithmeticOverflow)
    }
}

/// A user's supply and borrow positions on one market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountPosition {
    /// The supply-side position
    pub supply: Position,
    /// The borrow-side position
    pub borrow: Position,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::RAY;

    #[test]
    fn test_empty() {
        assert!(Position::default().is_empty());
        let pos = Position {
            on_pool: U256::from(1),
            in_p2p: U256::ZERO,
        };
        assert!(!pos.is_empty());
    }

    #[test]
    fn test_underlying_at_unit_rates() {
        let pos = Position {
            on_pool: U256::from(40),
            in_p2p: U256::from(60),
        };
        assert_eq!(pos.on_pool_underlying(RAY), Ok(U256::from(40)));
        assert_eq!(pos.in_p2p_underlying(RAY), Ok(U256::from(60)));
        assert_eq!(pos.total_underlying(RAY, RAY), Ok(U256::from(100)));
    }

    #[test]
    fn test_underlying_grows_with_rate() {
        let pos = Position {
            on_pool: U256::ZERO,
            in_p2p: U256::from(100),
        };
        // Rate at 1.5 values 100 units at 150 underlying
        let rate = RAY + RAY / U256::from(2);
        assert_eq!(pos.in_p2p_underlying(rate), Ok(U256::from(150)));
    }
}
