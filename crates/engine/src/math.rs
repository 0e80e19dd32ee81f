//! Fixed-point arithmetic over `U256`.
//!
//! All balances and rates in the engine are scaled integers: exchange rates
//! and indexes are RAY-scaled (1e27, 1.0 = `RAY`), percentage-style ratios
//! (fees, collateral factors, the close factor) are WAD-scaled (1e18).
//! Every operation is checked and the rounding direction is explicit at the
//! call site, so each conversion can be rounded in the direction that favors
//! the protocol.

use alloy_primitives::U256;

use crate::error::EngineError;

/// WAD scale (1e18), used for percentage-style ratios.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// RAY scale (1e27), used for exchange rates and indexes.
pub const RAY: U256 = U256::from_limbs([11_515_845_246_265_065_472, 54_210_108, 0, 0]);

/// Rounding direction for a scaled conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Round toward zero
    Down,
    /// Round away from zero
    Up,
}

/// Returns `a * b / denominator`, rounded down.
pub fn mul_div_down(a: U256, b: U256, denominator: U256) -> Result<U256, EngineError> {
    if denominator.is_zero() {
        return Err(EngineError::DivisionByZero);
    }
    let product = a.checked_mul(b).ok_or(EngineError::ArithmeticOverflow)?;
    Ok(product / denominator)
}

/// Returns `a * b / denominator`, rounded up.
pub fn mul_div_up(a: U256, b: U256, denominator: U256) -> Result<U256, EngineError> {
    if denominator.is_zero() {
        return Err(EngineError::DivisionByZero);
    }
    let product = a.checked_mul(b).ok_or(EngineError::ArithmeticOverflow)?;
    let floor = product / denominator;
    if product % denominator == U256::ZERO {
        Ok(floor)
    } else {
        floor
            .checked_add(U256::from(1))
            .ok_or(EngineError::ArithmeticOverflow)
    }
}

/// Returns `a * b / denominator` with the given rounding direction.
pub fn mul_div(a: U256, b: U256, denominator: U256, rounding: Rounding) -> Result<U256, EngineError> {
    match rounding {
        Rounding::Down => mul_div_down(a, b, denominator),
        Rounding::Up => mul_div_up(a, b, denominator),
    }
}

/// WAD-scaled multiply, rounded down.
pub fn wad_mul_down(a: U256, b: U256) -> Result<U256, EngineError> {
    mul_div_down(a, b, WAD)
}

/// WAD-scaled multiply, rounded up.
pub fn wad_mul_up(a: U256, b: U256) -> Result<U256, EngineError> {
    mul_div_up(a, b, WAD)
}

/// RAY-scaled multiply, rounded down.
pub fn ray_mul_down(a: U256, b: U256) -> Result<U256, EngineError> {
    mul_div_down(a, b, RAY)
}

/// RAY-scaled multiply, rounded up.
pub fn ray_mul_up(a: U256, b: U256) -> Result<U256, EngineError> {
    mul_div_up(a, b, RAY)
}

/// Converts an underlying amount into scaled units at a RAY exchange rate.
///
/// `units = amount * RAY / rate`. Credits to a user round down, debts round
/// up, so the remainder always strands with the protocol.
pub fn to_scaled(amount: U256, rate: U256, rounding: Rounding) -> Result<U256, EngineError> {
    mul_div(amount, RAY, rate, rounding)
}

/// Converts scaled units back into an underlying amount at a RAY exchange
/// rate: `amount = units * rate / RAY`.
pub fn to_underlying(units: U256, rate: U256, rounding: Rounding) -> Result<U256, EngineError> {
    mul_div(units, rate, RAY, rounding)
}

/// Returns the smaller of two values.
pub fn min(a: U256, b: U256) -> U256 {
    if a < b {
        a
    } else {
        b
    }
}

/// Returns the larger of two values.
pub fn max(a: U256, b: U256) -> U256 {
    if a > b {
        a
    } else {
        b
    }
}

/// Returns `a - b`, floored at zero.
pub fn zero_floor_sub(a: U256, b: U256) -> U256 {
    a.saturating_sub(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_div_rounding() {
        let a = U256::from(10);
        let b = U256::from(10);
        let d = U256::from(3);

        assert_eq!(mul_div_down(a, b, d), Ok(U256::from(33)));
        assert_eq!(mul_div_up(a, b, d), Ok(U256::from(34)));

        // Exact division rounds the same both ways
        let e = U256::from(4);
        assert_eq!(mul_div_down(a, b, e), Ok(U256::from(25)));
        assert_eq!(mul_div_up(a, b, e), Ok(U256::from(25)));
    }

    #[test]
    fn test_mul_div_zero_denominator() {
        let r = mul_div_down(U256::from(1), U256::from(1), U256::ZERO);
        assert_eq!(r, Err(EngineError::DivisionByZero));
    }

    #[test]
    fn test_mul_div_overflow() {
        let r = mul_div_down(U256::MAX, U256::from(2), U256::from(1));
        assert_eq!(r, Err(EngineError::ArithmeticOverflow));
    }

    #[test]
    fn test_scaled_round_trip_never_gains() {
        // underlying -> units (down) -> underlying (down) never exceeds the input
        let rate = RAY + RAY / U256::from(7); // an uneven rate
        for amount in [1u64, 99, 1_000_000_007, 123_456_789_123_456_789] {
            let amount = U256::from(amount);
            let units = to_scaled(amount, rate, Rounding::Down).unwrap();
            let back = to_underlying(units, rate, Rounding::Down).unwrap();
            assert!(back <= amount);
        }
    }

    #[test]
    fn test_scaled_identity_at_unit_rate() {
        let amount = U256::from(1_000_000);
        assert_eq!(to_scaled(amount, RAY, Rounding::Down), Ok(amount));
        assert_eq!(to_underlying(amount, RAY, Rounding::Up), Ok(amount));
    }

    #[test]
    fn test_zero_floor_sub() {
        assert_eq!(zero_floor_sub(U256::from(5), U256::from(3)), U256::from(2));
        assert_eq!(zero_floor_sub(U256::from(3), U256::from(5)), U256::ZERO);
    }

    #[test]
    fn test_wad_mul() {
        // 50% of 200 = 100
        let half = WAD / U256::from(2);
        assert_eq!(wad_mul_down(U256::from(200), half), Ok(U256::from(100)));
    }
}
