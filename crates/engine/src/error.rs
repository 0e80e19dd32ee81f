//! Error types for the matching engine.

use alloy_primitives::{Address, U256};
use thiserror::Error;

use crate::pool::PoolError;

/// Type alias for an asset identifier. One listed asset is one market.
pub type Asset = Address;

/// Errors that can occur while operating the matching engine.
///
/// Validation and solvency errors are rejected before any state mutation;
/// arithmetic errors indicate a logic defect and are never reachable through
/// well-formed inputs. Every error aborts the whole call and leaves engine
/// state untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The asset has no created market
    #[error("market {asset} is not listed")]
    MarketNotListed { asset: Asset },

    /// A market already exists for the asset
    #[error("market {asset} is already listed")]
    MarketAlreadyListed { asset: Asset },

    /// Supply and borrow require a nonzero amount
    #[error("amount must be nonzero")]
    ZeroAmount,

    /// The amount is below the market's dust threshold
    #[error("amount {amount} is below the dust threshold {dust}")]
    AmountBelowDust { amount: U256, dust: U256 },

    /// The user's position cannot cover the requested amount
    #[error("insufficient position for user {user} in market {asset}")]
    InsufficientPosition { user: Address, asset: Asset },

    /// The user's aggregate collateral does not cover their debt
    #[error("insufficient collateral for user {user}: debt {debt_value} exceeds capacity {borrow_capacity}")]
    InsufficientCollateral {
        user: Address,
        debt_value: U256,
        borrow_capacity: U256,
    },

    /// Liquidation attempted on a position above the liquidation threshold
    #[error("borrower {borrower} is healthy and cannot be liquidated")]
    BorrowerHealthy { borrower: Address },

    /// Liquidation repay amount exceeds the close-factor limit
    #[error("repay amount {amount} exceeds the close factor limit {max_repay}")]
    RepayExceedsCloseFactor { amount: U256, max_repay: U256 },

    /// The oracle has no price for the asset
    #[error("oracle price unknown for asset {asset}")]
    UnknownOraclePrice { asset: Asset },

    /// The oracle has no risk parameters for the asset
    #[error("risk parameters unknown for asset {asset}")]
    UnknownRiskParams { asset: Asset },

    /// Accrual was attempted with a block before the last update
    #[error("invalid accrual: block {block} is before last update {last_update}")]
    InvalidAccrualBlock { block: u64, last_update: u64 },

    /// A computation left the numeric domain. Fatal: unreachable for
    /// well-formed inputs.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// Division by zero. Fatal: unreachable for well-formed inputs.
    #[error("division by zero")]
    DivisionByZero,

    /// The pool gateway rejected an operation
    #[error("pool gateway: {0}")]
    Pool(#[from] PoolError),
}
