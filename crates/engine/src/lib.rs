//! Peer-to-peer matching engine over a pooled lending protocol.
//!
//! This crate implements a P2P overlay for a pool-based lending market:
//! suppliers and borrowers of the same asset are matched directly against
//! each other whenever possible, giving both sides a rate between the
//! pool's supply and borrow rates, with any unmatched volume falling back
//! to the pool itself.
//!
//! # Overview
//!
//! - [`MatchingEngine`] runs supply, borrow, withdraw, repay and liquidate
//!   as bounded greedy-matching passes; each call visits at most
//!   `max_iterations` registry entries, with market-level deltas absorbing
//!   whatever the budget cannot rebalance.
//! - [`OrderedRegistry`] ranks participants per (market, side) by their
//!   on-pool balance, descending, oldest-first among equals.
//! - [`Market`] tracks the two P2P exchange rates, their per-block growth
//!   derived from pool rates, and the protocol's fee skim on the spread.
//! - [`PoolGateway`] and [`PriceOracle`] are the capability seams to the
//!   external pool and oracle; two in-memory pool flavors are provided.
//!
//! # Example
//!
//! ```rust
//! use alloy_primitives::{Address, U256};
//! use matchpool_rs_engine::{
//!     ExchangeRatePool, MarketParams, MatchingEngine, RiskParams, StaticOracle, RAY, WAD,
//! };
//!
//! let asset = Address::repeat_byte(1);
//! let collateral = Address::repeat_byte(2);
//! let supplier = Address::repeat_byte(3);
//! let borrower = Address::repeat_byte(4);
//!
//! let mut pool = ExchangeRatePool::new();
//! pool.list_asset(asset, RAY / U256::from(1_000_000), RAY / U256::from(500_000));
//! pool.list_asset(collateral, RAY / U256::from(1_000_000), RAY / U256::from(500_000));
//!
//! let mut oracle = StaticOracle::new(WAD / U256::from(2));
//! for a in [asset, collateral] {
//!     oracle.set_price(a, WAD);
//!     oracle.set_risk_params(
//!         a,
//!         RiskParams {
//!             collateral_factor: WAD * U256::from(8) / U256::from(10),
//!             liquidation_threshold: WAD * U256::from(85) / U256::from(100),
//!             liquidation_bonus: WAD / U256::from(10),
//!         },
//!     );
//! }
//!
//! let mut engine = MatchingEngine::new(pool, oracle);
//! engine.create_market(asset, MarketParams::default(), 0)?;
//! engine.create_market(collateral, MarketParams::default(), 0)?;
//!
//! // A supplier deposits 100; a collateralized borrower takes the whole
//! // amount, so both sides end up fully matched peer-to-peer.
//! engine.supply(supplier, asset, U256::from(100) * WAD, 0)?;
//! engine.supply(borrower, collateral, U256::from(200) * WAD, 0)?;
//! let position = engine.borrow(borrower, asset, U256::from(100) * WAD, 0)?;
//!
//! assert_eq!(position.on_pool, U256::ZERO);
//! assert_eq!(position.in_p2p, U256::from(100) * WAD);
//! # Ok::<(), matchpool_rs_engine::EngineError>(())
//! ```

pub mod engine;
pub mod error;
pub mod market;
pub mod math;
pub mod oracle;
pub mod pool;
pub mod position;
pub mod registry;

// Re-export commonly used types
pub use error::{Asset, EngineError};

// Engine exports
pub use engine::{AccountHealth, LiquidationOutcome, MatchingEngine};

// Market exports
pub use market::{Market, MarketParams};

// Math exports
pub use math::{Rounding, RAY, WAD};

// Oracle exports
pub use oracle::{PriceOracle, RiskParams, StaticOracle};

// Pool exports
pub use pool::{ExchangeRatePool, PoolError, PoolGateway, ScaledBalancePool};

// Position exports
pub use position::{AccountPosition, Position};

// Registry exports
pub use registry::OrderedRegistry;
