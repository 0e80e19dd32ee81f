//! The run command: execute a scenario against a fresh engine.

use std::collections::HashMap;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use colored::Colorize;
use matchpool_rs_engine::{
    EngineError, ExchangeRatePool, MarketParams, MatchingEngine, PoolError, PoolGateway,
    RiskParams, ScaledBalancePool, StaticOracle,
};
use serde::Serialize;

use crate::cli::{OutputFormat, PoolFlavor, RunArgs};
use crate::output::{format_actions_table, format_markets_table, format_positions_table};
use crate::scenario::{
    name_to_address, parse_amount, price_to_wad, rate_to_ray, ratio_to_wad, Action, Scenario,
};

/// Pool construction and block advancement for scenario runs.
trait ScenarioPool: PoolGateway + Sized {
    fn build(scenario: &Scenario) -> Result<Self>;
    fn advance(&mut self, blocks: u64) -> Result<(), PoolError>;
}

impl ScenarioPool for ExchangeRatePool {
    fn build(scenario: &Scenario) -> Result<Self> {
        let mut pool = ExchangeRatePool::new();
        for asset in &scenario.assets {
            pool.list_asset(
                name_to_address(&asset.symbol),
                rate_to_ray(asset.supply_rate_per_block)?,
                rate_to_ray(asset.borrow_rate_per_block)?,
            );
        }
        Ok(pool)
    }

    fn advance(&mut self, blocks: u64) -> Result<(), PoolError> {
        self.advance_blocks(blocks)
    }
}

impl ScenarioPool for ScaledBalancePool {
    fn build(scenario: &Scenario) -> Result<Self> {
        let mut pool = ScaledBalancePool::new();
        for asset in &scenario.assets {
            pool.list_asset(
                name_to_address(&asset.symbol),
                rate_to_ray(asset.supply_rate_per_block)?,
                rate_to_ray(asset.borrow_rate_per_block)?,
                parse_amount(&asset.pool_liquidity)?,
            );
        }
        Ok(pool)
    }

    fn advance(&mut self, blocks: u64) -> Result<(), PoolError> {
        self.advance_blocks(blocks)
    }
}

#[derive(Debug, Serialize)]
pub struct ActionRecord {
    pub index: usize,
    pub action: String,
    pub ok: bool,
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct MarketRecord {
    pub asset: String,
    pub supply_p2p_rate: f64,
    pub borrow_p2p_rate: f64,
    pub total_p2p_supply: String,
    pub total_p2p_borrow: String,
    pub supply_delta: String,
    pub borrow_delta: String,
    pub protocol_fees: String,
}

#[derive(Debug, Serialize)]
pub struct PositionRecord {
    pub asset: String,
    pub user: String,
    pub supply_on_pool: String,
    pub supply_in_p2p: String,
    pub borrow_on_pool: String,
    pub borrow_in_p2p: String,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub actions: Vec<ActionRecord>,
    pub markets: Vec<MarketRecord>,
    pub positions: Vec<PositionRecord>,
}

pub fn run(args: &RunArgs, format: OutputFormat) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)?;
    let report = match args.pool {
        PoolFlavor::ExchangeRate => execute::<ExchangeRatePool>(&scenario)?,
        PoolFlavor::Scaled => execute::<ScaledBalancePool>(&scenario)?,
    };

    match format {
        OutputFormat::Table => print_report(&report),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report)?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn execute<P: ScenarioPool>(scenario: &Scenario) -> Result<Report> {
    let pool = P::build(scenario)?;
    let mut oracle = StaticOracle::new(ratio_to_wad(scenario.close_factor)?);
    for asset in &scenario.assets {
        let address = name_to_address(&asset.symbol);
        oracle.set_price(address, price_to_wad(asset.price)?);
        oracle.set_risk_params(
            address,
            RiskParams {
                collateral_factor: ratio_to_wad(asset.collateral_factor)?,
                liquidation_threshold: ratio_to_wad(asset.liquidation_threshold)?,
                liquidation_bonus: ratio_to_wad(asset.liquidation_bonus)?,
            },
        );
    }

    let mut engine = MatchingEngine::new(pool, oracle);
    for asset in &scenario.assets {
        let params = MarketParams {
            max_iterations: asset.market.max_iterations,
            fee_rate: ratio_to_wad(asset.market.fee_rate)?,
            p2p_cursor: ratio_to_wad(asset.market.p2p_cursor)?,
            dust: parse_amount(&asset.market.dust)?,
        };
        engine
            .create_market(name_to_address(&asset.symbol), params, 0)
            .with_context(|| format!("listing market {}", asset.symbol))?;
    }

    let mut block = 0u64;
    let mut user_names: HashMap<Address, String> = HashMap::new();
    let mut actions = Vec::with_capacity(scenario.actions.len());
    for (index, action) in scenario.actions.iter().enumerate() {
        let (ok, outcome) =
            match apply_action(&mut engine, action, &mut block, &mut user_names) {
                Ok(outcome) => (true, outcome),
                Err(error) => (false, format!("{error:#}")),
            };
        actions.push(ActionRecord {
            index,
            action: action.describe(),
            ok,
            outcome,
        });
    }

    let (markets, positions) = snapshot(&engine, scenario, &user_names)?;
    Ok(Report {
        actions,
        markets,
        positions,
    })
}

fn apply_action<P: ScenarioPool>(
    engine: &mut MatchingEngine<P, StaticOracle>,
    action: &Action,
    block: &mut u64,
    users: &mut HashMap<Address, String>,
) -> Result<String> {
    match action {
        Action::Supply { user, asset, amount } => {
            let pos = engine.supply(
                remember(users, user),
                name_to_address(asset),
                parse_amount(amount)?,
                *block,
            )?;
            Ok(format!("on pool {}, in p2p {}", pos.on_pool, pos.in_p2p))
        }
        Action::Borrow { user, asset, amount } => {
            let pos = engine.borrow(
                remember(users, user),
                name_to_address(asset),
                parse_amount(amount)?,
                *block,
            )?;
            Ok(format!("on pool {}, in p2p {}", pos.on_pool, pos.in_p2p))
        }
        Action::Withdraw { user, asset, amount } => {
            let pos = engine.withdraw(
                remember(users, user),
                name_to_address(asset),
                parse_amount(amount)?,
                *block,
            )?;
            Ok(format!("on pool {}, in p2p {}", pos.on_pool, pos.in_p2p))
        }
        Action::Repay { user, asset, amount } => {
            let pos = engine.repay(
                remember(users, user),
                name_to_address(asset),
                parse_amount(amount)?,
                *block,
            )?;
            Ok(format!("on pool {}, in p2p {}", pos.on_pool, pos.in_p2p))
        }
        Action::Liquidate {
            liquidator,
            borrower,
            borrowed,
            collateral,
            amount,
        } => {
            let outcome = engine.liquidate(
                remember(users, liquidator),
                name_to_address(borrowed),
                name_to_address(collateral),
                remember(users, borrower),
                parse_amount(amount)?,
                *block,
            )?;
            Ok(format!("repaid {}, seized {}", outcome.repaid, outcome.seized))
        }
        Action::Advance { blocks } => {
            engine
                .pool_mut()
                .advance(*blocks)
                .map_err(EngineError::from)?;
            *block += *blocks;
            Ok(format!("block is now {block}"))
        }
        Action::Refresh { asset } => {
            engine.refresh_rates(name_to_address(asset), *block)?;
            Ok("rates refreshed".to_string())
        }
        Action::SetPrice { asset, price } => {
            engine
                .oracle_mut()
                .set_price(name_to_address(asset), price_to_wad(*price)?);
            Ok(format!("price set to {price}"))
        }
    }
}

fn remember(users: &mut HashMap<Address, String>, name: &str) -> Address {
    let address = name_to_address(name);
    users.entry(address).or_insert_with(|| name.to_string());
    address
}

fn snapshot<P: ScenarioPool>(
    engine: &MatchingEngine<P, StaticOracle>,
    scenario: &Scenario,
    users: &HashMap<Address, String>,
) -> Result<(Vec<MarketRecord>, Vec<PositionRecord>)> {
    let mut markets = Vec::new();
    let mut positions = Vec::new();
    for asset in &scenario.assets {
        let address = name_to_address(&asset.symbol);
        let market = engine.market(address)?;
        markets.push(MarketRecord {
            asset: asset.symbol.clone(),
            supply_p2p_rate: rate_to_f64(market.supply_p2p_rate),
            borrow_p2p_rate: rate_to_f64(market.borrow_p2p_rate),
            total_p2p_supply: market.total_p2p_supply.to_string(),
            total_p2p_borrow: market.total_p2p_borrow.to_string(),
            supply_delta: market.supply_delta.to_string(),
            borrow_delta: market.borrow_delta.to_string(),
            protocol_fees: market.protocol_fees.to_string(),
        });
        for (user, pos) in engine.account_positions(address)? {
            let user = users
                .get(&user)
                .cloned()
                .unwrap_or_else(|| user.to_string());
            positions.push(PositionRecord {
                asset: asset.symbol.clone(),
                user,
                supply_on_pool: pos.supply.on_pool.to_string(),
                supply_in_p2p: pos.supply.in_p2p.to_string(),
                borrow_on_pool: pos.borrow.on_pool.to_string(),
                borrow_in_p2p: pos.borrow.in_p2p.to_string(),
            });
        }
    }
    Ok((markets, positions))
}

fn rate_to_f64(rate: alloy_primitives::U256) -> f64 {
    rate.saturating_to::<u128>() as f64 / 1e27
}

fn print_report(report: &Report) {
    println!("{}", "Actions".bold());
    println!("{}", format_actions_table(&report.actions));
    println!();
    println!("{}", "Markets".bold());
    println!("{}", format_markets_table(&report.markets));
    println!();
    println!("{}", "Positions".bold());
    println!("{}", format_positions_table(&report.positions));

    let failures = report.actions.iter().filter(|a| !a.ok).count();
    if failures > 0 {
        println!();
        println!("{}", format!("{failures} action(s) failed").red());
    }
}
