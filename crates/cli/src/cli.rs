//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// matchpool CLI - run matching scenarios against the P2P engine
#[derive(Parser, Debug)]
#[command(name = "matchpool")]
#[command(about = "Scenario runner for the peer-to-peer matching engine", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a scenario file against a fresh engine
    Run(RunArgs),
    /// Validate a scenario file without executing it
    Check(CheckArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the scenario JSON file
    pub scenario: PathBuf,

    /// Pool flavor backing the engine
    #[arg(long, default_value = "exchange-rate")]
    pub pool: PoolFlavor,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Path to the scenario JSON file
    pub scenario: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum PoolFlavor {
    /// Units minted at a floating exchange rate
    ExchangeRate,
    /// Scaled balances under monotone liquidity/debt indexes
    Scaled,
}
