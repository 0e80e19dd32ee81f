//! matchpool CLI - run matching scenarios against the P2P engine.

mod cli;
mod commands;
mod output;
mod scenario;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            commands::run(&args, cli.format)?;
        }
        Commands::Check(args) => {
            commands::check(&args)?;
        }
    }

    Ok(())
}
