//! The check command: validate a scenario file without executing it.

use anyhow::Result;
use colored::Colorize;

use crate::cli::CheckArgs;
use crate::scenario::Scenario;

pub fn check(args: &CheckArgs) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)?;
    println!(
        "{} {} asset(s), {} action(s)",
        "Scenario OK:".green().bold(),
        scenario.assets.len(),
        scenario.actions.len()
    );
    Ok(())
}
