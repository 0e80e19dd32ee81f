//! Table formatting for scenario reports.

use tabled::{settings::Style, Table, Tabled};

use crate::commands::run::{ActionRecord, MarketRecord, PositionRecord};

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

#[derive(Tabled)]
struct MarketRow {
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "Supply P2P rate")]
    supply_rate: String,
    #[tabled(rename = "Borrow P2P rate")]
    borrow_rate: String,
    #[tabled(rename = "In P2P (supply)")]
    p2p_supply: String,
    #[tabled(rename = "In P2P (borrow)")]
    p2p_borrow: String,
    #[tabled(rename = "Supply delta")]
    supply_delta: String,
    #[tabled(rename = "Borrow delta")]
    borrow_delta: String,
    #[tabled(rename = "Fees")]
    fees: String,
}

#[derive(Tabled)]
struct PositionRow {
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Supply on pool")]
    supply_on_pool: String,
    #[tabled(rename = "Supply in P2P")]
    supply_in_p2p: String,
    #[tabled(rename = "Borrow on pool")]
    borrow_on_pool: String,
    #[tabled(rename = "Borrow in P2P")]
    borrow_in_p2p: String,
}

fn format_rate(rate: f64) -> String {
    format!("{rate:.6}")
}

pub fn format_actions_table(actions: &[ActionRecord]) -> String {
    if actions.is_empty() {
        return "No actions.".to_string();
    }
    let rows: Vec<ActionRow> = actions
        .iter()
        .map(|record| ActionRow {
            index: record.index,
            action: record.action.clone(),
            status: if record.ok { "ok" } else { "failed" }.to_string(),
            outcome: record.outcome.clone(),
        })
        .collect();
    Table::new(rows).with(Style::modern()).to_string()
}

pub fn format_markets_table(markets: &[MarketRecord]) -> String {
    if markets.is_empty() {
        return "No markets.".to_string();
    }
    let rows: Vec<MarketRow> = markets
        .iter()
        .map(|record| MarketRow {
            asset: record.asset.clone(),
            supply_rate: format_rate(record.supply_p2p_rate),
            borrow_rate: format_rate(record.borrow_p2p_rate),
            p2p_supply: record.total_p2p_supply.clone(),
            p2p_borrow: record.total_p2p_borrow.clone(),
            supply_delta: record.supply_delta.clone(),
            borrow_delta: record.borrow_delta.clone(),
            fees: record.protocol_fees.clone(),
        })
        .collect();
    Table::new(rows).with(Style::modern()).to_string()
}

pub fn format_positions_table(positions: &[PositionRecord]) -> String {
    if positions.is_empty() {
        return "No positions.".to_string();
    }
    let rows: Vec<PositionRow> = positions
        .iter()
        .map(|record| PositionRow {
            asset: record.asset.clone(),
            user: record.user.clone(),
            supply_on_pool: record.supply_on_pool.clone(),
            supply_in_p2p: record.supply_in_p2p.clone(),
            borrow_on_pool: record.borrow_on_pool.clone(),
            borrow_in_p2p: record.borrow_in_p2p.clone(),
        })
        .collect();
    Table::new(rows).with(Style::modern()).to_string()
}
