//! Output formatting.

mod table;

pub use table::{format_actions_table, format_markets_table, format_positions_table};
