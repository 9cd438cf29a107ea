//! Output formatting for utility commands

pub mod colors;

use anyhow::Result;
use serde_json::Value;

use crate::cli::Cli;

/// Print a JSON document, pretty when asked
pub fn print_json(cli: &Cli, value: &Value) -> Result<()> {
    if cli.pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
