use anyhow::Result;
use clap::ArgMatches;

use scsketch::config::config_schema;

pub fn print_schema(_matches: &ArgMatches) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&config_schema())?);
    Ok(())
}
