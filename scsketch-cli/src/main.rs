mod run;
mod schema;

use anyhow::Result;
use clap::{Arg, ArgAction, Command};

pub mod consts {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const BIN_NAME: &str = "scsketch";
}

fn build_parser() -> Command {
    Command::new(consts::BIN_NAME)
        .bin_name(consts::BIN_NAME)
        .version(consts::VERSION)
        .about("Quality control, leverage-score sketching and batch integration of multi-sample single-cell count matrices.")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .help("Log per-block and per-iteration detail")
                .action(ArgAction::SetTrue),
        )
        .subcommand(run::cli::create_run_cli())
        .subcommand(schema::cli::create_schema_cli())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

fn main() -> Result<()> {
    let app = build_parser();
    let matches = app.get_matches();
    init_logging(matches.get_flag("verbose"));

    match matches.subcommand() {
        //
        // RUN THE PIPELINE
        //
        Some((run::cli::RUN_CMD, matches)) => {
            run::handlers::run_pipeline(matches)?;
        }

        //
        // CONFIG SCHEMA
        //
        Some((schema::cli::SCHEMA_CMD, matches)) => {
            schema::handlers::print_schema(matches)?;
        }

        _ => unreachable!("Subcommand not found"),
    };

    Ok(())
}
