use clap::{Arg, ArgAction, Command, arg, value_parser};

pub const RUN_CMD: &str = "run";
pub const DEFAULT_OUT: &str = "scsketch_out";

pub fn create_run_cli() -> Command {
    Command::new(RUN_CMD)
        .about("Run QC, sketching, integration and projection over a set of sample directories.")
        .arg(arg!(--config <config> "Pipeline configuration (toml, yaml or json)").required(false))
        .arg(arg!(--output <output> "Output directory").required(false))
        .arg(
            arg!(--doublets <doublets> "Directory of <sample_id>.tsv doublet calls")
                .required(false),
        )
        .arg(
            arg!(--threads <threads> "Worker threads")
                .required(false)
                .value_parser(value_parser!(usize)),
        )
        .arg(
            arg!(--progress "Show per-sample progress bars")
                .action(ArgAction::SetTrue),
        )
        .arg(
            arg!(--compress "Gzip the TSV outputs")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("samples")
                .help("Sample directories, each holding a Matrix Market triple")
                .num_args(1..)
                .required(true),
        )
}
