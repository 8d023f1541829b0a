use clap::Command;

pub const SCHEMA_CMD: &str = "schema";

pub fn create_schema_cli() -> Command {
    Command::new(SCHEMA_CMD).about("Print the JSON schema of the pipeline configuration.")
}
