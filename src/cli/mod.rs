//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::models::BuildStatus;

#[derive(Parser, Debug)]
#[command(name = "tryjob-reconciler")]
#[command(about = "Run, retry and reconcile the test suites of a try job", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file; defaults to .tryjob/config.yaml and .tryjob/local.yaml
    #[arg(short, long, global = true, env = "TRYJOB_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile a try job described by a scenario file
    Run(commands::run::RunArgs),

    /// Show the effective configuration
    Config(commands::config::ConfigArgs),

    /// Compute the shard count of a retry
    Shards(commands::shards::ShardsArgs),
}

/// Process exit code for a build verdict.
pub const fn exit_code(status: BuildStatus) -> i32 {
    match status {
        BuildStatus::Success => 0,
        BuildStatus::Failure => 1,
        BuildStatus::InfraFailure => 2,
    }
}

/// Report a command error and exit with the infrastructure failure code.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let error_json = serde_json::json!({
            "status": BuildStatus::InfraFailure.as_str(),
            "error": format!("{err:#}"),
        });
        println!("{}", serde_json::to_string_pretty(&error_json).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(exit_code(BuildStatus::InfraFailure));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["tryjob-reconciler", "--json", "run", "scenario.yaml"]).expect("parse");
        assert!(cli.json);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.scenario, PathBuf::from("scenario.yaml")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(BuildStatus::Success), 0);
        assert_eq!(exit_code(BuildStatus::Failure), 1);
        assert_eq!(exit_code(BuildStatus::InfraFailure), 2);
    }
}
