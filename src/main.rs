//! Tryjob reconciler CLI entry point.

use clap::Parser;

use tryjob_reconciler::cli::commands::{self, load_config};
use tryjob_reconciler::cli::{exit_code, handle_error, Cli, Commands};
use tryjob_reconciler::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => handle_error(err, cli.json),
    };

    let logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, config, cli.json).await.map(exit_code),
        Commands::Config(_) => commands::config::execute(config, cli.json).map(|()| 0),
        Commands::Shards(args) => commands::shards::execute(&args, cli.json).map(|()| 0),
    };

    match result {
        Ok(code) => {
            drop(logger);
            std::process::exit(code);
        }
        Err(err) => handle_error(err, cli.json),
    }
}
