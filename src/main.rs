use clap::Parser;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};

use swarmkeeper::cli::{Cli, CliHandler};
use swarmkeeper::{logging, ClusterError, Config};

async fn run(cli: Cli) -> Result<(), ClusterError> {
    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config.logging, cli.log_level.as_deref(), cli.command.is_daemon())?;

    // Setup Ctrl+C handler
    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Stop requested, finishing the current cycle");
        let _ = stop_tx.send(true);
    })?;

    let handler = CliHandler::new(config)?;
    handler.execute(&cli.command, stop_rx).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
