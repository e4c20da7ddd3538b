use std::process::ExitCode;

use clap::Parser;

use arbiter::cli::{Cli, execute, load_config};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = arbiter::observability::init_tracing(&config.logging) {
        eprintln!("warning: failed to initialise logging: {e}");
    }
    if let Err(e) = arbiter::observability::init_metrics(config.metrics_port) {
        tracing::warn!("metrics exporter disabled: {e}");
    }

    match execute(cli, &config).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
