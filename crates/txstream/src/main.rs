//! tx-stream CLI: consume transactions from Kafka into the document store.

use std::process::ExitCode;

use clap::Parser;
use tracing::{Instrument, error, info};

use txstream::{CliArgs, Config, init_tracing, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let span = init_tracing(&config.logger, &config.application);

    async move {
        info!(config = %args.config.display(), "Starting tx-stream");

        match run(config).await {
            Ok(()) => {
                info!("Shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "tx-stream failed");
                ExitCode::FAILURE
            }
        }
    }
    .instrument(span)
    .await
}
