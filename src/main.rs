//! roamlink - route-driven agent messaging with server-to-server travel.

use clap::Parser;
use std::process::ExitCode;

use roamlink::cli::Commands;
use roamlink::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    // Keep the guard alive so the file writer flushes on exit.
    let _guard = match logging::init(args.json_logs) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
