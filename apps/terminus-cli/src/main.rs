//! Terminus CLI binary entry point.
//!
//! Parses command-line arguments with clap and runs a single session via
//! [`Cli::run`]. Tracing is initialized inside `run`, once the logs
//! directory has been validated and created.

mod cli;
mod logging;

use std::process::ExitCode;

use clap::Parser;
use terminus_core::SessionFailure;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("\n✗ Error: {err}");
            if let Some(teardown) = err
                .downcast_ref::<SessionFailure>()
                .and_then(SessionFailure::teardown_error)
            {
                eprintln!("  note: cleanup also failed: {teardown}");
            }
            ExitCode::FAILURE
        }
    }
}
