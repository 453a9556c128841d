//! voldr - master volume provisioner
//!
//! Runs one workflow invocation per process: the trigger payload is read from
//! a file or stdin, the result is printed to stdout as
//! `{"error": ..., "result": ...}`, and logs go to stderr as JSON.
//!
//! The compute provider is the in-process simulation, whose state is loaded
//! from and saved back to the `--cloud-state` fixture around each run.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
