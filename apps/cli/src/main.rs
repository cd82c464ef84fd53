//! starload CLI: batch ETL for the Olist marketplace dataset.
//!
//! Fetches the raw export, bulk-loads and cleans it, and rebuilds a star
//! schema with analytical views and a validation report on top.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
