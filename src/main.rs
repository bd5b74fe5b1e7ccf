mod cli;
mod config;
mod error;
mod git;
mod mux;
mod ports;
mod pty;
mod session;
mod status;
mod store;
mod web;

use anyhow::Result;
use clap::Parser;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("berth=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    cli::run(cli).await
}
