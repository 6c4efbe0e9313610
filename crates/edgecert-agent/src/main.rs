use anyhow::Result;
use clap::Parser;
use edgecert_agent::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    Cli::parse().run().await
}
