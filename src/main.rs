use anyhow::Result;
use clap::Parser;

use mcp_hub_gateway::cli::Cli;
use mcp_hub_gateway::server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    if let Err(reason) = cli.validate() {
        eprintln!("error: {reason}");
        std::process::exit(2);
    }

    server::run(cli).await
}
