use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_agent::run(mcp_agent::Cli::parse()).await
}
