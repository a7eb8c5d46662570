mod cli;
mod commands;
mod render;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    queuectl_observability::init();

    commands::run(cli).await
}
