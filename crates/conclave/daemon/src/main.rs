//! `conclaved`: serves the substrate API, or runs one operator command and
//! prints its result as JSON.

use anyhow::Context;
use clap::Parser;
use conclave_daemon::{cli, Cli, Command, Server};
use conclave_substrate::{telemetry, Substrate, SubstrateConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SubstrateConfig::load(cli.config.as_deref())
        .context("loading configuration")?;
    cli.apply(&mut config)?;
    telemetry::init(&config.logging)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                listen = %config.server.listen_addr,
                "Starting conclaved"
            );
            Server::new(config).await?.run().await?;
        }
        command => {
            let substrate = Substrate::open(config)
                .await
                .context("opening the substrate")?;
            let output = cli::run_operator(&substrate, &command).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}
