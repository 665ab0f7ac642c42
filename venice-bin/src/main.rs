//! Venice - Leader/Follower ingestion node
//!
//! Single binary that runs the Partition Ingestor state machine for a
//! set of configured store-versions against an external log transport
//! and membership oracle.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use clap::{Parser, Subcommand};
use tracing::info;
use anyhow::Result;

mod config;
mod server;

use server::IngestionServer;

#[derive(Parser)]
#[command(name = "venice")]
#[command(author, version, about = "Venice ingestion node", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ingestion node
    Server {
        /// Configuration file path
        #[arg(short, long, default_value = "/etc/venice/venice.toml")]
        config: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("venice=info".parse()?),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            info!("starting Venice ingestion node...");

            let config = config::load(&config).await?;
            let server = IngestionServer::new(config).await?;

            let shutdown = async {
                tokio::signal::ctrl_c().await.ok();
                info!("shutdown signal received");
            };

            tokio::select! {
                result = server.run() => result?,
                _ = shutdown => {
                    server.shutdown().await?;
                }
            }
        }

        Commands::Version => {
            println!("venice {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
