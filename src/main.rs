use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::Server;

mod command;
mod config;
mod connection;
mod data;
mod rdb;
mod replica;
mod resp;
mod server;
mod store;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let config = Config::parse();
    info!(port = config.port, replica = config.is_replica(), "starting");

    let server = Server::new(config);
    server.initialize().await;
    let listener = server.listen().await?;
    server.serve(listener).await
}
