//! In-memory relay for local development

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use draftsync::relay::Relay;
use draftsync::SyncConfig;

#[derive(Parser)]
#[command(name = "draftsync-relay", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (only `relay_addr` is used)
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = SyncConfig::load(cli.config.as_deref())?;
    let addr = cli.addr.unwrap_or(config.relay_addr);

    Relay::new()
        .serve_until(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
