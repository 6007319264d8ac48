//! kfsd - TCP front for the in-memory reference KCD.

use anyhow::{Context, Result};
use clap::Parser;
use kanp::server::Kcd;
use kanp::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kfsd", version, about = "In-memory KCD for KFS transfers")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.listen
    #[arg(short, long, env = "KFSD_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    config.validate()?;

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    info!(addr = %config.server.listen, "kfsd listening");

    let kcd = Kcd::new(config.server);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("Failed to accept connection")?;
                let kcd = kcd.clone();
                tokio::spawn(async move {
                    info!(%peer, "session started");
                    if let Err(e) = kcd.serve(socket).await {
                        warn!(%peer, "session ended with error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
