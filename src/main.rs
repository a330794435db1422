use anyhow::Context;
use clap::Parser;
use mushd_lib::{init_logging, ServerConfig};
use std::path::PathBuf;

/// A persistent multi-user MUSH server
#[derive(Debug, Parser)]
#[command(name = "mushd", version, about)]
struct Cli {
    /// Address to listen on, e.g. 0.0.0.0:2222
    listen_addr: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the world snapshot and backups
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration {:?}", cli.config))?;
    if let Some(addr) = cli.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    config.validate()?;

    init_logging(&config.log_level);

    let saved = mushd_lib::run(config).await.context("server failed")?;
    tracing::info!("World saved to {}", saved.display());
    Ok(())
}
