use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use crate::config::Config;
use crate::orchestrator::Orchestrator;

mod admin;
mod child;
mod config;
mod forwarder;
mod function_list;
mod orchestrator;
mod proxy;
mod retry;
mod supervisor;

/// nexer is an on-demand TCP reverse proxy: it keeps an application stopped
/// until a connection actually needs it, starts it, waits for readiness,
/// then forwards the connection through.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {}

fn config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".nexer").join("nexer.conf"))
}

fn init_logging(logger: &config::LoggerConfig) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(logger.level);

    if let Some(path) = &logger.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let _args = Args::parse();

    let path = config_path()?;
    let config = Config::parse_file(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    init_logging(&config.logger)?;

    info!("loaded config from {}", path.display());

    let orchestrator = Orchestrator::new(config);
    if let Err(e) = orchestrator.run().await {
        error!("nexer exited with error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}
