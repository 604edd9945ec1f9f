use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use log::info;

use dbsli::{SliEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML configuration file; environment variables take precedence
    #[clap(short, long, env = "DBSLI_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;

    telemetry::init_metrics()?;

    // build.rs compiles dbsli-ebpf and leaves the object in $OUT_DIR/dbsli
    let engine = SliEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/dbsli")),
    )?;
    info!("dbsli loaded");

    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
