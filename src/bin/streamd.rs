//! streamd - vehicle stream relay daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Registers detector backends
//! 3. Serves the control API that starts and stops stream sessions
//! 4. Stops every session on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use vehicle_relay::{
    api::{ApiConfig, ApiServer},
    config::StreamdConfig,
    BackendRegistry, DefaultPipelineFactory, StreamRegistry,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Detect, track and count vehicles on live streams; relay annotated video over RTSP"
)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "STREAMD_CONFIG")]
    config: Option<PathBuf>,

    /// Control API listen address (overrides the configuration).
    #[arg(long)]
    api_addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = StreamdConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }

    let mut detectors = BackendRegistry::with_builtin();
    if let Some(name) = &config.detector {
        detectors.set_default(name)?;
    }
    log::info!(
        "detector backend: {}",
        detectors.default_name().unwrap_or("none")
    );

    let pipelines = DefaultPipelineFactory::new(
        Arc::new(detectors),
        config.tracker,
        config.pipeline.clone(),
    );
    let registry = Arc::new(StreamRegistry::new(
        config.registry_settings(),
        Arc::new(pipelines),
    ));

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        Arc::clone(&registry),
    )
    .spawn()?;
    log::info!(
        "streamd running. relay host {}, fifo dir {}",
        config.relay.host,
        config.relay.fifo_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("streamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    api_handle.stop()?;
    registry.stop_all();

    Ok(())
}
