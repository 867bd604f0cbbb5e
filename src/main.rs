//! screenlink-core - Main entry point
//!
//! Connects to the control server and serves stream and input requests
//! until interrupted.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info};
use screenlink_core::DeviceAgent;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration; command-line flags win over the file
    let config = args.load_config()?;

    // Initialize logging with noise filtering for third-party crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("SCREENLINK_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("tungstenite", log::LevelFilter::Warn)
        .init();

    info!("screenlink-core v{}", env!("CARGO_PKG_VERSION"));
    if args.config.exists() {
        info!("Loaded configuration from {:?}", args.config);
    } else {
        info!("No configuration at {:?}, using defaults", args.config);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    DeviceAgent::new(config).run().await
}
