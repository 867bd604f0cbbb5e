use clap::Parser;
use std::path::PathBuf;

use screenlink_core::config::{CaptureSourceKind, Config};

#[derive(Parser, Debug)]
#[command(name = "screenlink-core")]
#[command(version)]
#[command(about = "Device screen streaming and remote input agent", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/screenlink.toml")]
    pub config: PathBuf,

    /// Control server URL (ws:// or wss://)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Device id announced at registration
    #[arg(long)]
    pub device_id: Option<String>,

    /// Device display name
    #[arg(long)]
    pub device_name: Option<String>,

    /// Registration token
    #[arg(long)]
    pub token: Option<String>,

    /// Screen width
    #[arg(long)]
    pub width: Option<u32>,

    /// Screen height
    #[arg(long)]
    pub height: Option<u32>,

    /// Capture source (x11 or synthetic)
    #[arg(long)]
    pub source: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    /// Load the file configuration and apply command-line overrides
    pub fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = Config::load(&self.config)?;
        self.apply(&mut config)?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut Config) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(ref url) = self.server {
            config.server.url = url.clone();
        }
        if let Some(ref id) = self.device_id {
            config.device.id = id.clone();
        }
        if let Some(ref name) = self.device_name {
            config.device.name = name.clone();
        }
        if let Some(ref token) = self.token {
            config.device.token = token.clone();
        }
        if let Some(width) = self.width {
            config.device.width = width;
        }
        if let Some(height) = self.height {
            config.device.height = height;
        }
        if let Some(ref source) = self.source {
            config.capture.source = CaptureSourceKind::parse(source)
                .ok_or_else(|| format!("Unknown capture source: {}", source))?;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        Ok(())
    }
}
