//! Configuration management

use crate::stream::StreamTarget;
use crate::transport::StreamMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub clipboard: ClipboardConfig,

    #[serde(default)]
    pub webrtc: WebRTCConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control server WebSocket URL
    #[serde(default = "default_server_url")]
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

/// Identity and screen geometry announced at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id; generated at startup when empty
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_device_name")]
    pub name: String,

    /// Registration token
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Display density (dpi)
    #[serde(default = "default_density")]
    pub density: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_device_name(),
            token: String::new(),
            width: default_width(),
            height: default_height(),
            density: default_density(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Mode used when `stream.start` names none
    #[serde(default = "default_mode")]
    pub default_mode: StreamMode,

    /// MJPEG quality (1-100)
    #[serde(default = "default_mjpeg_quality")]
    pub mjpeg_quality: u8,

    /// MJPEG frame rate cap
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,

    /// H.264 target bitrate (bps)
    #[serde(default = "default_h264_bitrate")]
    pub h264_bitrate: u32,

    #[serde(default = "default_h264_fps")]
    pub h264_fps: u32,

    /// Adapt the quality level to congestion
    #[serde(default = "default_true")]
    pub adaptive: bool,

    #[serde(default = "default_quality_tick_secs")]
    pub quality_tick_secs: u64,

    /// Peer negotiation deadline
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// Bound on one binary frame send
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            mjpeg_quality: default_mjpeg_quality(),
            max_fps: default_max_fps(),
            h264_bitrate: default_h264_bitrate(),
            h264_fps: default_h264_fps(),
            adaptive: true,
            quality_tick_secs: default_quality_tick_secs(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

const MAX_OVERRIDE: f64 = u32::MAX as f64;

/// Round a numeric override into `[min, max]`; NaN and infinities are ignored
fn whole(value: Option<f64>, min: f64, max: f64) -> Option<f64> {
    value.filter(|v| v.is_finite()).map(|v| v.round().clamp(min, max))
}

impl StreamConfig {
    /// Target for `mode`, with message overrides applied over configured defaults.
    /// Overrides arrive as JSON numbers and are rounded, then clamped.
    pub fn target(
        &self,
        mode: StreamMode,
        quality: Option<f64>,
        max_fps: Option<f64>,
        bitrate: Option<f64>,
        fps: Option<f64>,
    ) -> StreamTarget {
        let quality = whole(quality, 1.0, 100.0).map_or(self.mjpeg_quality, |q| q as u8).clamp(1, 100);
        match mode {
            StreamMode::Mjpeg => StreamTarget {
                quality,
                max_fps: whole(max_fps, 1.0, MAX_OVERRIDE).map_or(self.max_fps, |f| f as u32).max(1),
                bitrate: self.h264_bitrate,
            },
            StreamMode::H264 | StreamMode::Peer => StreamTarget {
                quality,
                max_fps: whole(fps.or(max_fps), 1.0, MAX_OVERRIDE)
                    .map_or(self.h264_fps, |f| f as u32)
                    .max(1),
                bitrate: whole(bitrate, 1.0, MAX_OVERRIDE)
                    .map_or(self.h264_bitrate, |b| b as u32)
                    .max(1),
            },
        }
    }

    pub fn quality_tick(&self) -> Duration {
        Duration::from_secs(self.quality_tick_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Capture source selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSourceKind {
    /// X11 root window, falling back to the test pattern
    #[default]
    X11,
    /// Test pattern only
    Synthetic,
}

impl CaptureSourceKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "x11" => Some(Self::X11),
            "synthetic" | "test" => Some(Self::Synthetic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaptureConfig {
    #[serde(default)]
    pub source: CaptureSourceKind,

    /// X11 display; `$DISPLAY` when unset
    #[serde(default)]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Try the XTest tier
    #[serde(default = "default_true")]
    pub enable_direct: bool,

    /// Try the shell and gesture tiers
    #[serde(default = "default_true")]
    pub enable_shell: bool,

    /// Delay between typed characters
    #[serde(default = "default_text_delay_ms")]
    pub text_delay_ms: u64,

    /// Wait after setting the clipboard before pasting
    #[serde(default = "default_paste_settle_ms")]
    pub paste_settle_ms: u64,

    #[serde(default = "default_long_press_ms")]
    pub long_press_ms: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enable_direct: true,
            enable_shell: true,
            text_delay_ms: default_text_delay_ms(),
            paste_settle_ms: default_paste_settle_ms(),
            long_press_ms: default_long_press_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Peer media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN URLs
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `SCREENLINK_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.server.url.trim();
        if url.is_empty() {
            return Err("Server URL must be set".into());
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err("Server URL must use ws:// or wss://".into());
        }

        if self.device.width == 0 || self.device.height == 0 {
            return Err("Device dimensions must be non-zero".into());
        }

        if !(1..=100).contains(&self.stream.mjpeg_quality) {
            return Err("MJPEG quality must be within 1..=100".into());
        }
        if self.stream.max_fps == 0 || self.stream.h264_fps == 0 {
            return Err("Frame rates must be non-zero".into());
        }
        if self.stream.h264_bitrate == 0 {
            return Err("H.264 bitrate must be non-zero".into());
        }
        if self.stream.quality_tick_secs == 0
            || self.stream.negotiation_timeout_ms == 0
            || self.stream.send_timeout_ms == 0
        {
            return Err("Stream timeouts must be non-zero".into());
        }

        if self.clipboard.enabled && self.clipboard.poll_interval_ms == 0 {
            return Err("Clipboard poll interval must be non-zero".into());
        }

        Ok(())
    }
}


fn default_true() -> bool {
    true
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080/device".to_string()
}

fn default_device_name() -> String {
    "screenlink".to_string()
}

fn default_width() -> u32 { 1080 }
fn default_height() -> u32 { 1920 }
fn default_density() -> u32 { 420 }

fn default_mode() -> StreamMode {
    StreamMode::Peer
}

fn default_mjpeg_quality() -> u8 { 80 }
fn default_max_fps() -> u32 { 30 }
fn default_h264_bitrate() -> u32 { 2_000_000 }
fn default_h264_fps() -> u32 { 30 }
fn default_quality_tick_secs() -> u64 { 5 }
fn default_negotiation_timeout_ms() -> u64 { 10_000 }
fn default_send_timeout_ms() -> u64 { 5_000 }
fn default_text_delay_ms() -> u64 { 10 }
fn default_paste_settle_ms() -> u64 { 150 }
fn default_long_press_ms() -> u32 { 800 }
fn default_poll_interval_ms() -> u64 { 500 }

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}
