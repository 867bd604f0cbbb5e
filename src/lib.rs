//! screenlink-core - device screen streaming core
//!
//! Captures and encodes the local screen, delivers it over a WebRTC peer
//! connection or a framed WebSocket fallback, adapts quality to congestion
//! and injects remote input through a tiered fallback chain.

pub mod agent;
pub mod capture;
pub mod clipboard;
pub mod config;
pub mod encode;
pub mod input;
pub mod stream;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use agent::DeviceAgent;
pub use config::Config;
pub use stream::{CaptureEncodeEngine, QualityController, QualityLevel};
pub use transport::{ControlChannel, FrameProtocolCodec, TransportMode, TransportNegotiator};
pub use webrtc::{SignalingState, SignalingStateMachine};
