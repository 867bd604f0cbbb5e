//! Peer media path
//!
//! This module provides:
//! - The signaling state machine for one negotiation session at a time
//! - The peer media backend seam and its webrtc-rs implementation

pub mod peer_connection;
pub mod signaling;

pub use peer_connection::{IceState, PeerEvent, PeerEventKind, PeerMediaBackend};
#[cfg(feature = "webrtc-streaming")]
pub use peer_connection::RtcPeerBackend;
pub use signaling::{IceCandidate, SessionDescription, SignalingState, SignalingStateMachine};

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track error
    MediaError(String),
    /// Invalid state transition
    InvalidState(String),
    /// Feature not enabled
    FeatureDisabled,
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            WebRTCError::FeatureDisabled => write!(f, "WebRTC streaming feature is not enabled"),
        }
    }
}

impl Error for WebRTCError {}
