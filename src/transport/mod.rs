//! Transport layer
//!
//! The WebSocket control channel, its message taxonomy, the binary frame
//! codec for the framed path, and the negotiator that chooses between the
//! peer media path and the framed path.

pub mod codec;
pub mod messages;
pub mod negotiator;
pub mod websocket;

pub use codec::{FrameProtocolCodec, WireFrame, WireKind};
pub use messages::{ControlMessage, DeviceMessage, StreamMode, TouchKind, TouchMessage};
pub use negotiator::{
    ControlSink, NegotiatorCommand, NegotiatorHandle, NegotiatorSettings, NegotiatorStatus, StreamRequest,
    TransportMode, TransportNegotiator,
};
pub use websocket::{ControlChannel, ControlEvent, ControlHandle, FrameOutcome, Registration};

use std::error::Error;
use std::fmt;

/// Transport-related errors
#[derive(Debug)]
pub enum TransportError {
    /// Could not reach the server
    Connect(String),
    /// Peer sent something we cannot interpret
    Protocol(String),
    /// Connection is gone
    Closed,
    /// Outbound message could not be encoded
    Serialize(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Connect failed: {}", msg),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TransportError::Closed => write!(f, "Connection closed"),
            TransportError::Serialize(msg) => write!(f, "Serialize failed: {}", msg),
        }
    }
}

impl Error for TransportError {}
