//! Control channel message taxonomy
//!
//! Text messages are JSON objects discriminated by a `type` string.

use super::TransportError;
use crate::webrtc::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_swipe_duration() -> u32 {
    300
}

/// Stream mode requested by the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Peer media path, falling back to framed MJPEG
    Peer,
    /// Framed JPEG stills
    Mjpeg,
    /// Framed H.264 access units
    H264,
}

impl StreamMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "peer" | "webrtc" => Some(StreamMode::Peer),
            "mjpeg" => Some(StreamMode::Mjpeg),
            "h264" => Some(StreamMode::H264),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchKind {
    Tap,
    LongPress,
    Swipe,
    Scroll,
}

/// `input.touch` payload; which fields matter depends on `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchMessage {
    pub action: TouchKind,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(rename = "startX", default)]
    pub start_x: f64,
    #[serde(rename = "startY", default)]
    pub start_y: f64,
    #[serde(rename = "endX", default)]
    pub end_x: f64,
    #[serde(rename = "endY", default)]
    pub end_y: f64,
    #[serde(default = "default_swipe_duration")]
    pub duration: u32,
    #[serde(rename = "hScroll", default)]
    pub h_scroll: f32,
    #[serde(rename = "vScroll", default)]
    pub v_scroll: f32,
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "device.registered")]
    DeviceRegistered {
        #[serde(rename = "deviceId", default)]
        device_id: Option<String>,
    },

    #[serde(rename = "stream.start")]
    /// Mode is free text resolved with [`StreamMode::parse`]; numbers may
    /// arrive with a fractional part
    StreamStart {
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        quality: Option<f64>,
        #[serde(rename = "maxFps", default)]
        max_fps: Option<f64>,
        #[serde(default)]
        bitrate: Option<f64>,
        #[serde(default)]
        fps: Option<f64>,
    },

    #[serde(rename = "stream.stop")]
    StreamStop {},

    #[serde(rename = "input.touch")]
    InputTouch(TouchMessage),

    #[serde(rename = "input.key")]
    InputKey {
        #[serde(rename = "keyCode")]
        key_code: i32,
        #[serde(default)]
        action: String,
    },

    #[serde(rename = "input.text")]
    InputText { text: String },

    #[serde(rename = "input.command")]
    InputCommand { command: String },

    #[serde(rename = "clipboard.set")]
    ClipboardSet {
        text: String,
        #[serde(rename = "autoPaste", default = "default_true")]
        auto_paste: bool,
    },

    #[serde(rename = "peer.ready")]
    PeerReady {
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
    },

    #[serde(rename = "peer.offer")]
    PeerOffer {
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
        sdp: SessionDescription,
    },

    #[serde(rename = "peer.answer")]
    PeerAnswer {
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
        sdp: SessionDescription,
    },

    #[serde(rename = "peer.candidate")]
    PeerCandidate {
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
        candidate: IceCandidate,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        serde_json::from_str(json).map_err(|e| TransportError::Protocol(format!("Invalid control message: {}", e)))
    }
}

/// Messages sent by the device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    #[serde(rename = "device.register")]
    Register {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "deviceName")]
        device_name: String,
        #[serde(rename = "screenWidth")]
        screen_width: u32,
        #[serde(rename = "screenHeight")]
        screen_height: u32,
        token: String,
    },

    #[serde(rename = "device.heartbeat")]
    Heartbeat {},

    #[serde(rename = "peer.ready")]
    PeerReady {},

    #[serde(rename = "peer.offer")]
    PeerOffer {
        #[serde(rename = "targetId")]
        target_id: String,
        sdp: SessionDescription,
    },

    #[serde(rename = "peer.candidate")]
    PeerCandidate {
        #[serde(rename = "targetId")]
        target_id: String,
        candidate: IceCandidate,
    },

    #[serde(rename = "clipboard.update")]
    ClipboardUpdate { text: String },
}

impl DeviceMessage {
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Serialize(e.to_string()))
    }
}
