//! Capture -> encode -> adapt pipeline
//!
//! - `engine`: capture worker and encoders
//! - `quality`: quality ladder and adaptive controller
//! - `flow`: counters shared between the worker, transports and controller

pub mod engine;
pub mod flow;
pub mod quality;

pub use engine::{Capability, CaptureEncodeEngine, EncodeStrategy, FrameSink};
pub use flow::FlowCounters;
pub use quality::{QualityController, QualityLevel, QualityParams, StreamTarget};
