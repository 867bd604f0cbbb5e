//! GStreamer H.264 encoder for the hardware path
//!
//! appsrc (RGB) -> videoconvert -> H.264 encoder -> h264parse -> appsink (Annex-B AU).
//! Encoded units are drained without blocking after every pushed frame.

use super::nal::split_access_unit;
use super::{EncodeError, EncodedFrame, EncoderFactory, FrameKind, PayloadFormat, StreamEncoder, VideoSettings};
use crate::capture::Frame;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use log::{debug, info, warn};
use std::time::Instant;

/// H.264 encoders, best first
const H264_ENCODERS: &[&str] = &[
    "nvh264enc",
    "qsvh264enc",
    "vaapih264enc",
    "x264enc",
    "openh264enc",
];

/// Keyframe interval in frames
const KEYFRAME_INTERVAL: u32 = 60;

/// Whether GStreamer initializes and at least one H.264 encoder exists
pub fn is_available() -> bool {
    gst::init().is_ok() && select_encoder().is_some()
}

fn select_encoder() -> Option<&'static str> {
    H264_ENCODERS
        .iter()
        .copied()
        .find(|name| gst::ElementFactory::find(name).is_some())
}

fn create_encoder_element(name: &str, bitrate: u32) -> Result<gst::Element, EncodeError> {
    let kbps = (bitrate / 1000).max(1);
    let builder = gst::ElementFactory::make(name).name("encoder");
    let builder = match name {
        "x264enc" => builder
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "superfast")
            .property("bitrate", kbps)
            .property("key-int-max", KEYFRAME_INTERVAL)
            .property("b-adapt", false)
            .property("bframes", 0u32),
        "openh264enc" => builder
            .property("bitrate", bitrate)
            .property("gop-size", KEYFRAME_INTERVAL),
        "nvh264enc" => builder
            .property("bitrate", kbps)
            .property("gop-size", KEYFRAME_INTERVAL as i32)
            .property("zerolatency", true),
        "qsvh264enc" => builder
            .property("bitrate", kbps)
            .property("gop-size", KEYFRAME_INTERVAL)
            .property("low-latency", true),
        "vaapih264enc" => builder
            .property("bitrate", kbps)
            .property("keyframe-period", KEYFRAME_INTERVAL),
        other => return Err(EncodeError::Unsupported(format!("unknown encoder {}", other))),
    };
    builder
        .build()
        .map_err(|e| EncodeError::Unsupported(format!("failed to create '{}': {}", name, e)))
}

/// Stateful H.264 encoder on a GStreamer pipeline
pub struct GstH264Encoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    encoder_name: &'static str,
    settings: VideoSettings,
    last_parameter_sets: Vec<u8>,
    resend_parameter_sets: bool,
}

impl GstH264Encoder {
    pub fn new(settings: VideoSettings) -> Result<Self, EncodeError> {
        gst::init().map_err(|e| EncodeError::Unsupported(format!("GStreamer init failed: {}", e)))?;
        let encoder_name = select_encoder()
            .ok_or_else(|| EncodeError::Unsupported("no H.264 encoder element".to_string()))?;

        let caps = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, settings.width, settings.height)
            .fps(gst::Fraction::new(settings.fps.max(1) as i32, 1))
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| EncodeError::Failed(format!("invalid input caps: {}", e)))?;

        let appsrc = gst_app::AppSrc::builder()
            .name("framesrc")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .do_timestamp(true)
            .build();

        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| EncodeError::Failed(format!("videoconvert: {}", e)))?;
        let encoder = create_encoder_element(encoder_name, settings.bitrate)?;
        let parse = gst::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(|e| EncodeError::Failed(format!("h264parse: {}", e)))?;

        let sink_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let appsink = gst_app::AppSink::builder()
            .name("unitsink")
            .caps(&sink_caps)
            .sync(false)
            .max_buffers(8)
            .drop(false)
            .build();

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &encoder, &parse, appsink.upcast_ref()])
            .map_err(|e| EncodeError::Failed(format!("add elements: {}", e)))?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &encoder, &parse, appsink.upcast_ref()])
            .map_err(|e| EncodeError::Failed(format!("link elements: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncodeError::Failed(format!("pipeline start: {}", e)))?;

        info!(
            "H.264 encoder {} started at {}x{} @{}fps, {} bps",
            encoder_name, settings.width, settings.height, settings.fps, settings.bitrate
        );

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            encoder,
            encoder_name,
            settings,
            last_parameter_sets: Vec::new(),
            resend_parameter_sets: true,
        })
    }

    fn force_keyframe(&mut self) {
        let event = gst_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.encoder.send_event(event) {
            warn!("Failed to send force-keyunit event to {}", self.encoder_name);
        }
        self.resend_parameter_sets = true;
    }

    fn drain(&mut self, out: &mut Vec<EncodedFrame>) -> Result<(), EncodeError> {
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let delta = buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
            let map = buffer
                .map_readable()
                .map_err(|e| EncodeError::Failed(format!("buffer map: {}", e)))?;
            let split = split_access_unit(map.as_slice());
            let now = Instant::now();

            if !split.parameter_sets.is_empty()
                && (self.resend_parameter_sets || split.parameter_sets != self.last_parameter_sets)
            {
                self.last_parameter_sets = split.parameter_sets.clone();
                self.resend_parameter_sets = false;
                out.push(EncodedFrame {
                    kind: FrameKind::Config,
                    format: PayloadFormat::H264,
                    payload: Bytes::from(split.parameter_sets),
                    timestamp: now,
                });
            }

            if !split.picture.is_empty() {
                let kind = if split.is_idr || !delta { FrameKind::Key } else { FrameKind::Delta };
                out.push(EncodedFrame {
                    kind,
                    format: PayloadFormat::H264,
                    payload: Bytes::from(split.picture),
                    timestamp: now,
                });
            }
        }
        Ok(())
    }
}

impl StreamEncoder for GstH264Encoder {
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<EncodedFrame>, EncodeError> {
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(EncodeError::Failed(format!(
                "frame {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.settings.width, self.settings.height
            )));
        }
        if force_keyframe {
            self.force_keyframe();
        }

        let buffer = gst::Buffer::from_mut_slice(frame.data[..frame.expected_len()].to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncodeError::Failed(format!("appsrc push failed: {:?}", e)))?;

        let mut out = Vec::new();
        self.drain(&mut out)?;
        Ok(out)
    }

    fn set_bitrate(&mut self, bitrate: u32) {
        if bitrate == self.settings.bitrate {
            return;
        }
        self.settings.bitrate = bitrate;
        if self.encoder_name == "openh264enc" {
            self.encoder.set_property("bitrate", bitrate);
        } else {
            self.encoder.set_property("bitrate", (bitrate / 1000).max(1));
        }
        debug!("{} bitrate -> {} bps", self.encoder_name, bitrate);
    }

    fn settings(&self) -> VideoSettings {
        self.settings
    }
}

impl Drop for GstH264Encoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Factory used when the `gstreamer` feature is on
pub struct GstEncoderFactory;

impl EncoderFactory for GstEncoderFactory {
    fn is_available(&self) -> bool {
        is_available()
    }

    fn create(&self, settings: VideoSettings) -> Result<Box<dyn StreamEncoder>, EncodeError> {
        Ok(Box::new(GstH264Encoder::new(settings)?))
    }
}
