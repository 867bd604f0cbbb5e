//! Peer media backend
//!
//! The negotiator drives a backend through a small synchronous interface;
//! everything asynchronous comes back as [`PeerEvent`]s tagged with the
//! session that produced them.

use super::signaling::{IceCandidate, SessionDescription};
use super::WebRTCError;
use crate::encode::EncodedFrame;
use tokio::sync::mpsc;

/// Connectivity state reported by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// Local offer created and set
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    AnswerApplied,
    AnswerFailed(String),
    Ice(IceState),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub session: u64,
    pub kind: PeerEventKind,
}

/// A media channel that can be established through an offer/answer and
/// candidate exchange
pub trait PeerMediaBackend: Send {
    /// Start a connection for `session`; the offer arrives as an event
    fn open(
        &mut self,
        session: u64,
        peer_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(), WebRTCError>;

    fn apply_answer(&mut self, answer: SessionDescription);

    fn add_candidate(&mut self, candidate: IceCandidate);

    /// Queue one encoded unit; false when it could not be accepted
    fn write_frame(&mut self, frame: &EncodedFrame) -> bool;

    /// Release the connection. Idempotent.
    fn close(&mut self);
}

#[cfg(feature = "webrtc-streaming")]
pub use rtc::RtcPeerBackend;

#[cfg(feature = "webrtc-streaming")]
mod rtc {
    use super::*;
    use crate::encode::{FrameKind, PayloadFormat};
    use bytes::{Bytes, BytesMut};
    use log::{debug, info, warn};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
    use webrtc::api::APIBuilder;
    use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
    use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
    use webrtc::ice_transport::ice_server::RTCIceServer;
    use webrtc::interceptor::registry::Registry;
    use webrtc::media::Sample;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_local::TrackLocal;

    const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

    /// Encoded units buffered towards the track before writes count as drops
    const WRITE_QUEUE: usize = 8;

    const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

    enum PeerCommand {
        ApplyAnswer(SessionDescription),
        AddCandidate(IceCandidate),
    }

    struct ActivePeer {
        session: u64,
        commands: mpsc::UnboundedSender<PeerCommand>,
        samples: mpsc::Sender<Sample>,
        parameter_sets: Option<Bytes>,
        last_timestamp: Option<Instant>,
    }

    /// webrtc-rs peer connection carrying one H.264 video track
    pub struct RtcPeerBackend {
        ice_servers: Vec<String>,
        active: Option<ActivePeer>,
    }

    impl RtcPeerBackend {
        pub fn new(ice_servers: Vec<String>) -> Self {
            Self {
                ice_servers,
                active: None,
            }
        }
    }

    impl PeerMediaBackend for RtcPeerBackend {
        fn open(
            &mut self,
            session: u64,
            peer_id: &str,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<(), WebRTCError> {
            self.close();
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (sample_tx, sample_rx) = mpsc::channel(WRITE_QUEUE);
            let ice_servers = self.ice_servers.clone();
            let handle = tokio::runtime::Handle::try_current()
                .map_err(|e| WebRTCError::ConnectionFailed(format!("no async runtime: {}", e)))?;
            handle.spawn(run_peer(session, ice_servers, events, cmd_rx, sample_rx));
            info!("Opening peer connection for {} (session {})", peer_id, session);
            self.active = Some(ActivePeer {
                session,
                commands: cmd_tx,
                samples: sample_tx,
                parameter_sets: None,
                last_timestamp: None,
            });
            Ok(())
        }

        fn apply_answer(&mut self, answer: SessionDescription) {
            if let Some(peer) = &self.active {
                let _ = peer.commands.send(PeerCommand::ApplyAnswer(answer));
            }
        }

        fn add_candidate(&mut self, candidate: IceCandidate) {
            if let Some(peer) = &self.active {
                let _ = peer.commands.send(PeerCommand::AddCandidate(candidate));
            }
        }

        fn write_frame(&mut self, frame: &EncodedFrame) -> bool {
            let Some(peer) = self.active.as_mut() else {
                return false;
            };
            if frame.format != PayloadFormat::H264 {
                return false;
            }
            let data = match frame.kind {
                FrameKind::Config => {
                    peer.parameter_sets = Some(frame.payload.clone());
                    return true;
                }
                FrameKind::Key => match &peer.parameter_sets {
                    Some(sets) => {
                        let mut unit = BytesMut::with_capacity(sets.len() + frame.payload.len());
                        unit.extend_from_slice(sets);
                        unit.extend_from_slice(&frame.payload);
                        unit.freeze()
                    }
                    None => frame.payload.clone(),
                },
                FrameKind::Delta => frame.payload.clone(),
            };
            let duration = peer
                .last_timestamp
                .map(|last| frame.timestamp.saturating_duration_since(last))
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_FRAME_DURATION);
            peer.last_timestamp = Some(frame.timestamp);
            let sample = Sample {
                data,
                duration,
                ..Default::default()
            };
            peer.samples.try_send(sample).is_ok()
        }

        fn close(&mut self) {
            if let Some(peer) = self.active.take() {
                debug!("Closing peer connection (session {})", peer.session);
            }
        }
    }

    async fn create_peer_connection(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: h264_capability(),
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register H264: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;
        Ok(Arc::new(peer_connection))
    }

    fn h264_capability() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: H264_FMTP.to_string(),
            rtcp_feedback: vec![],
        }
    }

    fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => Some(IceState::Connected),
            RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
            RTCIceConnectionState::Failed => Some(IceState::Failed),
            RTCIceConnectionState::Closed => Some(IceState::Closed),
            _ => None,
        }
    }

    /// Create the connection and track, then publish the local offer
    async fn setup(
        session: u64,
        ice_servers: &[String],
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(Arc<RTCPeerConnection>, Arc<TrackLocalStaticSample>), WebRTCError> {
        let pc = create_peer_connection(ice_servers).await?;

        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            "video".to_string(),
            "screenlink".to_string(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add track: {}", e)))?;
        // RTCP must be read for the interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent {
                            session,
                            kind: PeerEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        });
                    }
                    Err(e) => debug!("Candidate serialization failed: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!("ICE connection state (session {}): {}", session, state);
            if let Some(mapped) = map_ice_state(state) {
                let _ = state_events.send(PeerEvent {
                    session,
                    kind: PeerEventKind::Ice(mapped),
                });
            }
            Box::pin(async {})
        }));

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;
        let _ = events.send(PeerEvent {
            session,
            kind: PeerEventKind::LocalDescription(SessionDescription::offer(offer.sdp)),
        });
        Ok((pc, track))
    }

    async fn run_peer(
        session: u64,
        ice_servers: Vec<String>,
        events: mpsc::UnboundedSender<PeerEvent>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut samples: mpsc::Receiver<Sample>,
    ) {
        let (pc, track) = match setup(session, &ice_servers, &events).await {
            Ok(parts) => parts,
            Err(e) => {
                let _ = events.send(PeerEvent {
                    session,
                    kind: PeerEventKind::Error(e.to_string()),
                });
                return;
            }
        };

        let writer = tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                if let Err(e) = track.write_sample(&sample).await {
                    warn!("Track write failed: {}", e);
                }
            }
        });

        while let Some(command) = commands.recv().await {
            match command {
                PeerCommand::ApplyAnswer(answer) => {
                    let result = match RTCSessionDescription::answer(answer.sdp) {
                        Ok(desc) => pc.set_remote_description(desc).await.map_err(|e| e.to_string()),
                        Err(e) => Err(format!("Invalid SDP answer: {}", e)),
                    };
                    let kind = match result {
                        Ok(()) => PeerEventKind::AnswerApplied,
                        Err(e) => PeerEventKind::AnswerFailed(e),
                    };
                    let _ = events.send(PeerEvent { session, kind });
                }
                PeerCommand::AddCandidate(candidate) => {
                    let init = RTCIceCandidateInit {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                        username_fragment: None,
                    };
                    if let Err(e) = pc.add_ice_candidate(init).await {
                        debug!("Failed to add ICE candidate: {}", e);
                    }
                }
            }
        }

        writer.abort();
        if let Err(e) = pc.close().await {
            debug!("Peer connection close failed: {}", e);
        }
        debug!("Peer connection task for session {} finished", session);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every call; the test plays the remote side through `events`
    #[derive(Clone, Default)]
    pub struct RecordingBackend {
        pub log: Arc<Mutex<Vec<String>>>,
        pub events: Arc<Mutex<Option<(u64, mpsc::UnboundedSender<PeerEvent>)>>>,
        pub accept_writes: Arc<Mutex<bool>>,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            let backend = Self::default();
            *backend.accept_writes.lock() = true;
            backend
        }

        pub fn calls(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        /// Emit an event for the currently open session
        pub fn emit(&self, kind: PeerEventKind) {
            if let Some((session, tx)) = self.events.lock().as_ref() {
                let _ = tx.send(PeerEvent {
                    session: *session,
                    kind,
                });
            }
        }
    }

    impl PeerMediaBackend for RecordingBackend {
        fn open(
            &mut self,
            session: u64,
            peer_id: &str,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<(), WebRTCError> {
            self.log.lock().push(format!("open {}", peer_id));
            *self.events.lock() = Some((session, events));
            Ok(())
        }

        fn apply_answer(&mut self, answer: SessionDescription) {
            self.log.lock().push(format!("answer {}", answer.sdp));
        }

        fn add_candidate(&mut self, candidate: IceCandidate) {
            self.log.lock().push(format!("candidate {}", candidate.candidate));
        }

        fn write_frame(&mut self, frame: &EncodedFrame) -> bool {
            self.log.lock().push(format!("write {:?}", frame.kind));
            *self.accept_writes.lock()
        }

        fn close(&mut self) {
            self.log.lock().push("close".to_string());
        }
    }
}
