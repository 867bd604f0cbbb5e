//! Transport negotiator
//!
//! Single owner of the active transport mode. Decides between the peer media
//! path and the framed path, routes encoded frames to whichever path is
//! active, and feeds delivery outcomes to the quality controller.
//!
//! Only one path ever holds the capture engine: the abandoned path is torn
//! down before the new one starts.

use super::codec::FrameProtocolCodec;
use super::messages::{DeviceMessage, StreamMode};
use super::websocket::{ControlHandle, FrameOutcome};
use crate::encode::EncodedFrame;
use crate::stream::{
    CaptureEncodeEngine, EncodeStrategy, FlowCounters, FrameSink, QualityController, QualityLevel, QualityParams,
    StreamTarget,
};
use crate::webrtc::peer_connection::{IceState, PeerEvent, PeerEventKind, PeerMediaBackend};
use crate::webrtc::signaling::{
    IceCandidate, ReadyAction, SessionDescription, SignalingState, SignalingStateMachine, NEGOTIATION_TIMEOUT,
};
use crate::webrtc::WebRTCError;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::time;

/// Period of the congestion check
pub const QUALITY_TICK: Duration = Duration::from_secs(5);

/// Which path currently carries frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Peer path being established; no frames flow
    NegotiatingPeer,
    PeerActive,
    FallbackActive,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::NegotiatingPeer => write!(f, "negotiating-peer"),
            TransportMode::PeerActive => write!(f, "peer-active"),
            TransportMode::FallbackActive => write!(f, "fallback-active"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamRequest {
    pub mode: StreamMode,
    pub target: StreamTarget,
}

/// Snapshot published after every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorStatus {
    pub mode: Option<TransportMode>,
    pub level: QualityLevel,
}

#[derive(Debug)]
pub enum NegotiatorCommand {
    Start(StreamRequest),
    Stop,
    PeerReady {
        from_id: String,
    },
    PeerAnswer {
        from_id: Option<String>,
        sdp: SessionDescription,
    },
    PeerCandidate {
        from_id: Option<String>,
        candidate: IceCandidate,
    },
    Shutdown,
}

/// Outbound side of the control channel as seen by the negotiator
pub trait ControlSink: Send + Sync {
    fn send_message(&self, message: DeviceMessage);

    /// Outcome is reported asynchronously as a [`FrameOutcome`]
    fn send_frame(&self, packet: Vec<u8>);
}

impl ControlSink for ControlHandle {
    fn send_message(&self, message: DeviceMessage) {
        if let Err(e) = self.send(&message) {
            debug!("Control message not queued: {}", e);
        }
    }

    fn send_frame(&self, packet: Vec<u8>) {
        ControlHandle::send_frame(self, packet)
    }
}

/// Cloneable command side of a running negotiator
#[derive(Clone)]
pub struct NegotiatorHandle {
    commands: mpsc::UnboundedSender<NegotiatorCommand>,
    status: watch::Receiver<NegotiatorStatus>,
}

impl NegotiatorHandle {
    pub fn send(&self, command: NegotiatorCommand) {
        if self.commands.send(command).is_err() {
            debug!("Negotiator is gone, command dropped");
        }
    }

    pub fn start_stream(&self, request: StreamRequest) {
        self.send(NegotiatorCommand::Start(request));
    }

    pub fn stop_stream(&self) {
        self.send(NegotiatorCommand::Stop);
    }

    pub fn shutdown(&self) {
        self.send(NegotiatorCommand::Shutdown);
    }

    pub fn status(&self) -> NegotiatorStatus {
        *self.status.borrow()
    }

    /// Wait until the published status satisfies `predicate`
    pub async fn wait_for(&mut self, predicate: impl Fn(&NegotiatorStatus) -> bool) -> Option<NegotiatorStatus> {
        loop {
            {
                let current = self.status.borrow_and_update();
                if predicate(&current) {
                    return Some(*current);
                }
            }
            if self.status.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Geometry and timing for the streams this negotiator starts
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorSettings {
    pub width: u32,
    pub height: u32,
    pub adaptive: bool,
    pub tick_period: Duration,
    pub negotiation_timeout: Duration,
}

impl Default for NegotiatorSettings {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            adaptive: true,
            tick_period: QUALITY_TICK,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
        }
    }
}

/// Starting level for the framed path after the peer path was abandoned
pub fn fallback_level(current: QualityLevel) -> QualityLevel {
    current.lower().min(QualityLevel::Medium)
}

pub struct TransportNegotiator {
    engine: CaptureEncodeEngine,
    flow: Arc<FlowCounters>,
    controller: QualityController,
    signaling: SignalingStateMachine,
    backend: Option<Box<dyn PeerMediaBackend>>,
    control: Arc<dyn ControlSink>,
    settings: NegotiatorSettings,
    mode: Option<TransportMode>,
    framed_strategy: EncodeStrategy,
    peer_opened: bool,
    fallbacks: u32,
    sink: Option<FrameSink>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedReceiver<NegotiatorCommand>,
    status: watch::Sender<NegotiatorStatus>,
}

impl TransportNegotiator {
    pub fn new(
        engine: CaptureEncodeEngine,
        backend: Option<Box<dyn PeerMediaBackend>>,
        control: Arc<dyn ControlSink>,
        settings: NegotiatorSettings,
    ) -> (Self, NegotiatorHandle) {
        let flow = engine.flow();
        let mut controller = QualityController::new(flow.clone(), StreamTarget::default());
        controller.set_adaptive_enabled(settings.adaptive);
        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(NegotiatorStatus {
            mode: None,
            level: controller.level(),
        });

        let negotiator = Self {
            engine,
            flow,
            controller,
            signaling: SignalingStateMachine::new(settings.negotiation_timeout),
            backend,
            control,
            settings,
            mode: None,
            framed_strategy: EncodeStrategy::Software,
            peer_opened: false,
            fallbacks: 0,
            sink: None,
            peer_events_tx,
            peer_events,
            commands,
            status,
        };
        let handle = NegotiatorHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (negotiator, handle)
    }

    pub fn mode(&self) -> Option<TransportMode> {
        self.mode
    }

    pub fn level(&self) -> QualityLevel {
        self.controller.level()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling.state()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.signaling.session_id()
    }

    /// Number of times the framed path was activated to replace the peer path
    pub fn fallback_count(&self) -> u32 {
        self.fallbacks
    }

    pub fn engine_strategy(&self) -> Option<EncodeStrategy> {
        self.engine.strategy()
    }

    /// Begin streaming, tearing down whatever ran before
    pub fn start_stream(&mut self, request: StreamRequest, now: Instant) {
        self.stop_stream(now);
        self.controller = QualityController::new(self.flow.clone(), request.target);
        self.controller.set_adaptive_enabled(self.settings.adaptive);
        let capability = self
            .engine
            .configure(self.settings.width, self.settings.height, self.controller.params());
        info!(
            "Stream start requested: mode={:?} {}x{} (software={}, hardware={}, adaptive={})",
            request.mode,
            self.settings.width,
            self.settings.height,
            capability.software,
            capability.hardware,
            self.controller.is_adaptive()
        );

        match request.mode {
            StreamMode::Peer if capability.hardware && self.backend.is_some() => {
                self.signaling.begin(now);
                self.set_mode(Some(TransportMode::NegotiatingPeer));
            }
            StreamMode::Peer => {
                info!(
                    "Peer path unavailable on this host (hardware={}, backend={})",
                    capability.hardware,
                    self.backend.is_some()
                );
                self.activate_fallback(now);
            }
            StreamMode::H264 if capability.hardware => {
                self.framed_strategy = EncodeStrategy::Hardware;
                self.start_framed(now);
            }
            StreamMode::H264 => {
                warn!("No H.264 encoder available, streaming MJPEG instead");
                self.framed_strategy = EncodeStrategy::Software;
                self.start_framed(now);
            }
            StreamMode::Mjpeg => {
                self.framed_strategy = EncodeStrategy::Software;
                self.start_framed(now);
            }
        }
    }

    /// Release capture, encoder and peer resources. Idempotent.
    pub fn stop_stream(&mut self, now: Instant) {
        self.close_peer();
        self.signaling.reset();
        self.release_engine();
        self.flow.reset(now);
        if self.mode.is_some() {
            info!("Stream stopped");
        }
        self.set_mode(None);
    }

    /// Peer transport is fully established
    pub fn on_signaling_connected(&mut self, now: Instant) {
        if self.mode != Some(TransportMode::NegotiatingPeer) {
            return;
        }
        self.release_engine();
        self.flow.reset(now);
        match self.engine.start(EncodeStrategy::Hardware) {
            Ok(sink) => {
                self.sink = Some(sink);
                self.engine.request_keyframe();
                self.set_mode(Some(TransportMode::PeerActive));
            }
            Err(e) => {
                warn!("Could not start capture for the peer path: {}", e);
                self.signaling.fail("capture unavailable");
                self.activate_fallback(now);
            }
        }
    }

    /// Peer path could not be established or broke after becoming active
    pub fn on_signaling_failed(&mut self, error: WebRTCError, now: Instant) {
        self.signaling.fail(&error.to_string());
        if matches!(
            self.mode,
            Some(TransportMode::NegotiatingPeer) | Some(TransportMode::PeerActive)
        ) {
            self.activate_fallback(now);
        }
    }

    pub fn on_peer_ready(&mut self, peer_id: &str, now: Instant) {
        if self.mode != Some(TransportMode::NegotiatingPeer) {
            debug!("peer.ready from {} ignored in mode {:?}", peer_id, self.mode);
            return;
        }
        let ReadyAction::Open { peer_id, replaced } = self.signaling.on_peer_ready(peer_id, now) else {
            return;
        };
        if replaced {
            self.close_peer();
        }
        let Some(session) = self.signaling.session_id() else {
            return;
        };
        let events = self.peer_events_tx.clone();
        let opened = match self.backend.as_mut() {
            Some(backend) => backend.open(session, &peer_id, events),
            None => Err(WebRTCError::FeatureDisabled),
        };
        match opened {
            Ok(()) => self.peer_opened = true,
            Err(e) => self.on_signaling_failed(e, now),
        }
    }

    pub fn on_peer_answer(&mut self, from_id: Option<&str>, sdp: SessionDescription, now: Instant) {
        if self.mode != Some(TransportMode::NegotiatingPeer) || !self.from_current_peer(from_id) {
            debug!("peer.answer ignored");
            return;
        }
        match self.signaling.on_remote_answer(sdp) {
            Ok(answer) => {
                if let Some(backend) = self.backend.as_mut() {
                    backend.apply_answer(answer);
                }
            }
            Err(WebRTCError::InvalidState(msg)) => debug!("peer.answer out of order: {}", msg),
            Err(e) => self.on_signaling_failed(e, now),
        }
    }

    pub fn on_peer_candidate(&mut self, from_id: Option<&str>, candidate: IceCandidate) {
        if !matches!(
            self.mode,
            Some(TransportMode::NegotiatingPeer) | Some(TransportMode::PeerActive)
        ) || !self.from_current_peer(from_id)
        {
            return;
        }
        if let Some(candidate) = self.signaling.on_remote_candidate(candidate) {
            if let Some(backend) = self.backend.as_mut() {
                backend.add_candidate(candidate);
            }
        }
    }

    pub fn on_peer_event(&mut self, event: PeerEvent, now: Instant) {
        if Some(event.session) != self.signaling.session_id() {
            debug!("Stale peer event for session {}: {:?}", event.session, event.kind);
            return;
        }
        match event.kind {
            PeerEventKind::LocalDescription(description) => match self.signaling.on_local_description(description) {
                Ok((target_id, sdp)) => self.control.send_message(DeviceMessage::PeerOffer { target_id, sdp }),
                Err(e) => debug!("Local description not sent: {}", e),
            },
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(target_id) = self.signaling.peer_id().map(str::to_string) {
                    self.control
                        .send_message(DeviceMessage::PeerCandidate { target_id, candidate });
                }
            }
            PeerEventKind::AnswerApplied => match self.signaling.on_remote_description_applied() {
                Ok(replay) => {
                    if let Some(backend) = self.backend.as_mut() {
                        for candidate in replay {
                            backend.add_candidate(candidate);
                        }
                    }
                    if self.signaling.state() == SignalingState::Connected {
                        self.on_signaling_connected(now);
                    }
                }
                Err(e) => debug!("Answer applied out of order: {}", e),
            },
            PeerEventKind::AnswerFailed(reason) => self.on_signaling_failed(WebRTCError::SdpError(reason), now),
            PeerEventKind::Ice(IceState::Connected) => {
                if self.signaling.on_transport_connected() {
                    self.on_signaling_connected(now);
                }
            }
            PeerEventKind::Ice(IceState::Disconnected) => {
                info!("Peer transport disconnected, waiting for recovery");
            }
            PeerEventKind::Ice(IceState::Failed) => {
                self.on_signaling_failed(WebRTCError::IceError("connectivity checks failed".to_string()), now)
            }
            PeerEventKind::Ice(IceState::Closed) => {
                if self.mode == Some(TransportMode::PeerActive) {
                    self.on_signaling_failed(WebRTCError::IceError("transport closed".to_string()), now);
                }
            }
            PeerEventKind::Error(reason) => self.on_signaling_failed(WebRTCError::ConnectionFailed(reason), now),
        }
    }

    /// Negotiation deadline timer fired for `session`
    pub fn on_deadline(&mut self, session: u64, now: Instant) {
        if self.signaling.on_deadline(session, now) && self.mode == Some(TransportMode::NegotiatingPeer) {
            self.activate_fallback(now);
        }
    }

    /// Route one encoded unit to the active path
    pub fn on_frame(&mut self, frame: EncodedFrame, now: Instant) {
        match self.mode {
            Some(TransportMode::PeerActive) => {
                let size = frame.payload.len();
                let written = match self.backend.as_mut() {
                    Some(backend) => backend.write_frame(&frame),
                    None => false,
                };
                if written {
                    self.controller.on_frame_acknowledged(size, now);
                } else {
                    self.on_dropped();
                }
            }
            Some(TransportMode::FallbackActive) => {
                self.control.send_frame(FrameProtocolCodec::pack_frame(&frame));
            }
            _ => {
                self.flow.frame_settled();
            }
        }
    }

    /// Delivery result of a framed-path send
    pub fn on_frame_outcome(&mut self, outcome: FrameOutcome, now: Instant) {
        if self.mode != Some(TransportMode::FallbackActive) {
            return;
        }
        match outcome {
            FrameOutcome::Sent(size) => self.controller.on_frame_acknowledged(size, now),
            FrameOutcome::Dropped => {
                if self.framed_strategy == EncodeStrategy::Hardware {
                    self.engine.request_keyframe();
                }
                self.on_dropped();
            }
        }
    }

    pub fn on_tick(&mut self, now: Instant) {
        if matches!(
            self.mode,
            Some(TransportMode::PeerActive) | Some(TransportMode::FallbackActive)
        ) {
            if let Some(params) = self.controller.tick(now) {
                self.apply_params(params);
            }
        }
    }

    pub async fn run(mut self, mut feedback: mpsc::UnboundedReceiver<FrameOutcome>) {
        let period = self.settings.tick_period;
        let mut tick = time::interval_at(time::Instant::now() + period, period);
        loop {
            let deadline = self.signaling.session_id().zip(self.signaling.deadline());
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NegotiatorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command, clock()),
                },
                frame = next_frame(&mut self.sink) => match frame {
                    Some(frame) => self.on_frame(frame, clock()),
                    None => {
                        error!("Capture engine stopped unexpectedly, ending stream");
                        self.stop_stream(clock());
                    }
                },
                Some(event) = self.peer_events.recv() => self.on_peer_event(event, clock()),
                Some(outcome) = feedback.recv() => self.on_frame_outcome(outcome, clock()),
                _ = tick.tick() => self.on_tick(clock()),
                _ = wait_deadline(deadline.map(|(_, at)| at)) => {
                    if let Some((session, _)) = deadline {
                        self.on_deadline(session, clock());
                    }
                }
            }
        }
        self.stop_stream(clock());
        debug!("Negotiator stopped");
    }

    fn handle_command(&mut self, command: NegotiatorCommand, now: Instant) {
        match command {
            NegotiatorCommand::Start(request) => self.start_stream(request, now),
            NegotiatorCommand::Stop => self.stop_stream(now),
            NegotiatorCommand::PeerReady { from_id } => self.on_peer_ready(&from_id, now),
            NegotiatorCommand::PeerAnswer { from_id, sdp } => self.on_peer_answer(from_id.as_deref(), sdp, now),
            NegotiatorCommand::PeerCandidate { from_id, candidate } => {
                self.on_peer_candidate(from_id.as_deref(), candidate)
            }
            NegotiatorCommand::Shutdown => {}
        }
    }

    fn from_current_peer(&self, from_id: Option<&str>) -> bool {
        match (from_id, self.signaling.peer_id()) {
            (Some(from), Some(peer)) => from == peer,
            _ => true,
        }
    }

    fn start_framed(&mut self, now: Instant) {
        self.release_engine();
        self.flow.reset(now);
        self.engine.reconfigure(self.controller.params());
        match self.engine.start(self.framed_strategy) {
            Ok(sink) => {
                self.sink = Some(sink);
                self.set_mode(Some(TransportMode::FallbackActive));
            }
            Err(e) => {
                error!("Framed stream could not start: {}", e);
                self.set_mode(None);
            }
        }
    }

    fn activate_fallback(&mut self, now: Instant) {
        self.close_peer();
        let level = fallback_level(self.controller.level());
        self.controller.set_level(level);
        self.framed_strategy = EncodeStrategy::Software;
        self.fallbacks += 1;
        info!("Falling back to framed MJPEG at level {}", level);
        self.start_framed(now);
    }

    fn apply_params(&mut self, params: QualityParams) {
        info!(
            "Quality level {} (scale={} quality={} fps={} bitrate={})",
            params.level, params.scale, params.quality, params.fps, params.bitrate
        );
        self.engine.reconfigure(params);
        self.publish();
    }

    fn on_dropped(&mut self) {
        if let Some(params) = self.controller.on_frame_dropped() {
            self.apply_params(params);
        }
    }

    fn close_peer(&mut self) {
        if !self.peer_opened {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.close();
        }
        self.peer_opened = false;
    }

    /// Joins the worker thread; on a multi-thread runtime the join is moved
    /// off the async worker so other tasks keep running.
    fn release_engine(&mut self) {
        let engine = &mut self.engine;
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| engine.stop())
            }
            _ => engine.stop(),
        }
        self.sink = None;
    }

    fn set_mode(&mut self, mode: Option<TransportMode>) {
        if self.mode != mode {
            match mode {
                Some(mode) => info!("Transport mode: {}", mode),
                None => debug!("Transport mode cleared"),
            }
        }
        self.mode = mode;
        self.publish();
    }

    fn publish(&self) {
        let status = NegotiatorStatus {
            mode: self.mode,
            level: self.controller.level(),
        };
        self.status.send_replace(status);
    }
}

fn clock() -> Instant {
    time::Instant::now().into_std()
}

async fn next_frame(sink: &mut Option<FrameSink>) -> Option<EncodedFrame> {
    match sink {
        Some(sink) => sink.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for TransportNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportNegotiator")
            .field("mode", &self.mode)
            .field("level", &self.controller.level())
            .field("signaling", &self.signaling.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{GrantChain, GrantPath, SyntheticProvider};
    use crate::encode::testing::ScriptedFactory;
    use crate::encode::{EncoderFactory, FrameKind, NoHardwareEncoder, PayloadFormat};
    use crate::transport::codec::WireKind;
    use crate::webrtc::peer_connection::testing::RecordingBackend;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        messages: Mutex<Vec<DeviceMessage>>,
        frames: Mutex<Vec<Vec<u8>>>,
        feedback: Mutex<Option<mpsc::UnboundedSender<FrameOutcome>>>,
    }

    impl ControlSink for RecordingControl {
        fn send_message(&self, message: DeviceMessage) {
            self.messages.lock().push(message);
        }

        fn send_frame(&self, packet: Vec<u8>) {
            let len = packet.len();
            self.frames.lock().push(packet);
            if let Some(tx) = self.feedback.lock().as_ref() {
                let _ = tx.send(FrameOutcome::Sent(len));
            }
        }
    }

    fn engine(factory: Arc<dyn EncoderFactory>) -> CaptureEncodeEngine {
        let chain = GrantChain::new().with_provider(Arc::new(
            SyntheticProvider::new(GrantPath::Permission).with_interval(Duration::from_millis(5)),
        ));
        CaptureEncodeEngine::new(chain, factory, Arc::new(FlowCounters::new()))
    }

    fn settings() -> NegotiatorSettings {
        NegotiatorSettings {
            width: 64,
            height: 64,
            ..Default::default()
        }
    }

    fn negotiator(
        factory: Arc<dyn EncoderFactory>,
    ) -> (TransportNegotiator, RecordingBackend, Arc<RecordingControl>) {
        let backend = RecordingBackend::new();
        let control = Arc::new(RecordingControl::default());
        let (negotiator, _handle) = TransportNegotiator::new(
            engine(factory),
            Some(Box::new(backend.clone())),
            control.clone(),
            settings(),
        );
        (negotiator, backend, control)
    }

    fn request(mode: StreamMode) -> StreamRequest {
        StreamRequest {
            mode,
            target: StreamTarget::default(),
        }
    }

    fn unit(kind: FrameKind) -> EncodedFrame {
        EncodedFrame {
            kind,
            format: PayloadFormat::H264,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            timestamp: Instant::now(),
        }
    }

    fn event(negotiator: &TransportNegotiator, kind: PeerEventKind) -> PeerEvent {
        PeerEvent {
            session: negotiator.session_id().expect("session"),
            kind,
        }
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Drive a peer session up to PeerActive
    fn connect(negotiator: &mut TransportNegotiator, now: Instant) {
        negotiator.on_peer_ready("viewer", now);
        let offer = event(negotiator, PeerEventKind::LocalDescription(SessionDescription::offer("o")));
        negotiator.on_peer_event(offer, now);
        negotiator.on_peer_answer(Some("viewer"), SessionDescription::answer("a"), now);
        let applied = event(negotiator, PeerEventKind::AnswerApplied);
        negotiator.on_peer_event(applied, now);
        let connected = event(negotiator, PeerEventKind::Ice(IceState::Connected));
        negotiator.on_peer_event(connected, now);
    }

    #[test]
    fn peer_timeout_falls_back_once_below_high() {
        let (mut negotiator, backend, _control) = negotiator(Arc::new(ScriptedFactory::default()));
        let t0 = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), t0);
        assert_eq!(negotiator.mode(), Some(TransportMode::NegotiatingPeer));
        assert_eq!(negotiator.engine_strategy(), None);
        let session = negotiator.session_id().expect("session");

        negotiator.on_deadline(session, t0 + Duration::from_secs(9));
        assert_eq!(negotiator.mode(), Some(TransportMode::NegotiatingPeer));

        negotiator.on_deadline(session, t0 + NEGOTIATION_TIMEOUT);
        assert_eq!(negotiator.mode(), Some(TransportMode::FallbackActive));
        assert_eq!(negotiator.signaling_state(), SignalingState::Failed);
        assert!(negotiator.level() <= QualityLevel::Medium);
        assert_eq!(negotiator.engine_strategy(), Some(EncodeStrategy::Software));
        assert_eq!(negotiator.fallback_count(), 1);

        negotiator.on_deadline(session, t0 + Duration::from_secs(20));
        negotiator.on_signaling_failed(WebRTCError::ConnectionFailed("late".to_string()), t0 + Duration::from_secs(21));
        assert_eq!(negotiator.fallback_count(), 1);
        assert!(backend.calls().is_empty());
        negotiator.stop_stream(t0);
    }

    #[test]
    fn connected_session_switches_to_peer_path() {
        let (mut negotiator, backend, control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);
        negotiator.on_peer_ready("viewer", now);
        let offer = event(&negotiator, PeerEventKind::LocalDescription(SessionDescription::offer("o")));
        negotiator.on_peer_event(offer, now);
        assert_eq!(
            control.messages.lock().as_slice(),
            &[DeviceMessage::PeerOffer {
                target_id: "viewer".to_string(),
                sdp: SessionDescription::offer("o"),
            }]
        );

        // arrives before the answer, so it waits
        negotiator.on_peer_candidate(Some("viewer"), candidate("c1"));
        negotiator.on_peer_answer(Some("viewer"), SessionDescription::answer("a"), now);
        assert_eq!(backend.calls(), vec!["open viewer", "answer a"]);

        let applied = event(&negotiator, PeerEventKind::AnswerApplied);
        negotiator.on_peer_event(applied, now);
        assert_eq!(backend.calls().last().map(String::as_str), Some("candidate c1"));
        assert_eq!(negotiator.mode(), Some(TransportMode::NegotiatingPeer));

        let connected = event(&negotiator, PeerEventKind::Ice(IceState::Connected));
        negotiator.on_peer_event(connected, now);
        assert_eq!(negotiator.mode(), Some(TransportMode::PeerActive));
        assert_eq!(negotiator.engine_strategy(), Some(EncodeStrategy::Hardware));

        // a deadline for the finished session is a no-op
        let session = negotiator.session_id().expect("session");
        negotiator.on_deadline(session, now + Duration::from_secs(30));
        assert_eq!(negotiator.mode(), Some(TransportMode::PeerActive));
        negotiator.stop_stream(now);
    }

    #[test]
    fn frames_travel_on_exactly_one_path() {
        let (mut negotiator, backend, control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);

        negotiator.on_frame(unit(FrameKind::Key), now);
        assert!(control.frames.lock().is_empty());
        assert!(!backend.calls().iter().any(|c| c.starts_with("write")));

        connect(&mut negotiator, now);
        negotiator.on_frame(unit(FrameKind::Key), now);
        assert_eq!(backend.calls().last().map(String::as_str), Some("write Key"));
        assert!(control.frames.lock().is_empty());

        let failed = event(&negotiator, PeerEventKind::Ice(IceState::Failed));
        negotiator.on_peer_event(failed, now);
        assert_eq!(negotiator.mode(), Some(TransportMode::FallbackActive));
        assert_eq!(backend.calls().last().map(String::as_str), Some("close"));
        let writes_before = backend.calls().iter().filter(|c| c.starts_with("write")).count();

        negotiator.on_frame(unit(FrameKind::Delta), now);
        let frames = control.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            FrameProtocolCodec::unpack(&frames[0]).expect("frame").0,
            WireKind::Video { keyframe: false }
        );
        let writes_after = backend.calls().iter().filter(|c| c.starts_with("write")).count();
        assert_eq!(writes_before, writes_after);
        negotiator.stop_stream(now);
    }

    #[test]
    fn peer_mode_without_hardware_goes_straight_to_mjpeg() {
        let (mut negotiator, backend, _control) = negotiator(Arc::new(NoHardwareEncoder));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);
        assert_eq!(negotiator.mode(), Some(TransportMode::FallbackActive));
        assert_eq!(negotiator.engine_strategy(), Some(EncodeStrategy::Software));
        assert_eq!(negotiator.level(), fallback_level(QualityLevel::High));
        assert_eq!(negotiator.level(), QualityLevel::Medium);
        assert_eq!(negotiator.fallback_count(), 1);

        negotiator.on_peer_ready("viewer", now);
        assert!(backend.calls().is_empty());
        negotiator.stop_stream(now);
    }

    #[test]
    fn fallback_never_retries_peer_until_restart() {
        let (mut negotiator, backend, _control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);
        negotiator.on_peer_ready("viewer", now);
        negotiator.on_peer_event(event(&negotiator, PeerEventKind::AnswerFailed("bad sdp".into())), now);
        assert_eq!(negotiator.mode(), Some(TransportMode::FallbackActive));

        negotiator.on_peer_ready("viewer", now);
        assert_eq!(backend.calls().iter().filter(|c| c.starts_with("open")).count(), 1);

        negotiator.start_stream(request(StreamMode::Peer), now);
        assert_eq!(negotiator.mode(), Some(TransportMode::NegotiatingPeer));
        assert_eq!(negotiator.level(), QualityLevel::High);
        negotiator.on_peer_ready("viewer", now);
        assert_eq!(backend.calls().iter().filter(|c| c.starts_with("open")).count(), 2);
        negotiator.stop_stream(now);
    }

    #[test]
    fn stale_and_tolerated_peer_events() {
        let (mut negotiator, _backend, control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);
        negotiator.on_peer_ready("viewer", now);
        let stale = negotiator.session_id().expect("session");

        // a second ready discards the first session
        negotiator.on_peer_ready("other", now);
        negotiator.on_peer_event(
            PeerEvent {
                session: stale,
                kind: PeerEventKind::Ice(IceState::Failed),
            },
            now,
        );
        assert_eq!(negotiator.mode(), Some(TransportMode::NegotiatingPeer));

        let local = event(&negotiator, PeerEventKind::LocalCandidate(candidate("l1")));
        negotiator.on_peer_event(local, now);
        assert!(matches!(
            control.messages.lock().last(),
            Some(DeviceMessage::PeerCandidate { target_id, .. }) if target_id == "other"
        ));

        connect_from_ready(&mut negotiator, now);
        let disconnected = event(&negotiator, PeerEventKind::Ice(IceState::Disconnected));
        negotiator.on_peer_event(disconnected, now);
        assert_eq!(negotiator.mode(), Some(TransportMode::PeerActive));

        let closed = event(&negotiator, PeerEventKind::Ice(IceState::Closed));
        negotiator.on_peer_event(closed, now);
        assert_eq!(negotiator.mode(), Some(TransportMode::FallbackActive));
        negotiator.stop_stream(now);
    }

    fn connect_from_ready(negotiator: &mut TransportNegotiator, now: Instant) {
        let offer = event(negotiator, PeerEventKind::LocalDescription(SessionDescription::offer("o")));
        negotiator.on_peer_event(offer, now);
        negotiator.on_peer_answer(None, SessionDescription::answer("a"), now);
        let connected = event(negotiator, PeerEventKind::Ice(IceState::Connected));
        negotiator.on_peer_event(connected, now);
        let applied = event(negotiator, PeerEventKind::AnswerApplied);
        negotiator.on_peer_event(applied, now);
    }

    #[test]
    fn peer_write_failures_count_as_drops() {
        let (mut negotiator, backend, _control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);
        connect(&mut negotiator, now);
        *backend.accept_writes.lock() = false;
        for _ in 0..3 {
            negotiator.on_frame(unit(FrameKind::Delta), now);
        }
        assert_eq!(negotiator.level(), QualityLevel::Medium);
        assert_eq!(negotiator.mode(), Some(TransportMode::PeerActive));
        negotiator.stop_stream(now);
    }

    #[test]
    fn framed_drops_downgrade_quality() {
        let (mut negotiator, _backend, _control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::H264), now);
        assert_eq!(negotiator.engine_strategy(), Some(EncodeStrategy::Hardware));

        negotiator.on_frame_outcome(FrameOutcome::Dropped, now);
        negotiator.on_frame_outcome(FrameOutcome::Dropped, now);
        assert_eq!(negotiator.level(), QualityLevel::High);
        negotiator.on_frame_outcome(FrameOutcome::Dropped, now);
        assert_eq!(negotiator.level(), QualityLevel::Medium);
        negotiator.on_frame_outcome(FrameOutcome::Sent(1000), now);
        negotiator.stop_stream(now);
    }

    #[test]
    fn stop_is_idempotent_mid_negotiation() {
        let (mut negotiator, backend, _control) = negotiator(Arc::new(ScriptedFactory::default()));
        let now = Instant::now();
        negotiator.start_stream(request(StreamMode::Peer), now);
        negotiator.on_peer_ready("viewer", now);
        let session = negotiator.session_id().expect("session");

        negotiator.stop_stream(now);
        negotiator.stop_stream(now);
        assert_eq!(negotiator.mode(), None);
        assert_eq!(negotiator.engine_strategy(), None);
        assert_eq!(backend.calls().iter().filter(|c| *c == "close").count(), 1);

        negotiator.on_deadline(session, now + Duration::from_secs(30));
        assert_eq!(negotiator.mode(), None);
        assert_eq!(negotiator.fallback_count(), 0);
    }

    #[test]
    fn fallback_level_is_capped_at_medium() {
        assert_eq!(fallback_level(QualityLevel::High), QualityLevel::Medium);
        assert_eq!(fallback_level(QualityLevel::Medium), QualityLevel::Low);
        assert_eq!(fallback_level(QualityLevel::VeryLow), QualityLevel::VeryLow);
    }

    #[tokio::test]
    async fn run_loop_streams_mjpeg_frames() {
        let control = Arc::new(RecordingControl::default());
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        *control.feedback.lock() = Some(feedback_tx);
        let (negotiator, mut handle) =
            TransportNegotiator::new(engine(Arc::new(NoHardwareEncoder)), None, control.clone(), settings());
        let task = tokio::spawn(negotiator.run(feedback_rx));

        handle.start_stream(request(StreamMode::Mjpeg));
        let status = time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.mode == Some(TransportMode::FallbackActive)),
        )
        .await
        .expect("started");
        assert!(status.is_some());

        let deadline = time::Instant::now() + Duration::from_secs(5);
        while control.frames.lock().len() < 5 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        let frames = control.frames.lock().clone();
        assert!(frames.len() >= 5);
        assert!(frames
            .iter()
            .all(|f| FrameProtocolCodec::unpack(f).map(|(kind, _)| kind == WireKind::Image).unwrap_or(false)));

        handle.stop_stream();
        time::timeout(Duration::from_secs(5), handle.wait_for(|s| s.mode.is_none()))
            .await
            .expect("stopped");
        handle.shutdown();
        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("exits")
            .expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_falls_back_when_no_peer_arrives() {
        let control = Arc::new(RecordingControl::default());
        let (_feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let backend = RecordingBackend::new();
        let (negotiator, mut handle) = TransportNegotiator::new(
            engine(Arc::new(ScriptedFactory::default())),
            Some(Box::new(backend.clone())),
            control.clone(),
            settings(),
        );
        let task = tokio::spawn(negotiator.run(feedback_rx));

        handle.start_stream(request(StreamMode::Peer));
        let negotiating = handle
            .wait_for(|s| s.mode == Some(TransportMode::NegotiatingPeer))
            .await
            .expect("negotiating");
        assert_eq!(negotiating.level, QualityLevel::High);

        time::sleep(NEGOTIATION_TIMEOUT + Duration::from_millis(100)).await;
        let fallback = handle
            .wait_for(|s| s.mode == Some(TransportMode::FallbackActive))
            .await
            .expect("fallback");
        assert_eq!(fallback.level, QualityLevel::Medium);

        handle.shutdown();
        task.await.expect("join");
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_restarts_inside_multi_thread_runtime() {
        let control = Arc::new(RecordingControl::default());
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        *control.feedback.lock() = Some(feedback_tx);
        let (negotiator, mut handle) =
            TransportNegotiator::new(engine(Arc::new(NoHardwareEncoder)), None, control.clone(), settings());
        let task = tokio::spawn(negotiator.run(feedback_rx));

        for _ in 0..3 {
            handle.start_stream(request(StreamMode::Mjpeg));
            time::timeout(
                Duration::from_secs(5),
                handle.wait_for(|s| s.mode == Some(TransportMode::FallbackActive)),
            )
            .await
            .expect("started");
            time::sleep(Duration::from_millis(20)).await;
        }
        handle.stop_stream();
        time::timeout(Duration::from_secs(5), handle.wait_for(|s| s.mode.is_none()))
            .await
            .expect("stopped");
        assert!(!control.frames.lock().is_empty());

        handle.shutdown();
        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("exits")
            .expect("join");
    }
}
