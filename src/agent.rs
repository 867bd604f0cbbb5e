//! Device agent
//!
//! Wires the control channel, the transport negotiator, the input chain and
//! the clipboard relay together, and routes control events between them.

use crate::capture::{GrantChain, GrantPath, SyntheticProvider, X11Provider};
use crate::clipboard::{ClipboardBackend, ClipboardSync, CommandClipboard, MemoryClipboard};
use crate::config::{CaptureSourceKind, Config, StreamConfig};
use crate::encode::default_encoder_factory;
use crate::input::{
    ChainSettings, GestureTier, InjectionTier, InputInjectionChain, ShellTier, SystemCommand, SystemShell,
    XTestTier,
};
use crate::stream::{CaptureEncodeEngine, FlowCounters};
use crate::transport::{
    ControlChannel, ControlEvent, ControlMessage, ControlSink, DeviceMessage, NegotiatorCommand,
    NegotiatorHandle, NegotiatorSettings, Registration, StreamMode, StreamRequest, TouchMessage,
    TransportNegotiator,
};
use crate::webrtc::PeerMediaBackend;
use log::{debug, info, warn};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One queued input operation
#[derive(Debug, Clone, PartialEq)]
pub enum InputJob {
    Touch(TouchMessage),
    Key(i32),
    Text(String),
    Command(SystemCommand),
    Clipboard { text: String, paste: bool },
}

impl InputJob {
    fn apply(self, chain: &InputInjectionChain, clipboard: Option<&ClipboardSync>) {
        let result = match self {
            InputJob::Touch(touch) => chain.touch(&touch),
            InputJob::Key(code) => chain.key(code),
            InputJob::Text(text) => {
                chain.text(&text);
                Ok(())
            }
            InputJob::Command(command) => chain.command(command),
            InputJob::Clipboard { text, paste: true } => chain.paste_text(&text),
            InputJob::Clipboard { text, paste: false } => match clipboard {
                Some(clipboard) => {
                    if let Err(e) = clipboard.apply_remote(&text) {
                        warn!("Failed to set clipboard: {}", e);
                    }
                    Ok(())
                }
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            debug!("Input job not delivered: {}", e);
        }
    }
}

/// Runs input jobs one at a time, in arrival order, on the blocking pool
pub fn spawn_input_worker(
    chain: Arc<InputInjectionChain>,
    clipboard: Option<Arc<ClipboardSync>>,
) -> (mpsc::UnboundedSender<InputJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<InputJob>();
    let task = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let chain = chain.clone();
            let clipboard = clipboard.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || job.apply(&chain, clipboard.as_deref())).await {
                warn!("Input task failed: {}", e);
            }
        }
        debug!("Input worker stopped");
    });
    (tx, task)
}

/// Routes control events to the negotiator, the input worker and the clipboard
pub struct EventRouter {
    stream: StreamConfig,
    negotiator: NegotiatorHandle,
    control: Arc<dyn ControlSink>,
    input: mpsc::UnboundedSender<InputJob>,
    clipboard: Option<Arc<ClipboardSync>>,
    poll_interval: Duration,
    updates: mpsc::UnboundedSender<String>,
    poller: Option<JoinHandle<()>>,
}

impl EventRouter {
    pub fn new(
        stream: StreamConfig,
        negotiator: NegotiatorHandle,
        control: Arc<dyn ControlSink>,
        input: mpsc::UnboundedSender<InputJob>,
    ) -> Self {
        // Updates go nowhere until a clipboard is attached
        let (updates, _) = mpsc::unbounded_channel();
        Self {
            stream,
            negotiator,
            control,
            input,
            clipboard: None,
            poll_interval: Duration::from_millis(500),
            updates,
            poller: None,
        }
    }

    /// Relay local clipboard changes into `updates` while connected
    pub fn with_clipboard(
        mut self,
        clipboard: Arc<ClipboardSync>,
        poll_interval: Duration,
        updates: mpsc::UnboundedSender<String>,
    ) -> Self {
        self.clipboard = Some(clipboard);
        self.poll_interval = poll_interval;
        self.updates = updates;
        self
    }

    pub fn is_polling_clipboard(&self) -> bool {
        self.poller.is_some()
    }

    pub fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Connected => {
                info!("Registered with control server");
                if let Some(clipboard) = &self.clipboard {
                    if self.poller.is_none() {
                        self.poller = Some(clipboard.spawn_poller(self.poll_interval, self.updates.clone()));
                    }
                }
                self.control.send_message(DeviceMessage::PeerReady {});
            }
            ControlEvent::Disconnected => {
                info!("Control server connection lost");
                self.negotiator.stop_stream();
                self.stop_poller();
            }
            ControlEvent::Message(message) => self.handle_message(message),
        }
    }

    /// Forward a local clipboard change to the viewer
    pub fn clipboard_changed(&self, text: String) {
        debug!("Local clipboard changed ({} chars)", text.chars().count());
        self.control.send_message(DeviceMessage::ClipboardUpdate { text });
    }

    pub fn shutdown(&mut self) {
        self.negotiator.stop_stream();
        self.negotiator.shutdown();
        self.stop_poller();
    }

    fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::StreamStart {
                mode,
                quality,
                max_fps,
                bitrate,
                fps,
            } => {
                let mode = match mode.as_deref() {
                    Some(name) => StreamMode::parse(name).unwrap_or_else(|| {
                        warn!("Unknown stream mode {:?}, using {:?}", name, self.stream.default_mode);
                        self.stream.default_mode
                    }),
                    None => self.stream.default_mode,
                };
                let target = self.stream.target(mode, quality, max_fps, bitrate, fps);
                info!("stream.start: {:?} {:?}", mode, target);
                self.negotiator.start_stream(StreamRequest { mode, target });
            }
            ControlMessage::StreamStop {} => {
                info!("stream.stop");
                self.negotiator.stop_stream();
            }
            ControlMessage::PeerReady { from_id } => self.negotiator.send(NegotiatorCommand::PeerReady {
                from_id: from_id.unwrap_or_default(),
            }),
            ControlMessage::PeerAnswer { from_id, sdp } => {
                self.negotiator.send(NegotiatorCommand::PeerAnswer { from_id, sdp })
            }
            ControlMessage::PeerCandidate { from_id, candidate } => {
                self.negotiator.send(NegotiatorCommand::PeerCandidate { from_id, candidate })
            }
            ControlMessage::PeerOffer { .. } => debug!("Ignoring peer.offer; the device is always the offerer"),
            ControlMessage::InputTouch(touch) => self.queue_input(InputJob::Touch(touch)),
            ControlMessage::InputKey { key_code, action } => {
                if action == "down" {
                    self.queue_input(InputJob::Key(key_code));
                }
            }
            ControlMessage::InputText { text } => self.queue_input(InputJob::Text(text)),
            ControlMessage::InputCommand { command } => match SystemCommand::parse(&command) {
                Some(command) => self.queue_input(InputJob::Command(command)),
                None => warn!("Unknown input command: {}", command),
            },
            ControlMessage::ClipboardSet { text, auto_paste } => {
                self.queue_input(InputJob::Clipboard { text, paste: auto_paste })
            }
            ControlMessage::DeviceRegistered { .. } | ControlMessage::Error { .. } | ControlMessage::Unknown => {}
        }
    }

    fn queue_input(&self, job: InputJob) {
        if self.input.send(job).is_err() {
            warn!("Input worker is gone, input dropped");
        }
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// The device-side agent
pub struct DeviceAgent {
    config: Config,
}

impl DeviceAgent {
    /// Assigns a fresh device id when none is configured
    pub fn new(mut config: Config) -> Self {
        if config.device.id.trim().is_empty() {
            config.device.id = uuid::Uuid::new_v4().to_string();
            info!("Generated device id {}", config.device.id);
        }
        Self { config }
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.id
    }

    /// Run until ctrl-c
    pub async fn run(self) -> Result<(), Box<dyn Error>> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received ctrl-c, shutting down");
        })
        .await
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Box<dyn Error>>
    where
        F: Future<Output = ()>,
    {
        let config = self.config;
        let registration = Registration {
            device_id: config.device.id.clone(),
            device_name: config.device.name.clone(),
            screen_width: config.device.width,
            screen_height: config.device.height,
            token: config.device.token.clone(),
        };
        let (channel, control, mut events, feedback) = ControlChannel::new(
            config.server.url.clone(),
            registration,
            config.stream.send_timeout(),
        );

        let clipboard = if config.clipboard.enabled {
            Some(Arc::new(ClipboardSync::new(clipboard_backend())))
        } else {
            None
        };

        let input_config = config.clone();
        let input_clipboard = clipboard.clone();
        let chain = tokio::task::spawn_blocking(move || build_input_chain(&input_config, input_clipboard)).await?;
        let (input_tx, input_task) = spawn_input_worker(Arc::new(chain), clipboard.clone());

        let settings = NegotiatorSettings {
            width: config.device.width,
            height: config.device.height,
            adaptive: config.stream.adaptive,
            tick_period: config.stream.quality_tick(),
            negotiation_timeout: config.stream.negotiation_timeout(),
        };
        let sink: Arc<dyn ControlSink> = Arc::new(control.clone());
        let (negotiator, handle) =
            TransportNegotiator::new(build_engine(&config), build_peer_backend(&config), sink.clone(), settings);

        let channel_task = tokio::spawn(channel.run());
        let negotiator_task = tokio::spawn(negotiator.run(feedback));

        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let mut router = EventRouter::new(config.stream.clone(), handle, sink, input_tx);
        if let Some(clipboard) = clipboard {
            router = router.with_clipboard(
                clipboard,
                Duration::from_millis(config.clipboard.poll_interval_ms),
                updates_tx,
            );
        }

        info!(
            "Device {} ({}) connecting to {}",
            config.device.id, config.device.name, config.server.url
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => router.handle_event(event),
                    None => break,
                },
                Some(text) = updates_rx.recv() => router.clipboard_changed(text),
                _ = &mut shutdown => break,
            }
        }

        router.shutdown();
        drop(router);
        control.shutdown();
        shutdown_task("negotiator", negotiator_task).await;
        shutdown_task("control channel", channel_task).await;
        shutdown_task("input worker", input_task).await;
        info!("Agent stopped");
        Ok(())
    }
}

async fn shutdown_task(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("{} task ended abnormally: {}", name, e);
    }
}

fn clipboard_backend() -> Arc<dyn ClipboardBackend> {
    match CommandClipboard::detect() {
        Some(clipboard) => Arc::new(clipboard),
        None => {
            info!("No clipboard tool found, using in-process clipboard");
            Arc::new(MemoryClipboard::default())
        }
    }
}

/// System-granted X11 capture first when selected, then the test pattern
pub fn build_engine(config: &Config) -> CaptureEncodeEngine {
    let mut chain = GrantChain::new();
    if config.capture.source == CaptureSourceKind::X11 {
        chain = chain.with_provider(Arc::new(X11Provider::new(config.capture.display.clone())));
    }
    chain = chain.with_provider(Arc::new(SyntheticProvider::new(GrantPath::Permission)));
    CaptureEncodeEngine::new(chain, default_encoder_factory(), Arc::new(FlowCounters::new()))
        .with_density(config.device.density)
}

#[cfg(feature = "webrtc-streaming")]
fn build_peer_backend(config: &Config) -> Option<Box<dyn PeerMediaBackend>> {
    Some(Box::new(crate::webrtc::RtcPeerBackend::new(config.webrtc.ice_servers.clone())))
}

#[cfg(not(feature = "webrtc-streaming"))]
fn build_peer_backend(_config: &Config) -> Option<Box<dyn PeerMediaBackend>> {
    info!("Built without peer media support, streams use the framed path");
    None
}

/// Direct tier first, then shell commands, then gesture emulation
pub fn build_input_chain(config: &Config, clipboard: Option<Arc<ClipboardSync>>) -> InputInjectionChain {
    let mut tiers: Vec<Box<dyn InjectionTier>> = Vec::new();
    if config.input.enable_direct {
        match XTestTier::connect(config.capture.display.as_deref()) {
            Ok(tier) => tiers.push(Box::new(tier)),
            Err(e) => info!("XTest tier not used: {}", e),
        }
    }
    if config.input.enable_shell {
        let runner = Arc::new(SystemShell);
        tiers.push(Box::new(ShellTier::new(runner.clone())));
        tiers.push(Box::new(GestureTier::new(runner)));
    }
    let settings = ChainSettings {
        text_delay: Duration::from_millis(config.input.text_delay_ms),
        paste_settle: Duration::from_millis(config.input.paste_settle_ms),
        long_press_ms: config.input.long_press_ms,
    };
    let chain = InputInjectionChain::new(tiers, settings);
    match clipboard {
        Some(clipboard) => chain.with_clipboard(clipboard),
        None => chain,
    }
}
