//! Capture + encode engine
//!
//! One dedicated worker thread owns the capture source and the encoder.
//! Encoded frames leave through an unbounded channel and never block the
//! worker; flow control is the pending-frame check below.

use super::flow::FlowCounters;
use super::quality::QualityParams;
use crate::capture::{CaptureError, CaptureRequest, CaptureSource, GrantChain, GrantPath};
use crate::encode::{
    h264_dimensions, scaled_dimensions, EncodedFrame, EncoderFactory, JpegEncoder, StreamEncoder, VideoSettings,
};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Frames awaiting acknowledgment above which new samples are skipped
pub const MAX_PENDING_FRAMES: u32 = 3;

/// Consecutive skips after which the next emitted frame is a keyframe
pub const SKIPS_BEFORE_KEYFRAME: u32 = 5;

/// Encode path for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStrategy {
    /// Image stills at a configured quality
    Software,
    /// Stateful video encoder emitting config/key/delta units
    Hardware,
}

impl fmt::Display for EncodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeStrategy::Software => write!(f, "software"),
            EncodeStrategy::Hardware => write!(f, "hardware"),
        }
    }
}

/// Encode paths available on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub software: bool,
    pub hardware: bool,
}

impl Capability {
    pub fn supports(&self, strategy: EncodeStrategy) -> bool {
        match strategy {
            EncodeStrategy::Software => self.software,
            EncodeStrategy::Hardware => self.hardware,
        }
    }
}

/// Receiving end of the encoded stream.
///
/// Yields `None` once the worker has stopped, whether by request or failure.
pub struct FrameSink {
    rx: mpsc::UnboundedReceiver<EncodedFrame>,
}

impl FrameSink {
    pub async fn recv(&mut self) -> Option<EncodedFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EncodedFrame> {
        self.rx.try_recv().ok()
    }
}

enum WorkerCommand {
    Reconfigure(QualityParams),
    RequestKeyframe,
}

struct Worker {
    strategy: EncodeStrategy,
    commands: Sender<WorkerCommand>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct SurfaceConfig {
    width: u32,
    height: u32,
    density: u32,
}

/// Owns capture and encoding for at most one running session
pub struct CaptureEncodeEngine {
    chain: GrantChain,
    encoders: Arc<dyn EncoderFactory>,
    flow: Arc<FlowCounters>,
    density: u32,
    surface: Option<SurfaceConfig>,
    params: Option<QualityParams>,
    worker: Option<Worker>,
}

impl CaptureEncodeEngine {
    pub fn new(chain: GrantChain, encoders: Arc<dyn EncoderFactory>, flow: Arc<FlowCounters>) -> Self {
        Self {
            chain,
            encoders,
            flow,
            density: 160,
            surface: None,
            params: None,
            worker: None,
        }
    }

    pub fn with_density(mut self, density: u32) -> Self {
        self.density = density;
        self
    }

    pub fn flow(&self) -> Arc<FlowCounters> {
        self.flow.clone()
    }

    /// Record the source geometry and starting parameters
    pub fn configure(&mut self, width: u32, height: u32, params: QualityParams) -> Capability {
        self.surface = Some(SurfaceConfig {
            width,
            height,
            density: self.density,
        });
        self.params = Some(params);
        Capability {
            software: !self.chain.is_empty(),
            hardware: !self.chain.is_empty() && self.encoders.is_available(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn strategy(&self) -> Option<EncodeStrategy> {
        self.worker.as_ref().map(|w| w.strategy)
    }

    /// Open the capture source and start the worker.
    ///
    /// Nothing stays acquired when this fails.
    pub fn start(&mut self, strategy: EncodeStrategy) -> Result<FrameSink, CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let surface = self.surface.ok_or(CaptureError::NotConfigured)?;
        let params = self.params.ok_or(CaptureError::NotConfigured)?;

        let request = output_request(&surface, strategy, &params);
        let (source, grant) = self.chain.open(&request)?;
        let pipeline = match strategy {
            EncodeStrategy::Software => EncodePath::Software(JpegEncoder::new(params.quality)),
            EncodeStrategy::Hardware => {
                let encoder = self
                    .encoders
                    .create(video_settings(&request, &params))
                    .map_err(|e| CaptureError::Encoder(e.to_string()))?;
                EncodePath::Hardware(encoder)
            }
        };

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let mut state = WorkerState {
            chain: self.chain.clone(),
            encoders: self.encoders.clone(),
            flow: self.flow.clone(),
            surface,
            strategy,
            params,
            source,
            pipeline,
            frames: frame_tx,
            commands: cmd_rx,
            last_emit: None,
            skipped: 0,
            force_keyframe: true,
        };
        let worker_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("capture-encode".to_string())
            .spawn(move || state.run(&worker_stop))
            .map_err(|e| CaptureError::SourceFailed(format!("failed to spawn worker: {}", e)))?;

        info!(
            "Capture engine started: {} path, {}x{} via {} grant, level {}",
            strategy, request.width, request.height, grant, params.level
        );
        self.worker = Some(Worker {
            strategy,
            commands: cmd_tx,
            stop,
            handle,
        });
        Ok(FrameSink { rx: frame_rx })
    }

    /// Ask for a keyframe on the next emitted sample (new consumer attached)
    pub fn request_keyframe(&self) {
        if let Some(worker) = &self.worker {
            let _ = worker.commands.send(WorkerCommand::RequestKeyframe);
        }
    }

    /// Apply new parameters; a size change rebuilds the capture surface
    pub fn reconfigure(&mut self, params: QualityParams) {
        self.params = Some(params);
        if let Some(worker) = &self.worker {
            let _ = worker.commands.send(WorkerCommand::Reconfigure(params));
        }
    }

    /// Stop the worker and release capture and encoder. Idempotent.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        drop(worker.commands);
        if worker.handle.join().is_err() {
            error!("Capture worker panicked");
        }
        info!("Capture engine stopped");
    }
}

impl Drop for CaptureEncodeEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn output_request(surface: &SurfaceConfig, strategy: EncodeStrategy, params: &QualityParams) -> CaptureRequest {
    let (width, height) = match strategy {
        EncodeStrategy::Software => scaled_dimensions(surface.width, surface.height, params.scale),
        EncodeStrategy::Hardware => h264_dimensions(surface.width, surface.height, params.scale),
    };
    CaptureRequest {
        width,
        height,
        density: surface.density,
    }
}

fn video_settings(request: &CaptureRequest, params: &QualityParams) -> VideoSettings {
    VideoSettings {
        width: request.width,
        height: request.height,
        fps: params.fps,
        bitrate: params.bitrate,
    }
}

enum EncodePath {
    Software(JpegEncoder),
    Hardware(Box<dyn StreamEncoder>),
}

struct WorkerState {
    chain: GrantChain,
    encoders: Arc<dyn EncoderFactory>,
    flow: Arc<FlowCounters>,
    surface: SurfaceConfig,
    strategy: EncodeStrategy,
    params: QualityParams,
    source: Box<dyn CaptureSource>,
    pipeline: EncodePath,
    frames: mpsc::UnboundedSender<EncodedFrame>,
    commands: Receiver<WorkerCommand>,
    last_emit: Option<Instant>,
    skipped: u32,
    force_keyframe: bool,
}

impl WorkerState {
    fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            if let Err(e) = self.drain_commands() {
                error!("Capture reconfigure failed: {}", e);
                break;
            }

            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Capture source stopped: {}", e);
                    break;
                }
            };

            let interval = Duration::from_millis(self.params.frame_interval_ms());
            if let Some(last) = self.last_emit {
                if frame.timestamp.saturating_duration_since(last) < interval {
                    continue;
                }
            }

            if self.flow.pending() > MAX_PENDING_FRAMES {
                self.skipped += 1;
                if self.skipped == SKIPS_BEFORE_KEYFRAME {
                    debug!("{} frames skipped under backpressure", self.skipped);
                }
                continue;
            }
            if self.skipped >= SKIPS_BEFORE_KEYFRAME {
                self.force_keyframe = true;
            }
            self.skipped = 0;

            let force = std::mem::take(&mut self.force_keyframe);
            let encoded = match &mut self.pipeline {
                EncodePath::Software(jpeg) => jpeg.encode(&frame).map(|f| vec![f]),
                EncodePath::Hardware(encoder) => encoder.encode(&frame, force),
            };
            let units = match encoded {
                Ok(units) => units,
                Err(e) => {
                    error!("Encoder failure, stopping stream: {}", e);
                    break;
                }
            };

            self.last_emit = Some(frame.timestamp);
            for unit in units {
                self.flow.frame_emitted();
                if self.frames.send(unit).is_err() {
                    debug!("Frame sink closed, stopping capture worker");
                    return;
                }
            }
        }
        let stats = self.source.stats();
        debug!(
            "Capture worker exiting after {} frames, avg capture {}us",
            stats.total_frames,
            stats.average_capture_time_us()
        );
    }

    fn drain_commands(&mut self) -> Result<(), CaptureError> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                WorkerCommand::RequestKeyframe => self.force_keyframe = true,
                WorkerCommand::Reconfigure(params) => self.apply(params)?,
            }
        }
        Ok(())
    }

    fn apply(&mut self, params: QualityParams) -> Result<(), CaptureError> {
        let request = output_request(&self.surface, self.strategy, &params);
        if (request.width, request.height) != self.source.dimensions() {
            info!(
                "Rebuilding capture surface at {}x{} for level {}",
                request.width, request.height, params.level
            );
            // Old surface goes first so two never coexist
            let placeholder: Box<dyn CaptureSource> = Box::new(Released);
            drop(std::mem::replace(&mut self.source, placeholder));
            let (source, grant) = self.chain.open(&request)?;
            if grant == GrantPath::Permission {
                debug!("Rebuilt surface via permission grant");
            }
            self.source = source;
            match &mut self.pipeline {
                EncodePath::Software(jpeg) => jpeg.set_quality(params.quality),
                EncodePath::Hardware(encoder) => {
                    *encoder = self
                        .encoders
                        .create(video_settings(&request, &params))
                        .map_err(|e| CaptureError::Encoder(e.to_string()))?;
                }
            }
            self.force_keyframe = true;
        } else {
            match &mut self.pipeline {
                EncodePath::Software(jpeg) => jpeg.set_quality(params.quality),
                EncodePath::Hardware(encoder) => encoder.set_bitrate(params.bitrate),
            }
            debug!(
                "Applied level {} live: quality={} fps={} bitrate={}",
                params.level, params.quality, params.fps, params.bitrate
            );
        }
        self.params = params;
        Ok(())
    }
}

/// Stand-in held only while a surface is being rebuilt
struct Released;

impl CaptureSource for Released {
    fn next_frame(&mut self) -> Result<crate::capture::Frame, CaptureError> {
        warn!("Frame requested from a released surface");
        Err(CaptureError::SourceFailed("surface released".to_string()))
    }

    fn dimensions(&self) -> (u32, u32) {
        (0, 0)
    }

    fn stats(&self) -> crate::capture::FrameStats {
        crate::capture::FrameStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureProvider, SyntheticProvider};
    use crate::encode::testing::ScriptedFactory;
    use crate::encode::{FrameKind, PayloadFormat};
    use crate::stream::quality::{QualityLevel, StreamTarget};
    use tokio::time::timeout;

    struct Denied;

    impl CaptureProvider for Denied {
        fn name(&self) -> &str {
            "denied"
        }

        fn grant(&self) -> GrantPath {
            GrantPath::System
        }

        fn open(&self, _request: &CaptureRequest) -> Result<Box<dyn CaptureSource>, CaptureError> {
            Err(CaptureError::Unavailable("no grant".to_string()))
        }
    }

    fn synthetic_chain() -> GrantChain {
        GrantChain::new().with_provider(Arc::new(
            SyntheticProvider::new(GrantPath::Permission).with_interval(Duration::from_millis(2)),
        ))
    }

    fn params(level: QualityLevel) -> QualityParams {
        let target = StreamTarget {
            quality: 80,
            max_fps: 500,
            bitrate: 2_000_000,
        };
        let mut params = QualityParams::resolve(level, &target);
        params.fps = 200;
        params
    }

    fn engine(factory: Arc<ScriptedFactory>) -> CaptureEncodeEngine {
        CaptureEncodeEngine::new(synthetic_chain(), factory, Arc::new(FlowCounters::new()))
    }

    async fn next(sink: &mut FrameSink, flow: &FlowCounters) -> EncodedFrame {
        let frame = timeout(Duration::from_secs(5), sink.recv())
            .await
            .expect("frame in time")
            .expect("worker running");
        flow.frame_settled();
        frame
    }

    #[tokio::test]
    async fn software_path_emits_jpeg() {
        let mut engine = engine(Arc::default());
        let caps = engine.configure(64, 48, params(QualityLevel::High));
        assert!(caps.software && caps.hardware);

        let flow = engine.flow();
        let mut sink = engine.start(EncodeStrategy::Software).expect("start");
        let frame = next(&mut sink, &flow).await;
        assert_eq!(frame.format, PayloadFormat::Jpeg);
        assert_eq!(&frame.payload[..2], &[0xFF, 0xD8]);
        engine.stop();
    }

    #[tokio::test]
    async fn backpressure_caps_unacknowledged_frames() {
        let mut engine = engine(Arc::default());
        engine.configure(32, 32, params(QualityLevel::High));
        let flow = engine.flow();
        let mut sink = engine.start(EncodeStrategy::Software).expect("start");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut received = 0;
        while sink.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, (MAX_PENDING_FRAMES + 1) as usize);
        assert_eq!(flow.pending(), MAX_PENDING_FRAMES + 1);
        engine.stop();
    }

    #[tokio::test]
    async fn hardware_path_leads_with_config_and_keyframe() {
        let factory = Arc::new(ScriptedFactory::default());
        let mut engine = engine(factory.clone());
        engine.configure(640, 480, params(QualityLevel::High));
        let flow = engine.flow();
        let mut sink = engine.start(EncodeStrategy::Hardware).expect("start");

        assert_eq!(next(&mut sink, &flow).await.kind, FrameKind::Config);
        assert_eq!(next(&mut sink, &flow).await.kind, FrameKind::Key);
        assert_eq!(next(&mut sink, &flow).await.kind, FrameKind::Delta);

        engine.request_keyframe();
        let mut saw_key = false;
        for _ in 0..10 {
            if next(&mut sink, &flow).await.kind == FrameKind::Key {
                saw_key = true;
                break;
            }
        }
        assert!(saw_key);
        assert_eq!(factory.created.lock()[0].width, 640);
        engine.stop();
    }

    #[tokio::test]
    async fn resolution_change_rebuilds_encoder() {
        let factory = Arc::new(ScriptedFactory::default());
        let mut engine = engine(factory.clone());
        engine.configure(640, 480, params(QualityLevel::High));
        let flow = engine.flow();
        let mut sink = engine.start(EncodeStrategy::Hardware).expect("start");
        next(&mut sink, &flow).await;

        engine.reconfigure(params(QualityLevel::Low));
        let mut rebuilt = false;
        for _ in 0..50 {
            let frame = next(&mut sink, &flow).await;
            // payload carries the frame width
            if frame.payload[0] == 320u32 as u8 && frame.kind == FrameKind::Config {
                rebuilt = true;
                break;
            }
        }
        assert!(rebuilt);
        let created = factory.created.lock().clone();
        assert_eq!(created.len(), 2);
        assert_eq!((created[1].width, created[1].height), (320, 240));
        engine.stop();
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let mut engine = engine(Arc::default());
        engine.configure(32, 32, params(QualityLevel::High));
        let _sink = engine.start(EncodeStrategy::Software).expect("start");
        assert!(matches!(
            engine.start(EncodeStrategy::Software),
            Err(CaptureError::AlreadyRunning)
        ));
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn start_requires_configure() {
        let mut engine = engine(Arc::default());
        assert!(matches!(
            engine.start(EncodeStrategy::Software),
            Err(CaptureError::NotConfigured)
        ));
    }

    #[test]
    fn capture_unavailable_leaves_engine_idle() {
        let chain = GrantChain::new().with_provider(Arc::new(Denied));
        let mut engine = CaptureEncodeEngine::new(chain, Arc::new(ScriptedFactory::default()), Arc::default());
        engine.configure(32, 32, params(QualityLevel::High));
        assert!(matches!(
            engine.start(EncodeStrategy::Software),
            Err(CaptureError::Unavailable(_))
        ));
        assert!(!engine.is_running());
    }

    #[test]
    fn encoder_failure_releases_source() {
        let factory = Arc::new(ScriptedFactory {
            fail: true,
            ..Default::default()
        });
        let mut engine = engine(factory);
        engine.configure(64, 64, params(QualityLevel::High));
        assert!(matches!(
            engine.start(EncodeStrategy::Hardware),
            Err(CaptureError::Encoder(_))
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn stopping_closes_the_sink() {
        let mut engine = engine(Arc::default());
        engine.configure(32, 32, params(QualityLevel::High));
        let mut sink = engine.start(EncodeStrategy::Software).expect("start");
        engine.stop();
        while sink.try_recv().is_some() {}
        let end = timeout(Duration::from_secs(1), sink.recv()).await.expect("closed");
        assert!(end.is_none());
    }
}
