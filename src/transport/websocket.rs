//! WebSocket control channel client
//!
//! Keeps one persistent connection to the server: registers the device,
//! sends heartbeats, carries JSON control messages both ways and the binary
//! frames of the framed path. Reconnects after a fixed delay until shut down.

use super::messages::{ControlMessage, DeviceMessage};
use super::TransportError;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Duration, Instant, Interval};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Identity announced in `device.register`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub device_id: String,
    pub device_name: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Server acknowledged the registration
    Connected,
    /// Connection lost after registration
    Disconnected,
    Message(ControlMessage),
}

/// Result of one binary frame send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent(usize),
    Dropped,
}

enum Outbound {
    Text(String),
    Frame(Vec<u8>),
}

/// Cloneable sending side of the control channel
#[derive(Clone)]
pub struct ControlHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    feedback: mpsc::UnboundedSender<FrameOutcome>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ControlHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a control message
    pub fn send(&self, message: &DeviceMessage) -> Result<(), TransportError> {
        let json = message.to_json()?;
        self.outbound
            .send(Outbound::Text(json))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a packed frame; the outcome arrives on the feedback channel
    pub fn send_frame(&self, packet: Vec<u8>) {
        if !self.is_connected() {
            let _ = self.feedback.send(FrameOutcome::Dropped);
            return;
        }
        if self.outbound.send(Outbound::Frame(packet)).is_err() {
            let _ = self.feedback.send(FrameOutcome::Dropped);
        }
    }

    /// Close the connection and stop reconnecting
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }
}

/// Connection loop; run it on its own task
pub struct ControlChannel {
    url: String,
    registration: Registration,
    send_timeout: Duration,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ControlEvent>,
    feedback: mpsc::UnboundedSender<FrameOutcome>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ControlChannel {
    pub fn new(
        url: String,
        registration: Registration,
        send_timeout: Duration,
    ) -> (
        Self,
        ControlHandle,
        mpsc::UnboundedReceiver<ControlEvent>,
        mpsc::UnboundedReceiver<FrameOutcome>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let handle = ControlHandle {
            outbound: outbound_tx,
            feedback: feedback_tx.clone(),
            connected: connected.clone(),
            stopping: stopping.clone(),
            shutdown: shutdown.clone(),
        };
        let channel = Self {
            url,
            registration,
            send_timeout,
            outbound: outbound_rx,
            events: events_tx,
            feedback: feedback_tx,
            connected,
            stopping,
            shutdown,
        };
        (channel, handle, events_rx, feedback_rx)
    }

    pub async fn run(mut self) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            match open(&self.url).await {
                Ok(ws_stream) => {
                    info!("Control channel connected to {}", self.url);
                    if let Err(e) = self.serve(ws_stream).await {
                        warn!("Control channel error: {}", e);
                    }
                }
                Err(e) => warn!("Control channel: {}", e),
            }
            if self.connected.swap(false, Ordering::AcqRel) {
                let _ = self.events.send(ControlEvent::Disconnected);
            }
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            info!("Reconnecting in {:?}", RECONNECT_DELAY);
            tokio::select! {
                _ = time::sleep(RECONNECT_DELAY) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        info!("Control channel stopped");
    }

    async fn serve(&mut self, ws_stream: WsStream) -> Result<(), TransportError> {
        let (mut write, mut read) = ws_stream.split();

        // Anything queued before this connection is stale
        while let Ok(item) = self.outbound.try_recv() {
            if let Outbound::Frame(_) = item {
                let _ = self.feedback.send(FrameOutcome::Dropped);
            }
        }

        let register = DeviceMessage::Register {
            device_id: self.registration.device_id.clone(),
            device_name: self.registration.device_name.clone(),
            screen_width: self.registration.screen_width,
            screen_height: self.registration.screen_height,
            token: self.registration.token.clone(),
        };
        self.send_text(&mut write, register.to_json()?).await?;
        debug!("device.register sent for {}", self.registration.device_id);

        let mut heartbeat: Option<Interval> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                item = self.outbound.recv() => match item {
                    Some(Outbound::Text(text)) => self.send_text(&mut write, text).await?,
                    Some(Outbound::Frame(packet)) => self.send_frame(&mut write, packet).await?,
                    None => return Err(TransportError::Closed),
                },
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &mut heartbeat),
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring inbound binary message: {} bytes", data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Control channel closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
                },
                _ = next_heartbeat(&mut heartbeat) => {
                    self.send_text(&mut write, DeviceMessage::Heartbeat {}.to_json()?).await?;
                }
            }
        }
    }

    async fn send_text(&self, write: &mut WsWriter, text: String) -> Result<(), TransportError> {
        match time::timeout(self.send_timeout, write.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Protocol(e.to_string())),
            Err(_) => Err(TransportError::Protocol("text send timed out".to_string())),
        }
    }

    async fn send_frame(&self, write: &mut WsWriter, packet: Vec<u8>) -> Result<(), TransportError> {
        let len = packet.len();
        match time::timeout(self.send_timeout, write.send(Message::Binary(packet))).await {
            Ok(Ok(())) => {
                let _ = self.feedback.send(FrameOutcome::Sent(len));
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = self.feedback.send(FrameOutcome::Dropped);
                Err(TransportError::Protocol(e.to_string()))
            }
            Err(_) => {
                debug!("Frame send timed out after {:?}", self.send_timeout);
                let _ = self.feedback.send(FrameOutcome::Dropped);
                Ok(())
            }
        }
    }

    fn handle_text(&self, text: &str, heartbeat: &mut Option<Interval>) {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        match message {
            ControlMessage::DeviceRegistered { device_id } => {
                info!("Device registered as {}", device_id.as_deref().unwrap_or(&self.registration.device_id));
                *heartbeat = Some(time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL));
                self.connected.store(true, Ordering::Release);
                let _ = self.events.send(ControlEvent::Connected);
            }
            ControlMessage::Error { message } => warn!("Server error: {}", message),
            ControlMessage::Unknown => debug!("Ignoring unknown message: {}", text),
            other => {
                let _ = self.events.send(ControlEvent::Message(other));
            }
        }
    }
}

async fn open(url: &str) -> Result<WsStream, TransportError> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::Connect(format!("{}: {}", url, e)))?;
    Ok(ws_stream)
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
