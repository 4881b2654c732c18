use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use ringbuffer::{AllocRingBuffer, RingBuffer, RingBufferExt, RingBufferRead, RingBufferWrite};
use serde::Serialize;
use serde_json::json;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    errors::{WsClientError, WsResult},
    events::{parse_frame, SocketEvent},
    types::{ConnectionQuality, ConnectionState, ConnectionStatus},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receiving half of the text-frame feed consumed by the event router.
pub type FrameReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ExponentialBackoff {
    /// Delay before the reconnect that follows `attempts` earlier ones.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.powi(attempts.min(i32::MAX as u32) as i32);
        let scaled = self.initial.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// `min(5s * 2^attempts, 30s)`.
pub fn reconnect_delay(attempts: u32) -> Duration {
    ExponentialBackoff::default().delay(attempts)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WsConfig {
    pub host: String,
    pub path: String,
    pub backoff: ExponentialBackoff,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub latency_warn: Duration,
    pub latency_error: Duration,
    pub latency_samples: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            path: "/ws/paper-trading".to_string(),
            backoff: ExponentialBackoff::default(),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            latency_warn: Duration::from_millis(1000),
            latency_error: Duration::from_millis(3000),
            latency_samples: 8,
        }
    }
}

struct Supervisor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    url: Url,
    config: WsConfig,
    status: watch::Sender<ConnectionStatus>,
    manual_close: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    supervisor: Mutex<Option<Supervisor>>,
    frames: mpsc::UnboundedSender<String>,
    dials: AtomicU64,
}

/// Owns one logical socket to the trading backend: dialing, heartbeat,
/// latency tracking and reconnect with exponential backoff.
///
/// All timers live inside a single supervisor task, so stopping that task
/// cancels every pending heartbeat and reconnect.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: WsConfig) -> WsResult<(Self, FrameReceiver)> {
        let url = build_url(&config)?;
        let (frames, frame_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::default());

        let manager = Self {
            shared: Arc::new(Shared {
                url,
                config,
                status,
                manual_close: AtomicBool::new(false),
                outbound: Mutex::new(None),
                supervisor: Mutex::new(None),
                frames,
                dials: AtomicU64::new(0),
            }),
        };
        Ok((manager, frame_rx))
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn config(&self) -> &WsConfig {
        &self.shared.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().is_connected()
    }

    /// Number of sockets dialed so far.
    pub fn dial_count(&self) -> u64 {
        self.shared.dials.load(Ordering::Acquire)
    }

    /// Opens the socket unless it is already open or opening.
    pub async fn connect(&self) {
        let mut slot = self.shared.supervisor.lock().await;
        let state = self.shared.status.borrow().state;
        if matches!(
            state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            tracing::debug!(?state, "connect_skipped");
            return;
        }

        self.shared.manual_close.store(false, Ordering::Release);
        if let Some(previous) = slot.take() {
            // a supervisor waiting out a backoff delay
            let _ = previous.stop.send(true);
            previous.task.abort();
        }

        self.shared.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.next_reconnect_in = None;
        });

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(self.shared.clone(), stop_rx));
        *slot = Some(Supervisor { stop, task });
    }

    /// Closes the socket and cancels any pending reconnect.
    pub async fn disconnect(&self) {
        self.shared.manual_close.store(true, Ordering::Release);
        let supervisor = self.shared.supervisor.lock().await.take();
        if let Some(Supervisor { stop, task }) = supervisor {
            let _ = stop.send(true);
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "ws_supervisor_join_failed");
                }
            }
        }
        *self.shared.outbound.lock().await = None;
        self.shared.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.next_reconnect_in = None;
        });
        tracing::info!(url = %self.shared.url, "ws_disconnected");
    }

    /// Serializes and writes `payload` if the socket is open. Returns `false`
    /// and drops the message otherwise.
    pub async fn send_message<T: Serialize + ?Sized>(&self, payload: &T) -> WsResult<bool> {
        let text = serde_json::to_string(payload)?;
        if !self.is_connected() {
            tracing::warn!(len = text.len(), "ws_send_dropped_not_connected");
            return Ok(false);
        }

        let outbound = self.shared.outbound.lock().await;
        let delivered = outbound
            .as_ref()
            .is_some_and(|sender| sender.send(Message::Text(text)).is_ok());
        if !delivered {
            tracing::warn!("ws_send_dropped_no_writer");
        }
        Ok(delivered)
    }
}

impl Shared {
    fn record_error(&self, message: String) {
        self.status
            .send_modify(|status| status.last_error = Some(message));
    }

    fn touch(&self) {
        self.status
            .send_modify(|status| status.last_activity = Some(chrono::Utc::now()));
    }

    fn should_stop(&self, stop: &watch::Receiver<bool>) -> bool {
        *stop.borrow() || self.manual_close.load(Ordering::Acquire)
    }
}

async fn supervise(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        if shared.should_stop(&stop) {
            break;
        }

        shared.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.next_reconnect_in = None;
        });
        let dial = shared.dials.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(url = %shared.url, dial, "ws_dial");

        let dialed = tokio::select! {
            result = connect_async(shared.url.as_str()) => result,
            _ = stop.changed() => break,
        };

        match dialed {
            Ok((socket, _)) => {
                let reason = run_connection(&shared, socket, &mut stop).await;
                tracing::info!(reason = %reason, "ws_closed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "ws_dial_failed");
                shared.record_error(format!("WebSocket connection error: {err}"));
            }
        }

        *shared.outbound.lock().await = None;
        shared
            .status
            .send_modify(|status| status.state = ConnectionState::Disconnected);

        if shared.should_stop(&stop) {
            break;
        }

        let attempts = shared.status.borrow().reconnect_attempts;
        let backoff = &shared.config.backoff;
        if attempts >= backoff.max_attempts {
            tracing::warn!(attempts, "reconnect_give_up");
            break;
        }

        let delay = backoff.delay(attempts);
        shared
            .status
            .send_modify(|status| status.next_reconnect_in = Some(delay));
        tracing::info!(
            attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect_scheduled"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.changed() => break,
        }

        shared.status.send_modify(|status| {
            status.reconnect_attempts += 1;
            status.next_reconnect_in = None;
        });
    }
}

/// Drives one open socket until it closes. Returns a short close reason.
async fn run_connection(
    shared: &Shared,
    socket: Socket,
    stop: &mut watch::Receiver<bool>,
) -> String {
    let config = &shared.config;
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *shared.outbound.lock().await = Some(out_tx);

    shared.status.send_modify(|status| {
        status.state = ConnectionState::Connected;
        status.reconnect_attempts = 0;
        status.next_reconnect_in = None;
        status.last_error = None;
        status.last_activity = Some(chrono::Utc::now());
    });
    tracing::info!(url = %shared.url, "ws_connected");

    let mut latency = LatencyWindow::new(config.latency_samples);
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    let mut ping_sent_at: Option<Instant> = None;
    let pong_deadline = sleep(config.pong_timeout);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::warn!(error = %err, "ws_binary_not_utf8");
                            shared.record_error(format!("Failed to parse message: {err}"));
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = sink.send(Message::Pong(payload)).await {
                            shared.record_error(format!("WebSocket error: {err}"));
                            return "pong write failed".to_string();
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        on_pong(shared, &mut latency, ping_sent_at.take());
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => format!("{} {}", u16::from(frame.code), frame.reason),
                            None => "closed by server".to_string(),
                        };
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(err)) => {
                        shared.record_error(format!("WebSocket error: {err}"));
                        return err.to_string();
                    }
                    None => return "stream ended".to_string(),
                };

                shared.touch();
                match parse_frame(&text) {
                    Ok(SocketEvent::Pong) => on_pong(shared, &mut latency, ping_sent_at.take()),
                    Ok(SocketEvent::Ping) => {
                        let pong = json!({ "type": "pong" }).to_string();
                        if let Err(err) = sink.send(Message::Text(pong)).await {
                            shared.record_error(format!("WebSocket error: {err}"));
                            return "pong write failed".to_string();
                        }
                    }
                    _ => {}
                }
                if shared.frames.send(text).is_err() {
                    tracing::debug!("ws_frame_receiver_dropped");
                }
            }
            Some(message) = out_rx.recv() => {
                if let Err(err) = sink.send(message).await {
                    shared.record_error(format!("WebSocket error: {err}"));
                    return "write failed".to_string();
                }
            }
            _ = heartbeat.tick() => {
                let ping = json!({ "type": "ping", "timestamp": chrono::Utc::now() }).to_string();
                if let Err(err) = sink.send(Message::Text(ping)).await {
                    shared.record_error(format!("WebSocket error: {err}"));
                    return "heartbeat write failed".to_string();
                }
                if ping_sent_at.is_none() {
                    let now = Instant::now();
                    ping_sent_at = Some(now);
                    pong_deadline.as_mut().reset(now + config.pong_timeout);
                }
            }
            _ = &mut pong_deadline, if ping_sent_at.is_some() => {
                tracing::warn!(
                    timeout_ms = config.pong_timeout.as_millis() as u64,
                    "heartbeat_timeout"
                );
                shared.status.send_modify(|status| status.quality = ConnectionQuality::Poor);
                let _ = sink.send(Message::Close(None)).await;
                return "heartbeat timeout".to_string();
            }
            _ = stop.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return "closed by client".to_string();
            }
        }
    }
}

fn on_pong(shared: &Shared, latency: &mut LatencyWindow, sent_at: Option<Instant>) {
    let Some(sent_at) = sent_at else {
        return;
    };
    let sample = sent_at.elapsed();
    latency.push(sample);
    let config = &shared.config;
    let quality = ConnectionQuality::classify(sample, config.latency_warn, config.latency_error);
    let average = latency.average();
    tracing::debug!(latency_ms = sample.as_millis() as u64, ?quality, "ws_pong");
    shared.status.send_modify(|status| {
        status.latency = Some(sample);
        status.average_latency = average;
        status.quality = quality;
    });
}

/// Rolling window over the most recent round-trip samples.
struct LatencyWindow {
    window: usize,
    samples: AllocRingBuffer<Duration>,
}

impl LatencyWindow {
    fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: AllocRingBuffer::with_capacity(window.next_power_of_two().max(2)),
        }
    }

    fn push(&mut self, sample: Duration) {
        self.samples.push(sample);
        while self.samples.len() > self.window {
            let _ = self.samples.dequeue();
        }
    }

    fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

fn build_url(config: &WsConfig) -> WsResult<Url> {
    let mut candidate = config.host.trim().to_string();
    if candidate.is_empty() {
        return Err(WsClientError::InvalidMessage(
            "websocket host must be provided".to_string(),
        ));
    }
    if candidate.starts_with("https://") {
        candidate = candidate.replacen("https://", "wss://", 1);
    } else if candidate.starts_with("http://") {
        candidate = candidate.replacen("http://", "ws://", 1);
    } else if !candidate.starts_with("ws://") && !candidate.starts_with("wss://") {
        if candidate.contains("://") {
            return Err(WsClientError::UnsupportedScheme(candidate));
        }
        candidate = format!("wss://{candidate}");
    }

    let mut url = Url::parse(&candidate)?;
    url.set_path(&config.path);
    Ok(url)
}
