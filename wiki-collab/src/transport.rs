//! Persistent connection to the relay for one document.
//!
//! One background task owns the WebSocket. It reconnects with capped
//! exponential backoff, sends keepalive pings, and treats silence longer
//! than the idle timeout as a dead connection. Everything it observes is
//! delivered, in order, on a single event channel; the connection status is
//! additionally mirrored on a `watch` channel for cheap polling.
//!
//! Frames handed to [`SyncTransport::send`] while not connected are dropped.
//! The document handshake on the next connect recovers every missed edit and
//! presence is republished by heartbeat.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{MessageType, SyncMessage};

/// Connection status as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Everything the connection task reports, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    Message(SyncMessage),
}

/// Reconnect and liveness timing.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First reconnect delay
    pub base_backoff: Duration,
    /// Upper bound for the reconnect delay
    pub max_backoff: Duration,
    /// Give up on a single connect attempt after this long
    pub connect_timeout: Duration,
    /// Ping cadence while connected
    pub keepalive_interval: Duration,
    /// No inbound frame for this long is a failure
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn for_testing() -> Self {
        Self {
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// Delay before reconnect attempt number `attempt` (0-based).
pub fn backoff_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    config
        .base_backoff
        .saturating_mul(factor)
        .min(config.max_backoff)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Exit {
    Shutdown,
    Lost,
}

/// Handle to the background connection task.
pub struct SyncTransport {
    peer_id: Uuid,
    url: String,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    events_rx: mpsc::Receiver<TransportEvent>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncTransport {
    /// Start connecting to `{endpoint}/{document_id}`.
    ///
    /// Returns immediately; progress is reported as events.
    pub fn connect(endpoint: &str, document_id: &str, peer_id: Uuid, config: TransportConfig) -> Self {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), document_id);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = ConnectionTask {
            url: url.clone(),
            peer_id,
            config,
            outgoing_rx,
            events_tx,
            status_tx,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            peer_id,
            url,
            outgoing_tx,
            events_rx,
            status_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(handle),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Independent status receiver. Dropping it unsubscribes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Queue a frame for the relay. Returns `false` if it was dropped.
    pub fn send(&self, msg: &SyncMessage) -> bool {
        if self.status() != ConnectionStatus::Connected {
            log::trace!("Dropping {:?} frame while offline", msg.msg_type);
            return false;
        }
        match msg.encode() {
            Ok(bytes) => self.outgoing_tx.send(bytes).is_ok(),
            Err(e) => {
                log::error!("Failed to encode {:?} frame: {e}", msg.msg_type);
                false
            }
        }
    }

    /// Next event from the connection task; `None` once it has exited.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Close the connection and wait for the task to finish.
    ///
    /// The event channel is closed first so a task parked on a full channel
    /// wakes up and sees the shutdown.
    pub async fn disconnect(mut self) {
        self.events_rx.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ConnectionTask {
    url: String,
    peer_id: Uuid,
    config: TransportConfig,
    outgoing_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events_tx: mpsc::Sender<TransportEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.set_status(ConnectionStatus::Connecting).await;
            log::debug!("Connecting to {}", self.url);

            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(self.url.as_str()),
            );

            let result = tokio::select! {
                _ = &mut self.shutdown_rx => break,
                result = connect => result,
            };

            match result {
                Ok(Ok((ws, _))) => {
                    attempt = 0;
                    log::info!("Connected to {}", self.url);
                    if let Exit::Shutdown = self.run_connected(ws).await {
                        break;
                    }
                    log::info!("Connection to {} lost", self.url);
                }
                Ok(Err(e)) => log::debug!("Connect to {} failed: {e}", self.url),
                Err(_) => log::warn!("Connect to {} timed out", self.url),
            }

            self.set_status(ConnectionStatus::Disconnected).await;

            let delay = backoff_delay(&self.config, attempt);
            attempt = attempt.saturating_add(1);
            log::debug!("Reconnecting in {delay:?} (attempt {attempt})");

            tokio::select! {
                _ = &mut self.shutdown_rx => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_status(ConnectionStatus::Disconnected).await;
        log::debug!("Transport for {} stopped", self.url);
    }

    async fn run_connected(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut stream) = ws.split();

        // Frames queued before this connection existed are stale.
        while self.outgoing_rx.try_recv().is_ok() {}

        self.set_status(ConnectionStatus::Connected).await;

        let keepalive = self.config.keepalive_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
                frame = self.outgoing_rx.recv() => {
                    let Some(bytes) = frame else {
                        let _ = sink.close().await;
                        return Exit::Shutdown;
                    };
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        return Exit::Lost;
                    }
                }
                _ = ping.tick() => {
                    if let Ok(bytes) = SyncMessage::ping(self.peer_id).encode() {
                        if sink.send(Message::Binary(bytes.into())).await.is_err() {
                            return Exit::Lost;
                        }
                    }
                }
                _ = &mut idle => {
                    log::warn!("No frames from {} for {idle_timeout:?}", self.url);
                    return Exit::Lost;
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                            let msg = match SyncMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Dropping undecodable frame ({} bytes): {e}", data.len());
                                    continue;
                                }
                            };
                            if msg.peer_id == self.peer_id {
                                continue;
                            }
                            match msg.msg_type {
                                MessageType::Pong => {}
                                MessageType::Ping => {
                                    if let Ok(bytes) = SyncMessage::pong(self.peer_id).encode() {
                                        if sink.send(Message::Binary(bytes.into())).await.is_err() {
                                            return Exit::Lost;
                                        }
                                    }
                                }
                                _ => {
                                    if self.events_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                        // Handle is gone or disconnecting.
                                        let _ = sink.send(Message::Close(None)).await;
                                        let _ = sink.close().await;
                                        return Exit::Shutdown;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Exit::Lost,
                        Some(Ok(_)) => {
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                        }
                    }
                }
            }
        }
    }

    async fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::debug!("Transport {} is {status:?}", self.url);
            let _ = self.events_tx.send(TransportEvent::Status(status)).await;
        }
    }
}
