//! Socket.IO-over-WebSocket transport.
//!
//! [`SocketIoTransport::open`] spawns a driver task per server. The
//! driver performs the Engine.IO and namespace handshakes, answers
//! engine pings, forwards namespace events to the channel, and
//! reconnects with [`jittered_delay`] backoff after a drop. A namespace
//! disconnect initiated by the server is final.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use jobwatch_core::types::ServerId;
use jobwatch_core::wire;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::{EnginePacket, SocketPacket};
use crate::reconnect::{jittered_delay, ReconnectConfig};
use crate::transport::{OutboundEvent, Transport, TransportError, TransportEvent, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Disconnect reason reported when the server closes the namespace.
pub const REASON_SERVER_DISCONNECT: &str = "io server disconnect";

/// Where and how to reach the job-status service.
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// HTTP(S) base URL of the web application, e.g. `http://127.0.0.1:5050`.
    pub base_url: String,
    /// Socket.IO endpoint path under `base_url`.
    pub path: String,
    pub namespace: String,
    pub reconnect: ReconnectConfig,
}

impl SocketIoConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: "/socket.io".into(),
            namespace: wire::NAMESPACE.into(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// WebSocket endpoint for the Engine.IO v4 transport.
    pub fn websocket_url(&self) -> Result<Url, TransportError> {
        let invalid = |reason: String| TransportError::InvalidEndpoint {
            url: self.base_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot switch to '{scheme}'")))?;

        let base = url.path().trim_end_matches('/').to_string();
        let endpoint = self.path.trim_matches('/');
        url.set_path(&format!("{base}/{endpoint}/"));
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }
}

pub struct SocketIoTransport {
    config: Arc<SocketIoConfig>,
}

impl SocketIoTransport {
    pub fn new(config: SocketIoConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Transport for SocketIoTransport {
    fn open(&self, server_id: ServerId) -> TransportLink {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let driver = Driver {
            server_id,
            config: Arc::clone(&self.config),
            events: event_tx,
            outbound: out_rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run());

        TransportLink {
            events: event_rx,
            outbound: out_tx,
            shutdown,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// A namespace session that completed its handshake.
struct Session {
    ws: WsStream,
    socket_id: String,
    liveness: Duration,
}

enum SessionEnd {
    Dropped(String),
    ServerDisconnect,
    Shutdown,
}

struct Driver {
    server_id: ServerId,
    config: Arc<SocketIoConfig>,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let url = match self.config.websocket_url() {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(server_id = self.server_id, error = %e, "Invalid job status endpoint");
                self.emit(TransportEvent::ConnectError {
                    message: e.to_string(),
                });
                self.emit(TransportEvent::ReconnectFailed);
                return;
            }
        };

        let reconnect = self.config.reconnect.clone();
        let mut ever_connected = false;
        let mut attempt = 0u32;

        loop {
            tracing::info!(server_id = self.server_id, url = %url, attempt, "Connecting to job status service");

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = tokio::time::timeout(
                    reconnect.handshake_timeout,
                    open_session(&url, &self.config.namespace),
                ) => result.unwrap_or(Err(TransportError::Timeout(reconnect.handshake_timeout))),
            };

            match opened {
                Ok(session) => {
                    self.discard_stale_outbound();
                    let session_id = session.socket_id.clone();
                    let announced = if ever_connected || attempt > 0 {
                        self.emit(TransportEvent::Reconnected {
                            session_id,
                            attempts: attempt,
                        })
                    } else {
                        self.emit(TransportEvent::Connected { session_id })
                    };
                    if !announced {
                        return;
                    }
                    ever_connected = true;
                    attempt = 0;

                    match self.run_session(session).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::ServerDisconnect => {
                            tracing::info!(server_id = self.server_id, "Server closed the namespace");
                            self.emit(TransportEvent::Disconnected {
                                reason: REASON_SERVER_DISCONNECT.into(),
                            });
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            tracing::warn!(server_id = self.server_id, %reason, "Session dropped");
                            if !self.emit(TransportEvent::Disconnected { reason }) {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(server_id = self.server_id, error = %e, "Connect attempt failed");
                    if !self.emit(TransportEvent::ConnectError {
                        message: e.to_string(),
                    }) {
                        return;
                    }
                }
            }

            if attempt >= reconnect.max_attempts {
                tracing::warn!(server_id = self.server_id, attempts = attempt, "Giving up reconnecting");
                self.emit(TransportEvent::ReconnectFailed);
                return;
            }
            attempt += 1;

            let delay = jittered_delay(attempt, &reconnect);
            tracing::info!(
                server_id = self.server_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to job status service",
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.emit(TransportEvent::ReconnectAttempt { attempt }) {
                return;
            }
        }
    }

    /// Returns `false` once the channel side is gone.
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Outbound events queued while no session was open belong to the
    /// previous session.
    fn discard_stale_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(server_id = self.server_id, dropped, "Discarded stale outbound events");
        }
    }

    async fn run_session(&mut self, session: Session) -> SessionEnd {
        let Session { ws, liveness, .. } = session;
        let (mut sink, mut stream) = ws.split();
        let deadline = tokio::time::sleep(liveness);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.close_gracefully(&mut sink).await;
                    return SessionEnd::Shutdown;
                }
                _ = &mut deadline => return SessionEnd::Dropped("ping timeout".into()),
                out = self.outbound.recv() => match out {
                    Some(event) => {
                        if let Err(e) = send_event(&mut sink, &self.config.namespace, event).await {
                            return SessionEnd::Dropped(format!("transport error: {e}"));
                        }
                    }
                    None => {
                        self.close_gracefully(&mut sink).await;
                        return SessionEnd::Shutdown;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.handle_frame(&text, &mut sink).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Alive => {
                                deadline.as_mut().reset(tokio::time::Instant::now() + liveness);
                            }
                            FrameOutcome::End(end) => return end,
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(server_id = self.server_id, ?frame, "WebSocket closed");
                        return SessionEnd::Dropped("transport close".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(format!("transport error: {e}")),
                    None => return SessionEnd::Dropped("transport close".into()),
                },
            }
        }
    }

    async fn handle_frame(&self, text: &str, sink: &mut WsSink) -> FrameOutcome {
        let packet = match EnginePacket::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(server_id = self.server_id, error = %e, raw_message = %text, "Failed to decode frame");
                return FrameOutcome::Continue;
            }
        };

        match packet {
            EnginePacket::Ping(body) => {
                if let Err(e) = sink.send(Message::Text(EnginePacket::Pong(body).encode())).await {
                    return FrameOutcome::End(SessionEnd::Dropped(format!("transport error: {e}")));
                }
                FrameOutcome::Alive
            }
            EnginePacket::Close => FrameOutcome::End(SessionEnd::Dropped("transport close".into())),
            EnginePacket::Message(body) => self.handle_socket_packet(&body),
            _ => FrameOutcome::Continue,
        }
    }

    fn handle_socket_packet(&self, body: &str) -> FrameOutcome {
        let packet = match SocketPacket::decode(body) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(server_id = self.server_id, error = %e, "Failed to decode socket packet");
                return FrameOutcome::Continue;
            }
        };
        if packet.namespace() != self.config.namespace {
            return FrameOutcome::Continue;
        }

        match packet {
            SocketPacket::Event { name, payload, .. } => {
                if !self.emit(TransportEvent::Message {
                    event: name,
                    payload,
                }) {
                    return FrameOutcome::End(SessionEnd::Shutdown);
                }
                FrameOutcome::Continue
            }
            SocketPacket::Disconnect { .. } => FrameOutcome::End(SessionEnd::ServerDisconnect),
            SocketPacket::ConnectError { message, .. } => {
                self.emit(TransportEvent::Error {
                    message: message.clone(),
                });
                FrameOutcome::End(SessionEnd::Dropped(message))
            }
            _ => FrameOutcome::Continue,
        }
    }

    /// Flush queued outbound events, leave the namespace and close.
    async fn close_gracefully(&mut self, sink: &mut WsSink) {
        while let Ok(event) = self.outbound.try_recv() {
            if send_event(sink, &self.config.namespace, event).await.is_err() {
                break;
            }
        }
        let leave = SocketPacket::Disconnect {
            namespace: self.config.namespace.clone(),
        };
        let _ = sink.send(Message::Text(leave.to_frame())).await;
        let _ = sink.close().await;
        tracing::info!(server_id = self.server_id, "Job status session closed");
    }
}

enum FrameOutcome {
    Continue,
    /// The server proved liveness.
    Alive,
    End(SessionEnd),
}

async fn send_event(
    sink: &mut WsSink,
    namespace: &str,
    event: OutboundEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let packet = SocketPacket::event(namespace, &event.event, event.payload);
    sink.send(Message::Text(packet.to_frame())).await
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn open_session(url: &Url, namespace: &str) -> Result<Session, TransportError> {
    let (mut ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let handshake = loop {
        match EnginePacket::decode(&next_text(&mut ws).await?)? {
            EnginePacket::Open(handshake) => break handshake,
            other => tracing::trace!(?other, "Ignoring frame before open"),
        }
    };

    let join = SocketPacket::Connect {
        namespace: namespace.to_string(),
        data: None,
    };
    ws.send(Message::Text(join.to_frame()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    loop {
        match EnginePacket::decode(&next_text(&mut ws).await?)? {
            EnginePacket::Message(body) => match SocketPacket::decode(&body)? {
                SocketPacket::Connect { namespace: ns, data } if ns == namespace => {
                    let socket_id = data
                        .as_ref()
                        .and_then(|d| d.get("sid"))
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| handshake.sid.clone());
                    tracing::debug!(%socket_id, "Namespace joined");
                    return Ok(Session {
                        ws,
                        socket_id,
                        liveness: handshake.liveness_window(),
                    });
                }
                SocketPacket::ConnectError { namespace: ns, message } if ns == namespace => {
                    return Err(TransportError::Rejected(message));
                }
                _ => {}
            },
            EnginePacket::Ping(body) => {
                ws.send(Message::Text(EnginePacket::Pong(body).encode()))
                    .await
                    .map_err(|e| TransportError::WebSocket(e.to_string()))?;
            }
            EnginePacket::Close => return Err(TransportError::Closed),
            _ => {}
        }
    }
}

async fn next_text(ws: &mut WsStream) -> Result<String, TransportError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
        }
    }
}
