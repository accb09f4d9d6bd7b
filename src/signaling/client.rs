//! WebSocket Client für den STOMP-Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung:
//! - CONNECT mit Benutzername (Query-Parameter und Header)
//! - Subscription auf die private Call-Queue
//! - Heart-Beats
//! - Automatische Reconnection nach `reconnect_delay`
//!
//! Eingehende Envelopes landen roh (JSON) im Receiver, den
//! [`SignalingClient::connect`] zurückgibt.

use super::channel::{ChannelError, MessageChannel};
use super::messages::ParticipantId;
use super::stomp::{StompCommand, StompError, StompFrame};
use crate::config::ChannelConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIPTION_ID: &str = "sub-0";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("STOMP handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] StompError),

    #[error("Connection timed out")]
    Timeout,
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden und Subscription aktiv
    Connected,

    /// Verbindung getrennt (Reconnect folgt)
    Disconnected,

    /// ERROR-Frame vom Server
    ServerError { message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    reconnects: u32,
}

/// Warum eine Verbindung endete
enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Verbindungs-Task; hält keine Referenz auf den Client, damit Droppen
/// des Clients den Task beendet
struct Connection {
    config: ChannelConfig,
    username: ParticipantId,
    url: Url,
    state: Arc<RwLock<ClientState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// STOMP-over-WebSocket Message Channel
pub struct SignalingClient {
    config: ChannelConfig,
    username: ParticipantId,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<SignalingEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingClient {
    /// Verbindet mit dem Signaling-Server und abonniert die Call-Queue
    ///
    /// Der erste Verbindungsaufbau muss gelingen; danach reconnectet der
    /// Client selbstständig. Der zurückgegebene Receiver liefert den Body
    /// jedes MESSAGE-Frames in Zustellreihenfolge.
    pub async fn connect(
        config: ChannelConfig,
        username: ParticipantId,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<String>), SignalingError> {
        let url = connect_url(&config.signaling_url, &username)?;

        tracing::info!("Connecting to signaling server: {}", url);
        let ws = open_session(&url, &config, &username).await?;

        let (tx, rx) = mpsc::channel::<String>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(RwLock::new(ClientState {
            is_connected: true,
            reconnects: 0,
        }));
        let _ = event_tx.send(SignalingEvent::Connected);

        let connection = Connection {
            config: config.clone(),
            username: username.clone(),
            url,
            state: Arc::clone(&state),
            event_tx: event_tx.clone(),
        };
        tokio::spawn(connection.supervise(ws, rx, inbound_tx, shutdown_rx));

        let client = Arc::new(Self {
            config,
            username,
            state,
            tx,
            event_tx,
            shutdown_tx,
        });
        Ok((client, inbound_rx))
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn username(&self) -> &ParticipantId {
        &self.username
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Anzahl der Reconnects seit dem ersten Verbindungsaufbau
    pub fn reconnects(&self) -> u32 {
        self.state.read().reconnects
    }

    /// Trennt die Verbindung (kein Reconnect mehr)
    pub async fn disconnect(&self) {
        let _ = self.tx.send(StompFrame::disconnect().encode()).await;
        self.close();
    }

    /// Beendet den Verbindungs-Task ohne DISCONNECT-Frame
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl MessageChannel for SignalingClient {
    async fn publish(&self, to: &ParticipantId, payload: String) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        tracing::debug!("Publishing envelope to {}", to);
        let frame = StompFrame::send(&self.config.send_destination, payload);
        self.tx
            .send(frame.encode())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.config.signaling_url)
            .field("username", &self.username)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// CONNECTION TASK
// ============================================================================

impl Connection {
    /// Hält die Verbindung am Leben und reconnectet nach Abbrüchen
    async fn supervise(
        self,
        first: WsStream,
        mut outbound: mpsc::Receiver<String>,
        inbound: mpsc::UnboundedSender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut next = Some(first);

        loop {
            let ws = match next.take() {
                Some(ws) => ws,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                        _ = shutdown.changed() => break,
                    }
                    match open_session(&self.url, &self.config, &self.username).await {
                        Ok(ws) => {
                            {
                                let mut state = self.state.write();
                                state.is_connected = true;
                                state.reconnects += 1;
                            }
                            tracing::info!("Reconnected to signaling server");
                            let _ = self.event_tx.send(SignalingEvent::Connected);
                            ws
                        }
                        Err(e) => {
                            tracing::warn!("Reconnect failed: {}", e);
                            continue;
                        }
                    }
                }
            };

            let end = self.drive(ws, &mut outbound, &inbound, &mut shutdown).await;

            self.state.write().is_connected = false;
            let _ = self.event_tx.send(SignalingEvent::Disconnected);

            if let SessionEnd::Shutdown = end {
                break;
            }

            // Envelopes der alten Verbindung nicht nach dem Reconnect zustellen
            let stale = discard_pending(&mut outbound);
            if stale > 0 {
                tracing::warn!("Dropped {} unsent frames after connection loss", stale);
            }
        }

        tracing::info!("Signaling client stopped");
    }

    /// Liest und schreibt Frames bis die Verbindung endet
    async fn drive(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::Receiver<String>,
        inbound: &mpsc::UnboundedSender<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text, inbound),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket closed by server");
                        return SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            return SessionEnd::Dropped;
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
                _ = heartbeat.tick() => {
                    if write.send(Message::Text("\n".to_string())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                _ = shutdown.changed() => {
                    // DISCONNECT-Frame noch rausschicken
                    while let Ok(frame) = outbound.try_recv() {
                        let _ = write.send(Message::Text(frame)).await;
                    }
                    let _ = write.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, inbound: &mpsc::UnboundedSender<String>) {
        match StompFrame::parse(text) {
            Ok(None) => {}
            Ok(Some(frame)) => match frame.command {
                StompCommand::Message => {
                    if inbound.send(frame.body).is_err() {
                        tracing::warn!("Inbound receiver dropped, discarding delivery");
                    }
                }
                StompCommand::Error => {
                    let message = frame.header("message").unwrap_or("unknown").to_string();
                    tracing::error!("STOMP error: {} ({})", message, frame.body);
                    let _ = self.event_tx.send(SignalingEvent::ServerError { message });
                }
                other => tracing::debug!("Ignoring STOMP frame {}", other),
            },
            Err(e) => tracing::warn!("Discarding unparsable STOMP frame: {}", e),
        }
    }
}

/// Verwirft alle noch nicht gesendeten Frames
fn discard_pending(outbound: &mut mpsc::Receiver<String>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

// ============================================================================
// HANDSHAKE
// ============================================================================

/// Baut die WebSocket-URL mit `?username=` (http/https werden zu ws/wss)
pub fn connect_url(base: &str, username: &ParticipantId) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => return Err(SignalingError::InvalidUrl(format!("scheme {}", other))),
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(base.to_string()))?;
    }

    url.query_pairs_mut()
        .append_pair("username", username.as_str());
    Ok(url)
}

/// WebSocket öffnen, CONNECT/CONNECTED austauschen und Queue abonnieren
async fn open_session(
    url: &Url,
    config: &ChannelConfig,
    username: &ParticipantId,
) -> Result<WsStream, SignalingError> {
    let handshake = async {
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let host = url.host_str().unwrap_or("localhost");
        let heartbeat_ms = config.heartbeat_interval().as_millis() as u64;
        let connect = StompFrame::connect(host, username.as_str(), heartbeat_ms);
        ws.send(Message::Text(connect.encode()))
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        // Auf CONNECTED warten
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match StompFrame::parse(&text)? {
                    Some(frame) if frame.command == StompCommand::Connected => break,
                    Some(frame) if frame.command == StompCommand::Error => {
                        let message = frame.header("message").unwrap_or("rejected");
                        return Err(SignalingError::HandshakeFailed(message.to_string()));
                    }
                    _ => {}
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SignalingError::ConnectionFailed(e.to_string())),
                None => {
                    return Err(SignalingError::HandshakeFailed(
                        "Connection closed".to_string(),
                    ))
                }
            }
        }

        let subscribe = StompFrame::subscribe(SUBSCRIPTION_ID, &config.subscribe_destination);
        ws.send(Message::Text(subscribe.encode()))
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!(
            "STOMP session established as {}, subscribed to {}",
            username,
            config.subscribe_destination
        );
        Ok::<WsStream, SignalingError>(ws)
    };

    tokio::time::timeout(config.connect_timeout(), handshake)
        .await
        .map_err(|_| SignalingError::Timeout)?
}

// ============================================================================
// TESTS
// ============================================================================
