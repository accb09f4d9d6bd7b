//! Pulse Signaling - Signaling Engine für P2P Audio/Video-Anrufe
//!
//! Eine Signaling-Engine für Zwei-Personen-Anrufe mit:
//! - STOMP-over-WebSocket als Message Channel
//! - WebRTC für die Media Session
//! - Einem Zustandsautomaten pro Teilnehmer (Idle/Calling/Incoming/InCall)

pub mod call_engine;
pub mod config;
pub mod signaling;

use call_engine::{CallEngine, WebRtcTransportFactory};
use config::Config;
use signaling::{ParticipantId, SignalingClient, SignalingError, SignalingEvent};
use std::sync::{Arc, Weak};

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (RUST_LOG hat Vorrang vor den Defaults)
///
/// Mehrfache Aufrufe sind erlaubt; nur der erste installiert den Subscriber.
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["pulse_signaling=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CALL NODE
// ============================================================================

/// Ein angemeldeter Teilnehmer: Signaling Client plus Call Engine
///
/// Verdrahtet eingehende STOMP-Nachrichten mit dem Dispatcher und meldet
/// Verbindungsabbrüche als Kanalverlust an die Engine.
pub struct CallNode {
    client: Arc<SignalingClient>,
    engine: Arc<CallEngine>,
}

impl CallNode {
    /// Verbindet als `username` und startet die Call Engine
    pub async fn connect(config: &Config, username: ParticipantId) -> Result<Self, SignalingError> {
        tracing::info!("Connecting as '{}'...", username);

        let (client, mut inbound) =
            SignalingClient::connect(config.channel.clone(), username.clone()).await?;

        let factory = Arc::new(WebRtcTransportFactory::new(&config.engine));
        let engine = Arc::new(
            CallEngine::builder(username, client.clone(), factory)
                .event_capacity(config.engine.event_capacity)
                .spawn(),
        );

        // Eingehende Envelopes an den Dispatcher
        let dispatcher = engine.dispatcher();
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                dispatcher.handle(&raw);
            }
            tracing::debug!("Inbound pump stopped");
        });

        // Verbindungsabbruch beendet einen laufenden Anruf lokal
        let mut events = client.subscribe();
        let weak_engine: Weak<CallEngine> = Arc::downgrade(&engine);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(engine) = weak_engine.upgrade() else {
                    break;
                };
                match event {
                    SignalingEvent::Disconnected => engine.channel_lost(),
                    SignalingEvent::ServerError { message } => {
                        tracing::error!("Signaling server error: {}", message);
                    }
                    SignalingEvent::Connected => {}
                }
            }
        });

        Ok(Self { client, engine })
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.engine
    }

    pub fn client(&self) -> &Arc<SignalingClient> {
        &self.client
    }

    /// Legt auf und trennt die Verbindung
    pub async fn shutdown(&self) {
        self.engine.hang_up().await;
        self.client.disconnect().await;
    }
}

impl Drop for CallNode {
    fn drop(&mut self) {
        // Der Inbound-Pump hält den Client über den Dispatcher am Leben
        self.client.close();
    }
}

impl std::fmt::Debug for CallNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallNode")
            .field("client", &self.client)
            .field("engine", &self.engine)
            .finish()
    }
}
