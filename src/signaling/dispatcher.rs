//! Signaling Dispatcher
//!
//! Einzige Komponente mit Zugriff auf den Message Channel:
//! - ausgehende Envelopes serialisieren und an `to` publizieren
//! - eingehende Zustellungen parsen, prüfen und an die Call Engine leiten
//!
//! Fehlerhafte oder fehladressierte Envelopes werden geloggt und verworfen.

use super::channel::{ChannelError, MessageChannel};
use super::messages::{ParticipantId, ProtocolError, SignalEnvelope, SignalKind};
use crate::call_engine::EngineInput;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Ergebnis von [`SignalingDispatcher::handle`]
#[derive(Debug)]
pub enum Dispatch {
    /// An die Call Engine weitergeleitet
    Routed(SignalKind),
    /// Verworfen (fehlerhaft oder nicht für uns)
    Discarded(ProtocolError),
    /// Call Engine läuft nicht mehr
    EngineStopped,
}

impl Dispatch {
    pub fn is_routed(&self) -> bool {
        matches!(self, Dispatch::Routed(_))
    }
}

pub struct SignalingDispatcher {
    local: ParticipantId,
    channel: Arc<dyn MessageChannel>,
    engine: mpsc::WeakUnboundedSender<EngineInput>,
}

impl SignalingDispatcher {
    pub(crate) fn new(
        local: ParticipantId,
        channel: Arc<dyn MessageChannel>,
        engine: mpsc::WeakUnboundedSender<EngineInput>,
    ) -> Self {
        Self {
            local,
            channel,
            engine,
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Einstiegspunkt für jede Zustellung des Message Channels
    pub fn handle(&self, raw: &str) -> Dispatch {
        let envelope = match self.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Discarding inbound envelope: {}", e);
                return Dispatch::Discarded(e);
            }
        };

        let kind = envelope.kind();
        tracing::debug!("Inbound {} from {}", kind, envelope.from());

        let Some(engine) = self.engine.upgrade() else {
            tracing::warn!("Call engine stopped, dropping {} envelope", kind);
            return Dispatch::EngineStopped;
        };

        match engine.send(EngineInput::Signal(envelope)) {
            Ok(()) => Dispatch::Routed(kind),
            Err(_) => Dispatch::EngineStopped,
        }
    }

    /// Parst und prüft die Adressierung eines Envelopes
    pub fn decode(&self, raw: &str) -> Result<SignalEnvelope, ProtocolError> {
        let envelope = SignalEnvelope::decode(raw)?;

        if envelope.to() != &self.local {
            return Err(ProtocolError::Misaddressed {
                to: envelope.to().clone(),
            });
        }
        if envelope.from() == &self.local {
            return Err(ProtocolError::SelfAddressed);
        }
        Ok(envelope)
    }

    /// Sendet ein Envelope an `to` (best effort)
    pub async fn send(&self, envelope: &SignalEnvelope) -> Result<(), ChannelError> {
        let payload = envelope
            .encode()
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        tracing::debug!("Outbound {} to {}", envelope.kind(), envelope.to());
        let result = self.channel.publish(envelope.to(), payload).await;
        if let Err(e) = &result {
            tracing::warn!(
                "Failed to deliver {} to {}: {}",
                envelope.kind(),
                envelope.to(),
                e
            );
        }
        result
    }
}

impl std::fmt::Debug for SignalingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingDispatcher")
            .field("local", &self.local)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
