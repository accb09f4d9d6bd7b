//! Session Transport - Schnittstelle zur Media-Transport-Bibliothek
//!
//! Pro Anrufversuch existiert genau eine Transport-Instanz. Sie gehört
//! exklusiv der Call Session und meldet ihre Events (lokale Candidates,
//! Remote Tracks, Verbindungsstatus) über einen [`TransportEventSender`]
//! zurück an die Engine.

use crate::signaling::{IceCandidate, ParticipantId};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::engine::EngineInput;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Local media device unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("Transport error: {0}")]
    Failed(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Verbindungsstatus des Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionHealth {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionHealth {
    /// Failed/Disconnected beenden einen laufenden Anruf
    pub fn is_lost(&self) -> bool {
        matches!(self, ConnectionHealth::Failed | ConnectionHealth::Disconnected)
    }
}

/// Eingehender Media-Track vom Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub kind: String,
    pub track_id: String,
    pub stream_id: String,
}

/// Events die ein Transport an die Engine meldet
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionHealth),
}

/// Rückkanal vom Transport zur Engine, markiert mit der Session-ID
///
/// Hält die Engine nicht am Leben: ist die Engine beendet, werden Events
/// verworfen.
#[derive(Clone, Debug)]
pub struct TransportEventSender {
    session_id: Uuid,
    tx: mpsc::WeakUnboundedSender<EngineInput>,
}

impl TransportEventSender {
    pub(crate) fn new(session_id: Uuid, tx: mpsc::WeakUnboundedSender<EngineInput>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Meldet ein Event; gibt `false` zurück wenn die Engine nicht mehr läuft
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx
                .send(EngineInput::Transport {
                    session_id: self.session_id,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

/// Kontext für das Anlegen eines Transports
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub session_id: Uuid,
    pub local: ParticipantId,
    pub remote: ParticipantId,
}

// ============================================================================
// TRAITS
// ============================================================================

/// Fähigkeiten der Media-Transport-Bibliothek für einen Anrufversuch
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError>;

    /// `true` sobald eine Remote Description angewendet wurde
    async fn has_remote_description(&self) -> bool;

    /// Schlägt mit [`TransportError::CandidateRejected`] bei ungültigem Input fehl
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), TransportError>;

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError>;

    /// Schließt die Verbindung und gibt lokale Media frei. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Legt Transports an (inkl. Belegung der lokalen Media-Geräte)
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        request: TransportRequest,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionTransport>, TransportError>;
}
