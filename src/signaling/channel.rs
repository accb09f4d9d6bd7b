//! Message Channel - Zustellung von Envelopes an einen Teilnehmer
//!
//! Der Kanal garantiert Reihenfolge pro Empfänger, aber keine Zustellung
//! über Reconnects hinweg. Eingehende Zustellungen gibt der Host an
//! [`SignalingDispatcher::handle`](super::SignalingDispatcher::handle) weiter.

use super::messages::ParticipantId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Not connected to signaling channel")]
    NotConnected,

    #[error("Recipient {0} is unreachable")]
    Unreachable(ParticipantId),

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// MESSAGE CHANNEL
// ============================================================================

/// Ausgehende Seite eines Publish/Subscribe-Kanals
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Stellt `payload` in die private Queue von `to`
    async fn publish(&self, to: &ParticipantId, payload: String) -> Result<(), ChannelError>;
}

// ============================================================================
// IN-PROCESS HUB
// ============================================================================

struct Mailbox {
    tx: mpsc::UnboundedSender<String>,
    online: bool,
}

/// In-Process Message Channel mit einer Queue pro Teilnehmer
///
/// Nützlich für Tests und lokale Demos: jeder Teilnehmer erhält über
/// [`MemoryHub::join`] einen eigenen Kanal und einen Receiver für seine Queue.
#[derive(Clone, Default)]
pub struct MemoryHub {
    mailboxes: Arc<Mutex<HashMap<ParticipantId, Mailbox>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert einen Teilnehmer und gibt seine eingehende Queue zurück
    pub fn join(&self, id: ParticipantId) -> (MemoryChannel, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes
            .lock()
            .insert(id.clone(), Mailbox { tx, online: true });

        let channel = MemoryChannel {
            hub: self.clone(),
            owner: id,
        };
        (channel, rx)
    }

    /// Simuliert Verbindungsverlust eines Teilnehmers
    pub fn set_online(&self, id: &ParticipantId, online: bool) {
        if let Some(mailbox) = self.mailboxes.lock().get_mut(id) {
            mailbox.online = online;
        }
    }

    fn is_online(&self, id: &ParticipantId) -> bool {
        self.mailboxes
            .lock()
            .get(id)
            .map(|m| m.online)
            .unwrap_or(false)
    }

    fn deliver(&self, to: &ParticipantId, payload: String) -> Result<(), ChannelError> {
        let mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes
            .get(to)
            .filter(|m| m.online)
            .ok_or_else(|| ChannelError::Unreachable(to.clone()))?;

        mailbox
            .tx
            .send(payload)
            .map_err(|_| ChannelError::Unreachable(to.clone()))
    }
}

/// Sendeseite eines Teilnehmers im [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryChannel {
    hub: MemoryHub,
    owner: ParticipantId,
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn publish(&self, to: &ParticipantId, payload: String) -> Result<(), ChannelError> {
        if !self.hub.is_online(&self.owner) {
            return Err(ChannelError::NotConnected);
        }
        self.hub.deliver(to, payload)
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("owner", &self.owner)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
