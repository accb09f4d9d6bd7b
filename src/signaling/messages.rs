//! Message Types für das Call-Signaling-Protokoll
//!
//! Ein Envelope ist ein JSON-Objekt mit `type`, `from`, `to` und einem
//! typabhängigen Payload:
//!
//! ```json
//! { "type": "offer", "from": "alice", "to": "bob", "sdp": "v=0..." }
//! { "type": "candidate", "from": "bob", "to": "alice",
//!   "candidate": { "candidate": "candidate:1 1 udp ...", "sdpMid": "0", "sdpMLineIndex": 0 } }
//! { "type": "hangup", "from": "alice", "to": "bob" }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Envelope ist fehlerhaft oder passt nicht zum Empfänger
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope addressed to {to}, not to us")]
    Misaddressed { to: ParticipantId },

    #[error("Envelope sent by ourselves")]
    SelfAddressed,
}

// ============================================================================
// PARTICIPANT IDENTITY
// ============================================================================

/// Opaker Handle eines Teilnehmers (Absender und Adresse im Message Channel)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// CONNECTIVITY CANDIDATE
// ============================================================================

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING ENVELOPE
// ============================================================================

/// Typ eines Envelopes (ohne Payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Hangup,
    Reject,
    Ring,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Hangup => "hangup",
            SignalKind::Reject => "reject",
            SignalKind::Ring => "ring",
        };
        f.write_str(name)
    }
}

/// Alle Signaling-Nachrichten zwischen zwei Teilnehmern
///
/// Unbekannte `type`-Werte oder fehlende Pflichtfelder schlagen beim
/// Deserialisieren fehl; zusätzliche Felder werden ignoriert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalEnvelope {
    /// SDP Offer des Anrufers
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: String,
    },

    /// SDP Answer des Angerufenen
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: String,
    },

    /// ICE Candidate
    Candidate {
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    },

    /// Anruf beendet
    Hangup {
        from: ParticipantId,
        to: ParticipantId,
    },

    /// Anruf abgelehnt
    Reject {
        from: ParticipantId,
        to: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Angerufener klingelt
    Ring {
        from: ParticipantId,
        to: ParticipantId,
    },
}

impl SignalEnvelope {
    pub fn offer(from: ParticipantId, to: ParticipantId, sdp: String) -> Self {
        Self::Offer { from, to, sdp }
    }

    pub fn answer(from: ParticipantId, to: ParticipantId, sdp: String) -> Self {
        Self::Answer { from, to, sdp }
    }

    pub fn candidate(from: ParticipantId, to: ParticipantId, candidate: IceCandidate) -> Self {
        Self::Candidate {
            from,
            to,
            candidate,
        }
    }

    pub fn hangup(from: ParticipantId, to: ParticipantId) -> Self {
        Self::Hangup { from, to }
    }

    pub fn reject(from: ParticipantId, to: ParticipantId, reason: Option<String>) -> Self {
        Self::Reject { from, to, reason }
    }

    pub fn ring(from: ParticipantId, to: ParticipantId) -> Self {
        Self::Ring { from, to }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::Candidate { .. } => SignalKind::Candidate,
            Self::Hangup { .. } => SignalKind::Hangup,
            Self::Reject { .. } => SignalKind::Reject,
            Self::Ring { .. } => SignalKind::Ring,
        }
    }

    pub fn from(&self) -> &ParticipantId {
        match self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::Candidate { from, .. }
            | Self::Hangup { from, .. }
            | Self::Reject { from, .. }
            | Self::Ring { from, .. } => from,
        }
    }

    pub fn to(&self) -> &ParticipantId {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::Candidate { to, .. }
            | Self::Hangup { to, .. }
            | Self::Reject { to, .. }
            | Self::Ring { to, .. } => to,
        }
    }

    /// Parst ein Envelope aus JSON
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialisiert das Envelope als JSON
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// TESTS
// ============================================================================
