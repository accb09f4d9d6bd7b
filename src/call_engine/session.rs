//! Call Session - Zustand eines Anrufversuchs zwischen zwei Teilnehmern

use super::reconciler::CandidateReconciler;
use super::transport::SessionTransport;
use crate::signaling::ParticipantId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf, wartet auf Answer
    Calling,
    /// Eingehender Anruf, wartet auf Accept/Reject
    Incoming,
    /// Media Session steht
    InCall,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::InCall => "in_call",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Lesbare Momentaufnahme für UI und Observer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub local: ParticipantId,
    pub peer: Option<ParticipantId>,
    pub session_id: Option<Uuid>,
    /// Zeitpunkt des Eintritts in den aktuellen State
    pub state_since: DateTime<Utc>,
    /// Beginn des Gesprächs (Eintritt in InCall)
    pub started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub camera_off: bool,
    pub remote_ringing: bool,
}

impl CallSnapshot {
    pub fn idle(local: ParticipantId) -> Self {
        Self {
            state: CallState::Idle,
            local,
            peer: None,
            session_id: None,
            state_since: Utc::now(),
            started_at: None,
            muted: false,
            camera_off: false,
            remote_ringing: false,
        }
    }

    /// Gesprächsdauer; null außerhalb von InCall
    pub fn elapsed(&self) -> chrono::Duration {
        self.started_at
            .map(|start| Utc::now() - start)
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Verweildauer im aktuellen State (z.B. für Klingel-Timeouts)
    pub fn time_in_state(&self) -> chrono::Duration {
        Utc::now() - self.state_since
    }
}

// ============================================================================
// LIFECYCLE HOOKS
// ============================================================================

/// Hooks für Seiteneffekte des Hosts (Klingelton, Timer, ...)
///
/// Werden synchron im Engine-Task aufgerufen und sollten nicht blockieren.
pub trait SessionHooks: Send + Sync {
    fn on_exit_state(&self, _state: CallState, _snapshot: &CallSnapshot) {}

    fn on_enter_state(&self, _state: CallState, _snapshot: &CallSnapshot) {}
}

/// Hooks ohne Wirkung
#[derive(Debug, Default)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Eingehendes, noch nicht angenommenes Offer
#[derive(Debug, Clone)]
pub(crate) struct PendingOffer {
    pub sdp: String,
    pub received_at: DateTime<Utc>,
}

/// Ein Anrufversuch; gehört exklusiv dem Engine-Task
pub(crate) struct CallSession {
    pub id: Uuid,
    pub local: ParticipantId,
    pub remote: ParticipantId,
    pub state: CallState,
    pub transport: Option<Box<dyn SessionTransport>>,
    pub pending_offer: Option<PendingOffer>,
    pub candidates: CandidateReconciler,
    pub state_since: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub camera_off: bool,
    pub remote_ringing: bool,
}

impl CallSession {
    pub fn new(local: ParticipantId, remote: ParticipantId, state: CallState) -> Self {
        Self {
            id: Uuid::new_v4(),
            local,
            remote,
            state,
            transport: None,
            pending_offer: None,
            candidates: CandidateReconciler::new(),
            state_since: Utc::now(),
            started_at: None,
            muted: false,
            camera_off: false,
            remote_ringing: false,
        }
    }

    pub fn is_peer(&self, participant: &ParticipantId) -> bool {
        &self.remote == participant
    }

    pub fn transport(&self) -> Option<&dyn SessionTransport> {
        self.transport.as_deref()
    }

    /// Setzt den neuen State; InCall startet den Gesprächs-Timer
    pub fn enter(&mut self, state: CallState) {
        self.state = state;
        self.state_since = Utc::now();
        if state == CallState::InCall {
            self.started_at = Some(self.state_since);
        }
        if state != CallState::Incoming {
            self.pending_offer = None;
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            local: self.local.clone(),
            peer: Some(self.remote.clone()),
            session_id: Some(self.id),
            state_since: self.state_since,
            started_at: self.started_at,
            muted: self.muted,
            camera_off: self.camera_off,
            remote_ringing: self.remote_ringing,
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("has_transport", &self.transport.is_some())
            .field("queued_candidates", &self.candidates.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
