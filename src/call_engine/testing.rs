//! Fake Session Transport für Tests

use super::transport::{
    SdpKind, SessionTransport, TransportError, TransportEvent, TransportEventSender,
    TransportFactory, TransportRequest,
};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Beobachtbarer Zustand eines [`FakeTransport`]
#[derive(Default)]
pub struct FakeState {
    inner: Mutex<FakeInner>,
    events: Mutex<Option<TransportEventSender>>,
}

#[derive(Default)]
struct FakeInner {
    local: Option<(SdpKind, String)>,
    remote: Option<(SdpKind, String)>,
    candidates: Vec<String>,
    close_calls: usize,
    audio_enabled: Option<bool>,
    video_enabled: Option<bool>,
    fail_remote: bool,
}

impl FakeState {
    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner.lock().candidates.clone()
    }

    pub fn remote_description(&self) -> Option<(SdpKind, String)> {
        self.inner.lock().remote.clone()
    }

    pub fn local_description(&self) -> Option<(SdpKind, String)> {
        self.inner.lock().local.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.lock().close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    pub fn audio_enabled(&self) -> Option<bool> {
        self.inner.lock().audio_enabled
    }

    pub fn video_enabled(&self) -> Option<bool> {
        self.inner.lock().video_enabled
    }

    pub fn fail_remote_description(&self) {
        self.inner.lock().fail_remote = true;
    }

    /// Simuliert ein Event des Transports
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.emit(event),
            None => false,
        }
    }
}

/// Transport ohne Netzwerk; Candidates mit Inhalt `bad` werden abgelehnt
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new() -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok("fake-offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        if self.state.inner.lock().remote.is_none() {
            return Err(TransportError::Failed("no remote offer".to_string()));
        }
        Ok("fake-answer".to_string())
    }

    async fn set_local_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        self.state.inner.lock().local = Some((kind, sdp));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        let mut inner = self.state.inner.lock();
        if inner.fail_remote || sdp.is_empty() {
            return Err(TransportError::InvalidSdp(sdp));
        }
        inner.remote = Some((kind, sdp));
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.inner.lock().remote.is_some()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.state.inner.lock();
        if candidate.candidate == "bad" {
            return Err(TransportError::CandidateRejected(candidate.candidate));
        }
        if inner.remote.is_none() {
            return Err(TransportError::Failed("no remote description".to_string()));
        }
        inner.candidates.push(candidate.candidate);
        Ok(())
    }

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.state.inner.lock().audio_enabled = Some(enabled);
        Ok(())
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.state.inner.lock().video_enabled = Some(enabled);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.inner.lock().close_calls += 1;
        Ok(())
    }
}

/// Factory die [`FakeTransport`]s anlegt und ihre Zustände sammelt
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeState>>>,
    fail_next: Mutex<Option<TransportError>>,
    fail_remote: Mutex<bool>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<Arc<FakeState>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeState>> {
        self.created.lock().last().cloned()
    }

    /// Anzahl der noch nicht geschlossenen Transports
    pub fn live(&self) -> usize {
        self.created.lock().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn fail_next_create(&self, error: TransportError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Nächste Transports lehnen jede Remote Description ab
    pub fn fail_remote_descriptions(&self) {
        *self.fail_remote.lock() = true;
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        _request: TransportRequest,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        let (transport, state) = FakeTransport::new();
        *state.events.lock() = Some(events);
        if *self.fail_remote.lock() {
            state.fail_remote_description();
        }
        self.created.lock().push(state);
        Ok(Box::new(transport))
    }
}
