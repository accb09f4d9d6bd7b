//! Call Engine - Zustandsautomat für den Anruf-Lebenszyklus
//!
//! Pro Teilnehmer läuft genau ein Engine-Task. Alle Eingaben (UI-Befehle,
//! eingehende Envelopes, Transport-Events, Kanalverlust) laufen durch eine
//! FIFO-Queue und werden nacheinander verarbeitet. Während eine
//! Transport-Operation läuft, warten weitere Eingaben in der Queue.
//!
//! ```text
//!            start_call                    Answer
//!   Idle ─────────────────▶ Calling ─────────────────▶ InCall
//!    │ ▲                       │                          │
//!    │ └──── Reject/Hangup ────┘                          │
//!    │ ▲                                                  │
//!    │ └──────────────────── Hangup / Failed ─────────────┘
//!    │ Offer                  accept
//!    └──────▶ Incoming ─────────────────▶ InCall
//! ```

use super::reconciler::CandidateReconciler;
use super::session::{
    CallSession, CallSnapshot, CallState, NoopHooks, PendingOffer, SessionHooks,
};
use super::transport::{
    RemoteTrack, SdpKind, SessionTransport, TransportError, TransportEvent,
    TransportEventSender, TransportFactory, TransportRequest,
};
use crate::signaling::{
    Dispatch, IceCandidate, MessageChannel, ParticipantId, SignalEnvelope, SignalKind,
    SignalingDispatcher,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use uuid::Uuid;

/// Grund im Reject-Envelope bei besetzter Leitung
pub const BUSY_REASON: &str = "busy";

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehlbedienung der Engine durch den Host
///
/// Transport-, Protokoll- und Kanalfehler landen hier nie; sie führen zu
/// [`CallEvent::CallFailed`] und einem Übergang nach Idle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Cannot call yourself")]
    InvalidPeer,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Call engine stopped")]
    EngineStopped,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Jeder Zustandsübergang
    StateChanged(CallSnapshot),
    /// Eingehender Anruf wartet auf Accept/Reject
    IncomingCall { from: ParticipantId },
    /// Gegenseite klingelt
    RemoteRinging { peer: ParticipantId },
    RemoteTrack(RemoteTrack),
    MediaChanged { muted: bool, camera_off: bool },
    /// Offer eines Dritten wurde wegen eines laufenden Anrufs abgelehnt
    BusyRejected { from: ParticipantId },
    /// Anrufversuch wegen Transport- oder Verbindungsfehler abgebrochen
    CallFailed { reason: String },
}

// ============================================================================
// ENGINE INPUT
// ============================================================================

pub(crate) enum EngineInput {
    Command(Command),
    Signal(SignalEnvelope),
    Transport {
        session_id: Uuid,
        event: TransportEvent,
    },
    ChannelLost,
}

pub(crate) enum Command {
    StartCall {
        peer: ParticipantId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Status {
        reply: oneshot::Sender<CallSnapshot>,
    },
}

/// Zwischen Handle und Engine-Task geteilter Zustand
struct Shared {
    snapshot: RwLock<CallSnapshot>,
    hangup_requested: AtomicBool,
    hangup_notify: Notify,
}

/// Ergebnis einer abbrechbaren Transport-Operation
enum Step<T> {
    Done(T),
    Failed(TransportError),
    Cancelled,
}

// ============================================================================
// CALL ENGINE (HANDLE)
// ============================================================================

/// Handle auf die Call Engine eines Teilnehmers
///
/// Droppen des Handles beendet den Engine-Task; ein laufender Anruf wird
/// dabei aufgelegt.
pub struct CallEngine {
    local: ParticipantId,
    input_tx: mpsc::UnboundedSender<EngineInput>,
    dispatcher: Arc<SignalingDispatcher>,
    shared: Arc<Shared>,
    event_tx: broadcast::Sender<CallEvent>,
}

pub struct CallEngineBuilder {
    local: ParticipantId,
    channel: Arc<dyn MessageChannel>,
    factory: Arc<dyn TransportFactory>,
    hooks: Arc<dyn SessionHooks>,
    event_capacity: usize,
}

impl CallEngineBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Startet den Engine-Task (benötigt eine laufende Tokio-Runtime)
    pub fn spawn(self) -> CallEngine {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(self.event_capacity);

        let dispatcher = Arc::new(SignalingDispatcher::new(
            self.local.clone(),
            self.channel,
            input_tx.downgrade(),
        ));
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(CallSnapshot::idle(self.local.clone())),
            hangup_requested: AtomicBool::new(false),
            hangup_notify: Notify::new(),
        });

        let actor = EngineActor {
            local: self.local.clone(),
            factory: self.factory,
            dispatcher: Arc::clone(&dispatcher),
            inputs: input_tx.downgrade(),
            session: None,
            shared: Arc::clone(&shared),
            events: event_tx.clone(),
            hooks: self.hooks,
        };
        tokio::spawn(actor.run(input_rx));

        CallEngine {
            local: self.local,
            input_tx,
            dispatcher,
            shared,
            event_tx,
        }
    }
}

impl CallEngine {
    pub fn builder(
        local: ParticipantId,
        channel: Arc<dyn MessageChannel>,
        factory: Arc<dyn TransportFactory>,
    ) -> CallEngineBuilder {
        CallEngineBuilder {
            local,
            channel,
            factory,
            hooks: Arc::new(NoopHooks),
            event_capacity: 100,
        }
    }

    /// Erstellt eine Engine mit Default-Einstellungen
    pub fn new(
        local: ParticipantId,
        channel: Arc<dyn MessageChannel>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self::builder(local, channel, factory).spawn()
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Dispatcher für eingehende Zustellungen des Message Channels
    pub fn dispatcher(&self) -> Arc<SignalingDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Kurzform für `dispatcher().handle(raw)`
    pub fn handle(&self, raw: &str) -> Dispatch {
        self.dispatcher.handle(raw)
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Zuletzt veröffentlichter Zustand (ohne auf die Queue zu warten)
    pub fn snapshot(&self) -> CallSnapshot {
        self.shared.snapshot.read().clone()
    }

    pub fn state(&self) -> CallState {
        self.shared.snapshot.read().state
    }

    /// Zustand nach Verarbeitung aller bisher eingereihten Eingaben
    pub async fn status(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(&self, peer: impl Into<ParticipantId>) -> Result<(), CallError> {
        let peer = peer.into();
        self.request(|reply| Command::StartCall { peer, reply })
            .await?
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn accept_incoming_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    /// Lehnt den eingehenden Anruf ab
    pub async fn reject_incoming_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// Beendet den aktuellen Anruf; in jedem State erlaubt
    ///
    /// Eine laufende Transport-Operation wird abgebrochen, bevor der
    /// Befehl in der Queue an der Reihe ist.
    pub async fn hang_up(&self) {
        self.shared.hangup_requested.store(true, Ordering::SeqCst);
        self.shared.hangup_notify.notify_waiters();
        let _ = self.request(|reply| Command::HangUp { reply }).await;
    }

    /// Schaltet das Mikrofon stumm/laut; gibt den neuen Mute-Status zurück
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await?
    }

    /// Schaltet die Kamera aus/ein; gibt `true` zurück wenn sie aus ist
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await?
    }

    /// Meldet den Verlust des Message Channels
    pub fn channel_lost(&self) {
        let _ = self.input_tx.send(EngineInput::ChannelLost);
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.input_tx
            .send(EngineInput::Command(command(reply)))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local", &self.local)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// ============================================================================
// ENGINE TASK
// ============================================================================

struct EngineActor {
    local: ParticipantId,
    factory: Arc<dyn TransportFactory>,
    dispatcher: Arc<SignalingDispatcher>,
    inputs: mpsc::WeakUnboundedSender<EngineInput>,
    session: Option<CallSession>,
    shared: Arc<Shared>,
    events: broadcast::Sender<CallEvent>,
    hooks: Arc<dyn SessionHooks>,
}

impl EngineActor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<EngineInput>) {
        tracing::info!("Call engine started for {}", self.local);

        while let Some(input) = inputs.recv().await {
            match input {
                EngineInput::Command(command) => self.on_command(command).await,
                EngineInput::Signal(envelope) => self.on_signal(envelope).await,
                EngineInput::Transport { session_id, event } => {
                    self.on_transport_event(session_id, event).await
                }
                EngineInput::ChannelLost => self.on_channel_lost().await,
            }
        }

        // Handle gedroppt
        self.hang_up().await;
        tracing::info!("Call engine stopped for {}", self.local);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartCall { peer, reply } => {
                let result = self.start_call(peer).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            Command::Reject { reply } => {
                let result = self.reject().await;
                let _ = reply.send(result);
            }
            Command::HangUp { reply } => {
                self.shared.hangup_requested.store(false, Ordering::SeqCst);
                self.hang_up().await;
                let _ = reply.send(());
            }
            Command::ToggleMute { reply } => {
                let result = self.toggle_mute().await;
                let _ = reply.send(result);
            }
            Command::ToggleCamera { reply } => {
                let result = self.toggle_camera().await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.shared.snapshot.read().clone());
            }
        }
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    async fn start_call(&mut self, peer: ParticipantId) -> Result<(), CallError> {
        if peer == self.local {
            return Err(CallError::InvalidPeer);
        }
        if self.session.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        tracing::info!("Starting call to {}", peer);
        self.begin(CallSession::new(
            self.local.clone(),
            peer.clone(),
            CallState::Calling,
        ));

        match self.create_transport().await {
            Step::Done(()) => {}
            Step::Failed(e) => {
                self.abort(e).await;
                return Ok(());
            }
            Step::Cancelled => return Ok(()),
        }

        let step = match self.transport() {
            Some(transport) => {
                self.guarded(async {
                    let sdp = transport.create_offer().await?;
                    transport
                        .set_local_description(SdpKind::Offer, sdp.clone())
                        .await?;
                    Ok::<_, TransportError>(sdp)
                })
                .await
            }
            None => return Ok(()),
        };
        let offer = match step {
            Step::Done(sdp) => sdp,
            Step::Failed(e) => {
                self.abort(e).await;
                return Ok(());
            }
            Step::Cancelled => return Ok(()),
        };

        self.send(SignalEnvelope::offer(self.local.clone(), peer, offer))
            .await;
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let offer = match self.session.as_mut() {
            Some(session) if session.state == CallState::Incoming => session
                .pending_offer
                .take()
                .ok_or(CallError::NoIncomingCall)?,
            _ => return Err(CallError::NoIncomingCall),
        };
        tracing::info!(
            "Accepting call (offer received at {})",
            offer.received_at.to_rfc3339()
        );

        match self.create_transport().await {
            Step::Done(()) => {}
            Step::Failed(e) => {
                self.abort(e).await;
                return Ok(());
            }
            Step::Cancelled => return Ok(()),
        }

        let step = match self.transport() {
            Some(transport) => {
                self.guarded(transport.set_remote_description(SdpKind::Offer, offer.sdp))
                    .await
            }
            None => return Ok(()),
        };
        match step {
            Step::Done(()) => {}
            Step::Failed(e) => {
                self.abort(e).await;
                return Ok(());
            }
            Step::Cancelled => return Ok(()),
        }

        self.flush_candidates().await;

        let step = match self.transport() {
            Some(transport) => {
                self.guarded(async {
                    let sdp = transport.create_answer().await?;
                    transport
                        .set_local_description(SdpKind::Answer, sdp.clone())
                        .await?;
                    Ok::<_, TransportError>(sdp)
                })
                .await
            }
            None => return Ok(()),
        };
        let answer = match step {
            Step::Done(sdp) => sdp,
            Step::Failed(e) => {
                self.abort(e).await;
                return Ok(());
            }
            Step::Cancelled => return Ok(()),
        };

        if let Some(peer) = self.peer() {
            self.send(SignalEnvelope::answer(self.local.clone(), peer, answer))
                .await;
        }
        self.transition(CallState::InCall);
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        let peer = match self.session.as_ref() {
            Some(session) if session.state == CallState::Incoming => session.remote.clone(),
            _ => return Err(CallError::NoIncomingCall),
        };

        tracing::info!("Rejecting call from {}", peer);
        self.finish().await;
        self.send(SignalEnvelope::reject(self.local.clone(), peer, None))
            .await;
        Ok(())
    }

    /// Lokales Auflegen; Incoming wird als Reject gemeldet
    async fn hang_up(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let peer = session.remote.clone();
        let envelope = match session.state {
            CallState::Incoming => SignalEnvelope::reject(self.local.clone(), peer.clone(), None),
            _ => SignalEnvelope::hangup(self.local.clone(), peer.clone()),
        };

        tracing::info!("Hanging up call with {}", peer);
        self.finish().await;
        self.send(envelope).await;
    }

    async fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        session.muted = !session.muted;
        let muted = session.muted;

        if let Some(transport) = session.transport.as_deref() {
            if let Err(e) = transport.set_audio_enabled(!muted).await {
                tracing::warn!("Failed to switch microphone: {}", e);
            }
        }

        self.media_changed();
        Ok(muted)
    }

    async fn toggle_camera(&mut self) -> Result<bool, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        session.camera_off = !session.camera_off;
        let camera_off = session.camera_off;

        if let Some(transport) = session.transport.as_deref() {
            if let Err(e) = transport.set_video_enabled(!camera_off).await {
                tracing::warn!("Failed to switch camera: {}", e);
            }
        }

        self.media_changed();
        Ok(camera_off)
    }

    // ========================================================================
    // INBOUND SIGNALS
    // ========================================================================

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::Offer { from, sdp, .. } => self.on_offer(from, sdp).await,
            SignalEnvelope::Answer { from, sdp, .. } => self.on_answer(from, sdp).await,
            SignalEnvelope::Candidate {
                from, candidate, ..
            } => self.on_candidate(from, candidate).await,
            SignalEnvelope::Hangup { from, .. } => self.on_hangup(from).await,
            SignalEnvelope::Reject { from, reason, .. } => self.on_reject(from, reason).await,
            SignalEnvelope::Ring { from, .. } => self.on_ring(from),
        }
    }

    async fn on_offer(&mut self, from: ParticipantId, sdp: String) {
        let pending = PendingOffer {
            sdp,
            received_at: Utc::now(),
        };

        let Some((state, is_peer)) = self
            .session
            .as_ref()
            .map(|s| (s.state, s.is_peer(&from)))
        else {
            tracing::info!("Incoming call from {}", from);
            let mut session =
                CallSession::new(self.local.clone(), from.clone(), CallState::Incoming);
            session.pending_offer = Some(pending);
            self.begin(session);
            self.announce_incoming(from).await;
            return;
        };

        if !is_peer {
            tracing::info!("Busy, rejecting offer from {}", from);
            self.send(SignalEnvelope::reject(
                self.local.clone(),
                from.clone(),
                Some(BUSY_REASON.to_string()),
            ))
            .await;
            let _ = self.events.send(CallEvent::BusyRejected { from });
            return;
        }

        match state {
            CallState::Incoming => {
                tracing::debug!("Replacing pending offer from {}", from);
                if let Some(session) = self.session.as_mut() {
                    session.pending_offer = Some(pending);
                }
            }
            CallState::Calling if self.local < from => {
                tracing::info!("Call glare with {}, keeping our offer", from);
            }
            CallState::Calling => {
                tracing::info!("Call glare with {}, answering their offer", from);
                let transport = self.session.as_mut().and_then(|session| {
                    // Neue Session-ID: Events des alten Transports sind ab jetzt veraltet
                    session.id = Uuid::new_v4();
                    session.pending_offer = Some(pending);
                    session.remote_ringing = false;
                    session.transport.take()
                });
                if let Some(transport) = transport {
                    if let Err(e) = transport.close().await {
                        tracing::warn!("Failed to close transport: {}", e);
                    }
                }
                self.transition(CallState::Incoming);
                self.announce_incoming(from).await;
            }
            _ => self.discard(SignalKind::Offer, &from),
        }
    }

    async fn on_answer(&mut self, from: ParticipantId, sdp: String) {
        if !self.session_in(&from, &[CallState::Calling]) {
            self.discard(SignalKind::Answer, &from);
            return;
        }

        let step = match self.transport() {
            Some(transport) => {
                self.guarded(transport.set_remote_description(SdpKind::Answer, sdp))
                    .await
            }
            None => {
                self.discard(SignalKind::Answer, &from);
                return;
            }
        };
        match step {
            Step::Done(()) => {}
            Step::Failed(e) => {
                self.abort(e).await;
                return;
            }
            Step::Cancelled => return,
        }

        self.flush_candidates().await;
        self.transition(CallState::InCall);
    }

    async fn on_candidate(&mut self, from: ParticipantId, candidate: IceCandidate) {
        let Some(session) = self.session.as_ref().filter(|s| s.is_peer(&from)) else {
            tracing::debug!("Dropping candidate from {} for superseded session", from);
            return;
        };

        if CandidateReconciler::should_queue(session.transport()).await {
            if let Some(session) = self.session.as_mut() {
                session.candidates.enqueue(candidate);
                tracing::debug!("Queued candidate ({} pending)", session.candidates.len());
            }
            return;
        }

        let step = match self.transport() {
            Some(transport) => self.guarded(transport.add_candidate(candidate)).await,
            None => return,
        };
        if let Step::Failed(e) = step {
            tracing::warn!("Failed to add candidate from {}: {}", from, e);
        }
    }

    async fn on_hangup(&mut self, from: ParticipantId) {
        if !self.session_in(
            &from,
            &[CallState::Calling, CallState::Incoming, CallState::InCall],
        ) {
            self.discard(SignalKind::Hangup, &from);
            return;
        }

        tracing::info!("Call ended by {}", from);
        self.finish().await;
    }

    async fn on_reject(&mut self, from: ParticipantId, reason: Option<String>) {
        if !self.session_in(&from, &[CallState::Calling, CallState::Incoming]) {
            self.discard(SignalKind::Reject, &from);
            return;
        }

        tracing::info!("Call rejected by {} (reason: {:?})", from, reason);
        self.finish().await;
    }

    fn on_ring(&mut self, from: ParticipantId) {
        if !self.session_in(&from, &[CallState::Calling]) {
            self.discard(SignalKind::Ring, &from);
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.remote_ringing = true;
            let snapshot = session.snapshot();
            *self.shared.snapshot.write() = snapshot;
        }
        let _ = self.events.send(CallEvent::RemoteRinging { peer: from });
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn on_transport_event(&mut self, session_id: Uuid, event: TransportEvent) {
        let Some(session) = self.session.as_ref().filter(|s| s.id == session_id) else {
            tracing::debug!("Ignoring event from released transport {}", session_id);
            return;
        };
        let peer = session.remote.clone();
        let state = session.state;

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(SignalEnvelope::candidate(self.local.clone(), peer, candidate))
                    .await;
            }
            TransportEvent::RemoteTrack(track) => {
                tracing::info!("Received {} track from {}", track.kind, peer);
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            TransportEvent::ConnectionState(health) => {
                tracing::info!("Peer connection state: {:?}", health);
                if health.is_lost() && matches!(state, CallState::Calling | CallState::InCall) {
                    tracing::warn!("Connection to {} lost, hanging up", peer);
                    let _ = self.events.send(CallEvent::CallFailed {
                        reason: format!("connection {:?}", health).to_lowercase(),
                    });
                    self.hang_up().await;
                }
            }
        }
    }

    async fn on_channel_lost(&mut self) {
        if self.session.is_none() {
            return;
        }

        tracing::warn!("Signaling channel lost, ending call locally");
        let _ = self.events.send(CallEvent::CallFailed {
            reason: "signaling channel lost".to_string(),
        });
        self.finish().await;
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Legt den Transport der aktuellen Session an
    async fn create_transport(&mut self) -> Step<()> {
        let Some(session) = self.session.as_ref() else {
            return Step::Cancelled;
        };
        let request = TransportRequest {
            session_id: session.id,
            local: session.local.clone(),
            remote: session.remote.clone(),
        };
        let events = TransportEventSender::new(session.id, self.inputs.clone());

        let factory = Arc::clone(&self.factory);
        let transport = match self.guarded(factory.create(request, events)).await {
            Step::Done(transport) => transport,
            Step::Failed(e) => return Step::Failed(e),
            Step::Cancelled => return Step::Cancelled,
        };

        let Some(session) = self.session.as_mut() else {
            let _ = transport.close().await;
            return Step::Cancelled;
        };

        // Media-Flags gelten auch wenn sie vor dem Transport gesetzt wurden
        if session.muted {
            if let Err(e) = transport.set_audio_enabled(false).await {
                tracing::warn!("Failed to mute new transport: {}", e);
            }
        }
        if session.camera_off {
            if let Err(e) = transport.set_video_enabled(false).await {
                tracing::warn!("Failed to disable camera on new transport: {}", e);
            }
        }
        session.transport = Some(transport);
        Step::Done(())
    }

    /// Führt eine Transport-Operation aus, solange kein Hangup angefordert ist
    async fn guarded<T, F>(&self, op: F) -> Step<T>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let notified = self.shared.hangup_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.shared.hangup_requested.load(Ordering::SeqCst) {
            tracing::info!("Hangup pending, skipping transport operation");
            return Step::Cancelled;
        }

        tokio::select! {
            biased;
            _ = &mut notified => {
                tracing::info!("Hangup requested, abandoning transport operation");
                Step::Cancelled
            }
            result = op => match result {
                Ok(value) => Step::Done(value),
                Err(e) => Step::Failed(e),
            },
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(transport) = session.transport.as_deref() {
            session.candidates.flush(transport).await;
        }
    }

    /// Bricht den Anrufversuch nach einem Transport-Fehler ab
    async fn abort(&mut self, error: TransportError) {
        tracing::error!("Call attempt failed: {}", error);
        let _ = self.events.send(CallEvent::CallFailed {
            reason: error.to_string(),
        });
        self.hang_up().await;
    }

    async fn announce_incoming(&mut self, from: ParticipantId) {
        let _ = self
            .events
            .send(CallEvent::IncomingCall { from: from.clone() });
        self.send(SignalEnvelope::ring(self.local.clone(), from))
            .await;
    }

    /// Idle → neue Session
    fn begin(&mut self, session: CallSession) {
        let idle = self.shared.snapshot.read().clone();
        self.hooks.on_exit_state(CallState::Idle, &idle);

        let snapshot = session.snapshot();
        tracing::info!(
            "Call {}: idle -> {} (peer {})",
            session.id,
            session.state,
            session.remote
        );
        self.session = Some(session);
        self.publish(snapshot);
    }

    /// Übergang zwischen zwei Nicht-Idle States
    fn transition(&mut self, to: CallState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let from = session.state;
        let before = session.snapshot();
        session.enter(to);
        let after = session.snapshot();

        tracing::info!(
            "Call {}: {} -> {} (peer {})",
            session.id,
            from,
            to,
            session.remote
        );
        self.hooks.on_exit_state(from, &before);
        self.publish(after);
    }

    /// Zurück nach Idle; gibt den Transport frei
    async fn finish(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let before = session.snapshot();
        let idle = CallSnapshot::idle(self.local.clone());
        *self.shared.snapshot.write() = idle.clone();

        session.candidates.clear();
        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Failed to close transport: {}", e);
            }
        }

        tracing::info!("Call {}: {} -> idle", session.id, session.state);
        self.hooks.on_exit_state(session.state, &before);
        self.publish(idle);
    }

    /// Veröffentlicht einen neuen State an Snapshot, Hooks und Subscriber
    fn publish(&self, snapshot: CallSnapshot) {
        *self.shared.snapshot.write() = snapshot.clone();
        self.hooks.on_enter_state(snapshot.state, &snapshot);
        let _ = self.events.send(CallEvent::StateChanged(snapshot));
    }

    fn media_changed(&self) {
        if let Some(session) = self.session.as_ref() {
            *self.shared.snapshot.write() = session.snapshot();
            let _ = self.events.send(CallEvent::MediaChanged {
                muted: session.muted,
                camera_off: session.camera_off,
            });
        }
    }

    async fn send(&self, envelope: SignalEnvelope) {
        // Best effort: Fehler loggt der Dispatcher
        let _ = self.dispatcher.send(&envelope).await;
    }

    fn transport(&self) -> Option<&dyn SessionTransport> {
        self.session.as_ref().and_then(|s| s.transport())
    }

    fn peer(&self) -> Option<ParticipantId> {
        self.session.as_ref().map(|s| s.remote.clone())
    }

    fn session_in(&self, from: &ParticipantId, states: &[CallState]) -> bool {
        self.session
            .as_ref()
            .map(|s| s.is_peer(from) && states.contains(&s.state))
            .unwrap_or(false)
    }

    fn discard(&self, kind: SignalKind, from: &ParticipantId) {
        let state = self
            .session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle);
        tracing::debug!("Discarding {} from {} in state {}", kind, from, state);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{FakeFactory, FakeState};
    use crate::call_engine::transport::ConnectionHealth;
    use crate::signaling::MemoryHub;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Peer {
        engine: CallEngine,
        factory: Arc<FakeFactory>,
        inbox: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        fn join(hub: &MemoryHub, name: &str) -> Self {
            let (channel, inbox) = hub.join(name.into());
            let factory = FakeFactory::new();
            let engine = CallEngine::new(name.into(), Arc::new(channel), factory.clone());
            Self {
                engine,
                factory,
                inbox,
            }
        }

        /// Alle bisher zugestellten Envelopes
        fn take_inbox(&mut self) -> Vec<String> {
            let mut raws = Vec::new();
            while let Ok(raw) = self.inbox.try_recv() {
                raws.push(raw);
            }
            raws
        }

        /// Stellt Envelopes zu und wartet bis die Engine sie verarbeitet hat
        async fn deliver(&self, raws: &[String]) {
            for raw in raws {
                self.engine.handle(raw);
            }
            self.engine.status().await.unwrap();
        }

        fn transport(&self) -> Arc<FakeState> {
            self.factory.last().expect("no transport created")
        }
    }

    fn kinds(raws: &[String]) -> Vec<SignalKind> {
        raws.iter()
            .map(|raw| SignalEnvelope::decode(raw).unwrap().kind())
            .collect()
    }

    fn only(raws: &[String], kind: SignalKind) -> Vec<String> {
        raws.iter()
            .filter(|raw| SignalEnvelope::decode(raw).unwrap().kind() == kind)
            .cloned()
            .collect()
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<CallEvent>, pred: F) -> CallEvent
    where
        F: Fn(&CallEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Alice ruft Bob an, Bob nimmt an; beide sind danach InCall
    async fn establish(alice: &mut Peer, bob: &mut Peer) {
        alice.engine.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;
        bob.engine.accept_incoming_call().await.unwrap();
        let to_alice = alice.take_inbox();
        alice.deliver(&to_alice).await;
        assert_eq!(alice.engine.state(), CallState::InCall);
        assert_eq!(bob.engine.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_end_to_end_call() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        // Alice: Idle -> Calling, Offer an Bob
        alice.engine.start_call("bob").await.unwrap();
        assert_eq!(alice.engine.state(), CallState::Calling);
        assert!(alice
            .transport()
            .emit(TransportEvent::LocalCandidate(IceCandidate::new("a1"))));
        alice.engine.status().await.unwrap();

        let to_bob = bob.take_inbox();
        assert_eq!(kinds(&to_bob), vec![SignalKind::Offer, SignalKind::Candidate]);

        // Bob: Idle -> Incoming, Candidate wird gepuffert, Ring an Alice
        bob.deliver(&to_bob).await;
        let snapshot = bob.engine.snapshot();
        assert_eq!(snapshot.state, CallState::Incoming);
        assert_eq!(snapshot.peer, Some("alice".into()));
        assert!(bob.factory.created().is_empty());

        // Bob nimmt an: Offer anwenden, Candidates nachreichen, Answer senden
        bob.engine.accept_incoming_call().await.unwrap();
        assert_eq!(bob.engine.state(), CallState::InCall);
        let bob_transport = bob.transport();
        assert_eq!(
            bob_transport.remote_description(),
            Some((SdpKind::Offer, "fake-offer".to_string()))
        );
        assert_eq!(bob_transport.applied_candidates(), vec!["a1"]);
        assert_eq!(
            bob_transport.local_description(),
            Some((SdpKind::Answer, "fake-answer".to_string()))
        );
        assert!(bob_transport.emit(TransportEvent::LocalCandidate(IceCandidate::new("b1"))));
        bob.engine.status().await.unwrap();

        let to_alice = alice.take_inbox();
        assert_eq!(
            kinds(&to_alice),
            vec![SignalKind::Ring, SignalKind::Answer, SignalKind::Candidate]
        );

        // Candidate vor dem Answer zustellen: muss gepuffert werden
        alice.deliver(&only(&to_alice, SignalKind::Ring)).await;
        assert!(alice.engine.snapshot().remote_ringing);
        alice.deliver(&only(&to_alice, SignalKind::Candidate)).await;
        assert!(alice.transport().applied_candidates().is_empty());
        alice.deliver(&only(&to_alice, SignalKind::Answer)).await;

        let snapshot = alice.engine.snapshot();
        assert_eq!(snapshot.state, CallState::InCall);
        assert!(snapshot.started_at.is_some());
        assert_eq!(alice.transport().applied_candidates(), vec!["b1"]);

        // Alice legt auf
        alice.engine.hang_up().await;
        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(alice.engine.snapshot().started_at, None);

        let to_bob = bob.take_inbox();
        assert_eq!(kinds(&to_bob), vec![SignalKind::Hangup]);
        bob.deliver(&to_bob).await;
        assert_eq!(bob.engine.state(), CallState::Idle);

        assert_eq!(alice.factory.live(), 0);
        assert_eq!(bob.factory.live(), 0);
        assert!(alice.take_inbox().is_empty());
    }

    #[tokio::test]
    async fn test_reject_scenario() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;

        bob.engine.reject_incoming_call().await.unwrap();
        assert_eq!(bob.engine.state(), CallState::Idle);

        let to_alice = alice.take_inbox();
        assert_eq!(kinds(&to_alice), vec![SignalKind::Ring, SignalKind::Reject]);
        alice.deliver(&to_alice).await;

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(alice.factory.live(), 0);
        assert!(bob.factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_hang_up_is_idempotent() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        // Aus Idle: kein Envelope
        alice.engine.hang_up().await;
        alice.engine.hang_up().await;
        assert!(bob.take_inbox().is_empty());

        alice.engine.start_call("bob").await.unwrap();
        alice.engine.hang_up().await;
        alice.engine.hang_up().await;

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(
            kinds(&bob.take_inbox()),
            vec![SignalKind::Offer, SignalKind::Hangup]
        );
        assert_eq!(alice.transport().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_envelopes_after_idle() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        let mut events = alice.engine.subscribe();

        establish(&mut alice, &mut bob).await;
        alice.engine.hang_up().await;
        while events.try_recv().is_ok() {}

        let stale = vec![
            SignalEnvelope::answer("bob".into(), "alice".into(), "late".to_string())
                .encode()
                .unwrap(),
            SignalEnvelope::candidate("bob".into(), "alice".into(), IceCandidate::new("late"))
                .encode()
                .unwrap(),
            SignalEnvelope::hangup("bob".into(), "alice".into())
                .encode()
                .unwrap(),
        ];
        alice.deliver(&stale).await;

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(alice.factory.created().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answer_while_idle_is_discarded() {
        let hub = MemoryHub::new();
        let alice = Peer::join(&hub, "alice");

        let raw = SignalEnvelope::answer("bob".into(), "alice".into(), "v=0".to_string())
            .encode()
            .unwrap();
        assert!(alice.engine.handle(&raw).is_routed());
        alice.engine.status().await.unwrap();

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert!(alice.factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_second_offer_while_incoming_is_busy_rejected() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        let mut carol = Peer::join(&hub, "carol");
        let mut events = bob.engine.subscribe();

        alice.engine.start_call("bob").await.unwrap();
        carol.engine.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;

        let snapshot = bob.engine.snapshot();
        assert_eq!(snapshot.state, CallState::Incoming);
        assert_eq!(snapshot.peer, Some("alice".into()));

        let to_carol = carol.take_inbox();
        assert_eq!(
            SignalEnvelope::decode(&to_carol[0]).unwrap(),
            SignalEnvelope::reject("bob".into(), "carol".into(), Some(BUSY_REASON.to_string()))
        );
        wait_for(&mut events, |e| {
            matches!(e, CallEvent::BusyRejected { from } if from.as_str() == "carol")
        })
        .await;

        carol.deliver(&to_carol).await;
        assert_eq!(carol.engine.state(), CallState::Idle);

        // Der erste Anruf lässt sich weiterhin annehmen
        bob.engine.accept_incoming_call().await.unwrap();
        assert_eq!(bob.engine.state(), CallState::InCall);
        assert_eq!(kinds(&alice.take_inbox()), vec![SignalKind::Ring, SignalKind::Answer]);
    }

    #[tokio::test]
    async fn test_duplicate_offer_replaces_pending() {
        let hub = MemoryHub::new();
        let bob = Peer::join(&hub, "bob");

        let first = SignalEnvelope::offer("alice".into(), "bob".into(), "first".to_string());
        let second = SignalEnvelope::offer("alice".into(), "bob".into(), "second".to_string());
        bob.deliver(&[first.encode().unwrap(), second.encode().unwrap()])
            .await;

        bob.engine.accept_incoming_call().await.unwrap();
        assert_eq!(
            bob.transport().remote_description(),
            Some((SdpKind::Offer, "second".to_string()))
        );
    }

    #[tokio::test]
    async fn test_glare_resolves_to_single_call() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        bob.engine.start_call("alice").await.unwrap();

        let to_alice = alice.take_inbox();
        let to_bob = bob.take_inbox();
        alice.deliver(&to_alice).await;
        bob.deliver(&to_bob).await;

        // "alice" < "bob": Alice bleibt Anrufer, Bob wechselt zu Incoming
        assert_eq!(alice.engine.state(), CallState::Calling);
        assert_eq!(bob.engine.state(), CallState::Incoming);
        assert_eq!(bob.factory.live(), 0);

        bob.engine.accept_incoming_call().await.unwrap();
        let to_alice = alice.take_inbox();
        alice.deliver(&to_alice).await;

        assert_eq!(alice.engine.state(), CallState::InCall);
        assert_eq!(bob.engine.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_glare_ignores_events_from_released_transport() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        bob.engine.start_call("alice").await.unwrap();
        let to_alice = alice.take_inbox();
        let to_bob = bob.take_inbox();
        alice.deliver(&to_alice).await;
        bob.deliver(&to_bob).await;
        assert_eq!(bob.engine.state(), CallState::Incoming);

        let released = bob.factory.created()[0].clone();
        assert!(released.is_closed());

        // Candidate des verworfenen Offers darf Alice nicht erreichen
        released.emit(TransportEvent::LocalCandidate(IceCandidate::new("stale")));
        bob.engine.status().await.unwrap();
        let to_alice = alice.take_inbox();
        assert_eq!(kinds(&to_alice), vec![SignalKind::Ring]);

        bob.engine.accept_incoming_call().await.unwrap();
        let to_alice = alice.take_inbox();
        alice.deliver(&to_alice).await;
        assert_eq!(alice.engine.state(), CallState::InCall);
        assert_eq!(bob.engine.state(), CallState::InCall);

        // Ein Verbindungsfehler des alten Transports beendet den neuen Anruf nicht
        released.emit(TransportEvent::ConnectionState(ConnectionHealth::Failed));
        bob.engine.status().await.unwrap();
        assert_eq!(bob.engine.state(), CallState::InCall);
        assert!(alice.take_inbox().is_empty());
    }

    #[tokio::test]
    async fn test_caller_hangup_while_incoming() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;
        assert_eq!(bob.engine.state(), CallState::Incoming);

        alice.engine.hang_up().await;
        let to_bob = bob.take_inbox();
        assert_eq!(kinds(&to_bob), vec![SignalKind::Hangup]);
        bob.deliver(&to_bob).await;

        assert_eq!(bob.engine.state(), CallState::Idle);
        assert!(bob.factory.created().is_empty());
        assert_eq!(kinds(&alice.take_inbox()), vec![SignalKind::Ring]);
    }

    #[tokio::test]
    async fn test_remote_reject_while_incoming() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let bob = Peer::join(&hub, "bob");

        let offer = SignalEnvelope::offer("alice".into(), "bob".into(), "v=0".to_string());
        bob.deliver(&[offer.encode().unwrap()]).await;
        assert_eq!(bob.engine.state(), CallState::Incoming);

        let reject = SignalEnvelope::reject("alice".into(), "bob".into(), None);
        bob.deliver(&[reject.encode().unwrap()]).await;

        assert_eq!(bob.engine.state(), CallState::Idle);
        assert!(bob.factory.created().is_empty());
        assert_eq!(kinds(&alice.take_inbox()), vec![SignalKind::Ring]);
    }

    #[tokio::test]
    async fn test_transport_creation_failure_returns_to_idle() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        let mut events = alice.engine.subscribe();

        alice
            .factory
            .fail_next_create(TransportError::MediaUnavailable("no camera".to_string()));
        alice.engine.start_call("bob").await.unwrap();

        assert_eq!(alice.engine.state(), CallState::Idle);
        wait_for(&mut events, |e| matches!(e, CallEvent::CallFailed { .. })).await;
        assert!(!kinds(&bob.take_inbox()).contains(&SignalKind::Offer));
    }

    #[tokio::test]
    async fn test_invalid_offer_on_accept_rejects_caller() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;

        bob.factory.fail_remote_descriptions();
        bob.engine.accept_incoming_call().await.unwrap();

        assert_eq!(bob.engine.state(), CallState::Idle);
        assert_eq!(bob.factory.live(), 0);

        let to_alice = alice.take_inbox();
        assert_eq!(kinds(&to_alice), vec![SignalKind::Ring, SignalKind::Reject]);
        alice.deliver(&to_alice).await;
        assert_eq!(alice.engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_connection_failure_hangs_up() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        establish(&mut alice, &mut bob).await;

        assert!(alice
            .transport()
            .emit(TransportEvent::ConnectionState(ConnectionHealth::Failed)));
        alice.engine.status().await.unwrap();

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(alice.factory.live(), 0);
        assert_eq!(kinds(&bob.take_inbox()), vec![SignalKind::Hangup]);
    }

    #[tokio::test]
    async fn test_connection_disconnected_hangs_up() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        let mut events = alice.engine.subscribe();
        establish(&mut alice, &mut bob).await;

        assert!(alice
            .transport()
            .emit(TransportEvent::ConnectionState(ConnectionHealth::Disconnected)));
        alice.engine.status().await.unwrap();

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(alice.factory.live(), 0);
        wait_for(&mut events, |e| matches!(e, CallEvent::CallFailed { .. })).await;
        assert_eq!(kinds(&bob.take_inbox()), vec![SignalKind::Hangup]);
    }

    #[tokio::test]
    async fn test_rejected_candidate_keeps_call() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        establish(&mut alice, &mut bob).await;

        let bad = SignalEnvelope::candidate("bob".into(), "alice".into(), IceCandidate::new("bad"));
        alice.deliver(&[bad.encode().unwrap()]).await;
        assert_eq!(alice.engine.state(), CallState::InCall);
        assert!(alice.transport().applied_candidates().is_empty());

        let good = SignalEnvelope::candidate("bob".into(), "alice".into(), IceCandidate::new("b2"));
        alice.deliver(&[good.encode().unwrap()]).await;
        assert_eq!(alice.engine.state(), CallState::InCall);
        assert_eq!(alice.transport().applied_candidates(), vec!["b2"]);
        assert!(bob.take_inbox().is_empty());
    }

    #[tokio::test]
    async fn test_events_from_released_transport_are_ignored() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        let old = alice.transport();
        alice.engine.hang_up().await;
        bob.take_inbox();

        old.emit(TransportEvent::LocalCandidate(IceCandidate::new("stale")));
        old.emit(TransportEvent::ConnectionState(ConnectionHealth::Failed));
        alice.engine.status().await.unwrap();

        assert!(bob.take_inbox().is_empty());
        assert_eq!(alice.engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_mute_before_accept_applies_to_transport() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");

        alice.engine.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;

        assert_eq!(bob.engine.toggle_mute().await, Ok(true));
        bob.engine.accept_incoming_call().await.unwrap();
        assert_eq!(bob.transport().audio_enabled(), Some(false));

        assert_eq!(bob.engine.toggle_mute().await, Ok(false));
        assert_eq!(bob.transport().audio_enabled(), Some(true));
        assert_eq!(bob.engine.toggle_camera().await, Ok(true));
        assert_eq!(bob.transport().video_enabled(), Some(false));
        assert!(bob.engine.snapshot().camera_off);
    }

    #[tokio::test]
    async fn test_command_preconditions() {
        let hub = MemoryHub::new();
        let alice = Peer::join(&hub, "alice");
        let _bob = Peer::join(&hub, "bob");

        assert_eq!(alice.engine.toggle_mute().await, Err(CallError::NoActiveCall));
        assert_eq!(alice.engine.toggle_camera().await, Err(CallError::NoActiveCall));
        assert_eq!(
            alice.engine.accept_incoming_call().await,
            Err(CallError::NoIncomingCall)
        );
        assert_eq!(
            alice.engine.reject_incoming_call().await,
            Err(CallError::NoIncomingCall)
        );
        assert_eq!(alice.engine.start_call("alice").await, Err(CallError::InvalidPeer));

        alice.engine.start_call("bob").await.unwrap();
        assert_eq!(alice.engine.start_call("bob").await, Err(CallError::AlreadyInCall));
        assert_eq!(
            alice.engine.accept_incoming_call().await,
            Err(CallError::NoIncomingCall)
        );
    }

    #[tokio::test]
    async fn test_channel_loss_releases_transport() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        establish(&mut alice, &mut bob).await;

        hub.set_online(&"alice".into(), false);
        alice.engine.channel_lost();
        alice.engine.status().await.unwrap();

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert!(alice.transport().is_closed());
        assert!(bob.take_inbox().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_channel_still_completes_locally() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        establish(&mut alice, &mut bob).await;

        hub.set_online(&"alice".into(), false);
        alice.engine.hang_up().await;

        assert_eq!(alice.engine.state(), CallState::Idle);
        assert_eq!(alice.factory.live(), 0);
        assert!(bob.take_inbox().is_empty());
    }

    #[derive(Default)]
    struct RecordingHooks {
        log: Mutex<Vec<String>>,
    }

    impl SessionHooks for RecordingHooks {
        fn on_exit_state(&self, state: CallState, _snapshot: &CallSnapshot) {
            self.log.lock().push(format!("exit {}", state));
        }

        fn on_enter_state(&self, state: CallState, _snapshot: &CallSnapshot) {
            self.log.lock().push(format!("enter {}", state));
        }
    }

    #[tokio::test]
    async fn test_lifecycle_hooks() {
        let hub = MemoryHub::new();
        let (channel, _inbox) = hub.join("alice".into());
        let mut bob = Peer::join(&hub, "bob");
        let hooks = Arc::new(RecordingHooks::default());
        let factory = FakeFactory::new();

        let alice = CallEngine::builder("alice".into(), Arc::new(channel), factory.clone())
            .hooks(hooks.clone())
            .spawn();

        alice.start_call("bob").await.unwrap();
        let to_bob = bob.take_inbox();
        bob.deliver(&to_bob).await;
        bob.engine.accept_incoming_call().await.unwrap();

        let answer =
            SignalEnvelope::answer("bob".into(), "alice".into(), "fake-answer".to_string());
        alice.handle(&answer.encode().unwrap());
        alice.status().await.unwrap();
        alice.hang_up().await;

        assert_eq!(
            *hooks.log.lock(),
            vec![
                "exit idle",
                "enter calling",
                "exit calling",
                "enter in_call",
                "exit in_call",
                "enter idle",
            ]
        );
    }

    /// Factory deren Transport-Anlage nie fertig wird
    struct StallingFactory;

    #[async_trait]
    impl TransportFactory for StallingFactory {
        async fn create(
            &self,
            _request: TransportRequest,
            _events: TransportEventSender,
        ) -> Result<Box<dyn SessionTransport>, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hang_up_cancels_in_flight_operation() {
        let hub = MemoryHub::new();
        let (channel, _inbox) = hub.join("alice".into());
        let mut bob = Peer::join(&hub, "bob");

        let alice = Arc::new(CallEngine::new(
            "alice".into(),
            Arc::new(channel),
            Arc::new(StallingFactory),
        ));
        let mut events = alice.subscribe();

        let caller = Arc::clone(&alice);
        let call = tokio::spawn(async move { caller.start_call("bob").await });
        wait_for(&mut events, |e| {
            matches!(e, CallEvent::StateChanged(s) if s.state == CallState::Calling)
        })
        .await;

        tokio::time::timeout(Duration::from_secs(2), alice.hang_up())
            .await
            .expect("hang up must not wait for the stalled transport");

        assert_eq!(call.await.unwrap(), Ok(()));
        assert_eq!(alice.state(), CallState::Idle);
        assert_eq!(kinds(&bob.take_inbox()), vec![SignalKind::Hangup]);
    }

    #[tokio::test]
    async fn test_dropping_engine_hangs_up() {
        let hub = MemoryHub::new();
        let mut alice = Peer::join(&hub, "alice");
        let mut bob = Peer::join(&hub, "bob");
        establish(&mut alice, &mut bob).await;

        let transport = alice.transport();
        drop(alice.engine);

        let raw = tokio::time::timeout(Duration::from_secs(2), bob.inbox.recv())
            .await
            .expect("hangup not delivered")
            .unwrap();
        assert_eq!(SignalEnvelope::decode(&raw).unwrap().kind(), SignalKind::Hangup);
        assert!(transport.is_closed());
    }
}
