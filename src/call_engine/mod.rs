//! Call Engine Module - Anruf-Zustandsautomat und Media Transport
//!
//! Dieses Modul verwaltet:
//! - Call Sessions und ihren Lebenszyklus (Idle/Calling/Incoming/InCall)
//! - Puffern früher ICE Candidates
//! - WebRTC Peer Connections hinter dem `SessionTransport` Trait

mod engine;
mod reconciler;
mod session;
mod transport;
mod webrtc_transport;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{CallEngine, CallEngineBuilder, CallError, CallEvent, BUSY_REASON};
pub(crate) use engine::EngineInput;
pub use reconciler::{CandidateReconciler, FlushReport};
pub use session::{CallSnapshot, CallState, NoopHooks, SessionHooks};
pub use transport::{
    ConnectionHealth, RemoteTrack, SdpKind, SessionTransport, TransportError, TransportEvent,
    TransportEventSender, TransportFactory, TransportRequest,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory, SAMPLE_RATE};
