//! Signaling Module - STOMP-over-WebSocket Client und Dispatcher
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - Envelope-Format (Offer/Answer/Candidate/Hangup/Reject/Ring)
//! - Message Channel Abstraktion (WebSocket oder In-Memory)
//! - Eingehende Nachrichten parsen, prüfen und an die Call Engine leiten
//!

mod channel;
mod client;
mod dispatcher;
mod messages;
mod stomp;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelError, MemoryChannel, MemoryHub, MessageChannel};
pub use client::{connect_url, SignalingClient, SignalingError, SignalingEvent};
pub use dispatcher::{Dispatch, SignalingDispatcher};
pub use messages::*;
pub use stomp::{StompCommand, StompError, StompFrame};
