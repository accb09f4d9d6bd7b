//! WebRTC Transport - SessionTransport auf Basis von webrtc-rs
//!
//! Jeder Transport besitzt eine eigene Peer Connection mit einem Opus
//! Audio-Track und optional einem VP8 Video-Track. Stummschalten ersetzt
//! den Track des Senders durch `None`, ohne neu zu verhandeln.

use super::transport::{
    ConnectionHealth, RemoteTrack, SdpKind, SessionTransport, TransportError, TransportEvent,
    TransportEventSender, TransportFactory, TransportRequest,
};
use crate::config::{EngineConfig, IceServerConfig};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Audio Sample Rate (48kHz für Opus)
pub const SAMPLE_RATE: u32 = 48000;

const STREAM_ID: &str = "pulse";

fn rtc_error(e: webrtc::Error) -> TransportError {
    TransportError::Failed(e.to_string())
}

impl From<RTCPeerConnectionState> for ConnectionHealth {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionHealth::Connecting,
            RTCPeerConnectionState::Connected => ConnectionHealth::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionHealth::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionHealth::Failed,
            RTCPeerConnectionState::Closed => ConnectionHealth::Closed,
            _ => ConnectionHealth::New,
        }
    }
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Legt pro Anrufversuch eine neue Peer Connection an
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    enable_video: bool,
}

impl WebRtcTransportFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(RTCIceServer::from).collect(),
            enable_video: config.enable_video,
        }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(rtc_error)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        request: TransportRequest,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        tracing::debug!(
            "Creating peer connection for session {} ({} -> {})",
            request.session_id,
            request.local,
            request.remote
        );
        let pending = PendingConnection::new(self.create_peer_connection().await?);
        let pc = Arc::clone(&pending.pc);
        register_handlers(&pc, events);

        // Audio Track hinzufügen
        let audio_track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));
        let audio = MediaSlot::attach(&pc, audio_track)
            .await
            .map_err(|e| TransportError::MediaUnavailable(e.to_string()))?;

        let video = if self.enable_video {
            let video_track: Arc<dyn TrackLocal + Send + Sync> =
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_string(),
                    STREAM_ID.to_string(),
                ));
            let slot = MediaSlot::attach(&pc, video_track)
                .await
                .map_err(|e| TransportError::MediaUnavailable(e.to_string()))?;
            Some(slot)
        } else {
            None
        };

        Ok(Box::new(WebRtcTransport {
            pc: pending.finish(),
            audio,
            video,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Schließt die Peer Connection, falls `create` vorzeitig endet
///
/// Greift bei Fehlern nach dem Anlegen ebenso wie beim Abbruch des
/// `create`-Futures durch ein Auflegen.
struct PendingConnection {
    pc: Arc<RTCPeerConnection>,
    armed: bool,
}

impl PendingConnection {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc, armed: true }
    }

    fn finish(mut self) -> Arc<RTCPeerConnection> {
        self.armed = false;
        Arc::clone(&self.pc)
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to close abandoned peer connection");
            return;
        };
        let pc = Arc::clone(&self.pc);
        runtime.spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close abandoned peer connection: {}", e);
            }
        });
    }
}

/// Leitet die Callbacks der Peer Connection an die Engine weiter
fn register_handlers(pc: &RTCPeerConnection, events: TransportEventSender) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::debug!("Peer connection state: {:?}", s);
        state_events.emit(TransportEvent::ConnectionState(s.into()));
        Box::pin(async {})
    }));

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    candidate_events.emit(TransportEvent::LocalCandidate(init.into()));
                }
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _, _| {
        let remote = RemoteTrack {
            kind: track.kind().to_string(),
            track_id: track.id(),
            stream_id: track.stream_id(),
        };
        tracing::info!("Received track: {:?}", track.codec());
        events.emit(TransportEvent::RemoteTrack(remote));
        Box::pin(async {})
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Lokaler Track samt Sender; erlaubt Ab- und Anschalten ohne Renegotiation
struct MediaSlot {
    track: Arc<dyn TrackLocal + Send + Sync>,
    sender: Arc<RTCRtpSender>,
}

impl MediaSlot {
    async fn attach(
        pc: &RTCPeerConnection,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Self, webrtc::Error> {
        let sender = pc.add_track(Arc::clone(&track)).await?;
        Ok(Self { track, sender })
    }

    async fn set_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        let track = enabled.then(|| Arc::clone(&self.track));
        self.sender.replace_track(track).await.map_err(rtc_error)
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    audio: MediaSlot,
    video: Option<MediaSlot>,
    closed: AtomicBool,
}

#[async_trait]
impl SessionTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        let description = describe(kind, sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(rtc_error)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        let description = describe(kind, sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| TransportError::CandidateRejected(e.to_string()))
    }

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.audio.set_enabled(enabled).await
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        match &self.video {
            Some(video) => video.set_enabled(enabled).await,
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc.close().await.map_err(rtc_error)
    }
}

fn describe(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, TransportError> {
    let description = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    description.map_err(|e| TransportError::InvalidSdp(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
