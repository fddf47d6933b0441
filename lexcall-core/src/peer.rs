//! Peer-link seam and the WebRTC-backed production implementation
//!
//! The controller drives the negotiated media transport through the
//! [`PeerLink`] trait; [`RtcConnector`] builds links over the `webrtc`
//! crate with a fixed set of public STUN servers.

use crate::media::LocalStream;
use crate::types::{CandidatePayload, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

/// Peer transport errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Transport construction failed
    #[error("peer transport configuration error: {0}")]
    Config(String),

    /// Description creation or application failed
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Candidate application failed
    #[error("candidate error: {0}")]
    Candidate(String),
}

/// Connection state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Freshly constructed
    New,
    /// Connectivity checks in progress
    Connecting,
    /// Media path established
    Connected,
    /// Media path lost, may self-heal
    Disconnected,
    /// Media path failed
    Failed,
    /// Closed locally
    Closed,
}

impl LinkState {
    /// Whether this state starts the failure grace window
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Events surfaced by a peer link to the controller
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local connectivity candidate was discovered
    CandidateDiscovered(CandidatePayload),
    /// The peer delivered a media track
    RemoteTrack {
        /// Identifier of the received track
        track_id: String,
    },
    /// The connection state changed
    StateChanged(LinkState),
}

/// The negotiated media transport for one call attempt
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Create the local offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create the local answer (requires a remote offer to be set)
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply one remote connectivity candidate
    async fn add_candidate(&self, candidate: CandidatePayload) -> Result<(), PeerError>;

    /// Detach event handlers, then close the transport
    async fn close(&self);
}

/// Builds peer links wired to a controller-owned event sender
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Construct a link for one call attempt
    ///
    /// Local tracks are attached (audio first, then video when present)
    /// before any offer or answer is created, and the link's event sources
    /// feed `events`.
    async fn connect(
        &self,
        kind: MediaKind,
        local: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}

/// Public STUN servers used for connectivity discovery
const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Connector building [`RtcPeerLink`]s over the `webrtc` crate
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self {
            ice_servers: STUN_SERVERS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl RtcConnector {
    /// Create a connector with the default STUN set
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the connectivity-discovery servers
    #[must_use]
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        kind: MediaKind,
        local: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Config(format!("failed to register codecs: {e}")))?;

        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(|e| PeerError::Config(format!("failed to create peer connection: {e}")))?,
        );

        // Local tracks go on before any offer/answer exists: audio, then video.
        for track in [local.audio(), local.video()].into_iter().flatten() {
            if let Some(rtc) = track.rtc() {
                let concrete = Arc::clone(rtc);
                let t: Arc<dyn TrackLocal + Send + Sync> = concrete;
                pc.add_track(t).await.map_err(|e| {
                    PeerError::Config(format!("failed to add {:?} track: {e}", track.kind()))
                })?;
            }
        }

        // Keep the media-line set symmetric: always receive audio, and
        // receive video exactly when the call kind is video, independent of
        // what we currently send.
        if local.audio().is_none() {
            add_recv_transceiver(&pc, RTPCodecType::Audio).await?;
        }
        if kind.has_video() && local.video().is_none() {
            add_recv_transceiver(&pc, RTPCodecType::Video).await?;
        }

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = CandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        let _ = candidate_tx
                            .send(PeerEvent::CandidateDiscovered(payload))
                            .await;
                    }
                    Err(e) => tracing::warn!(error = %e, "could not serialize local candidate"),
                }
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            let track_id = track.id();
            Box::pin(async move {
                tracing::debug!(track_id = %track_id, "remote track received");
                let _ = track_tx.send(PeerEvent::RemoteTrack { track_id }).await;
            })
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let mapped = map_connection_state(state);
            Box::pin(async move {
                tracing::debug!(state = ?mapped, "peer connection state changed");
                let _ = state_tx.send(PeerEvent::StateChanged(mapped)).await;
            })
        }));

        Ok(Arc::new(RtcPeerLink { pc }))
    }
}

async fn add_recv_transceiver(
    pc: &Arc<RTCPeerConnection>,
    kind: RTPCodecType,
) -> Result<(), PeerError> {
    pc.add_transceiver_from_kind(
        kind,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .map(|_| ())
    .map_err(|e| PeerError::Config(format!("failed to add {kind} transceiver: {e}")))
}

/// Peer link over a `webrtc` crate `RTCPeerConnection`
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(format!("failed to create offer: {e}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(format!("failed to create answer: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| PeerError::Negotiation(format!("failed to set local description: {e}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| PeerError::Negotiation(format!("failed to set remote description: {e}")))
    }

    async fn add_candidate(&self, candidate: CandidatePayload) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::Candidate(format!("failed to add candidate: {e}")))
    }

    async fn close(&self) {
        // Detach the event sources first so nothing fires into a dead session.
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "error while closing peer connection");
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| PeerError::Negotiation(format!("invalid session description: {e}")))
}
