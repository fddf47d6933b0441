//! Core identifiers and session data structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable marketplace user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of media a call carries, fixed once the offer is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio-only call
    Audio,
    /// Video call with audio
    Video,
}

impl MediaKind {
    /// Whether this call kind carries video
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Phase of the single call session
///
/// Sole source of truth for the session lifecycle; every UI boolean is a
/// derived projection of this value. `Failed` and `Ended` are transient
/// terminal phases published just before cleanup returns the slot to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// No active call
    Idle,
    /// Local offer sent, waiting for the peer to answer
    OutgoingRinging,
    /// Remote offer received, waiting for a local accept or reject
    IncomingRinging,
    /// Asynchronous negotiation work in flight
    Connecting,
    /// Media session established
    Connected,
    /// Session held, both local tracks muted
    OnHold,
    /// Terminal: the attempt failed
    Failed,
    /// Terminal: the call ended normally
    Ended,
}

impl CallPhase {
    /// Whether a session currently occupies the controller
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Whether media is flowing (or held)
    pub fn in_call(&self) -> bool {
        matches!(self, Self::Connected | Self::OnHold)
    }
}

/// Caller details carried by an offer, shown on the incoming-call screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Caller's user id
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Avatar URL, if any
    pub avatar: Option<String>,
    /// The call record id both endpoints share
    pub call_id: CallId,
    /// Opaque correlation token shared by both endpoints
    pub room_name: String,
}

/// Identity of the locally signed-in user driving this controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Our user id on the signaling relay
    pub id: UserId,
    /// Display name sent with outgoing offers
    pub name: String,
    /// Avatar URL sent with outgoing offers
    pub avatar: Option<String>,
}

impl LocalIdentity {
    /// Create a new local identity
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    /// Attach an avatar URL
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Which half of the negotiation a session description represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer created by the caller
    Offer,
    /// Answer created by the callee
    Answer,
}

/// Negotiated description of media capabilities exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One connectivity candidate, exchanged incrementally by both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Status written to the call record collaborator, best-effort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// The callee accepted
    Accepted,
    /// The callee rejected
    Rejected,
    /// The call ended (for any reason)
    Ended,
}
