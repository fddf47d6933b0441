//! LexCall - peer-to-peer call sessions for the LexCall marketplace
//!
//! This library turns a bidirectional signaling channel plus local media
//! capture into a negotiated peer-to-peer call session. The heart of the
//! crate is [`CallController`], a state machine that tracks the session
//! through ringing, connecting, connected, held, and terminated phases and
//! guarantees cleanup of every acquired resource on every exit path.
//!
//! External collaborators are injected behind trait seams:
//!
//! - [`SignalingChannel`] - the relay transport (events keyed by user id)
//! - [`MediaSource`] - local audio/video capture
//! - [`PeerConnector`] / [`PeerLink`] - the negotiated media transport
//!   (production implementation over the `webrtc` crate)
//! - [`CallDirectory`] - best-effort REST persistence of call records
//!
//! # Examples
//!
//! ```rust,no_run
//! use lexcall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(channel: Arc<impl SignalingChannel>) -> Result<(), CallError> {
//! let controller = CallController::new(
//!     LocalIdentity::new("u-100", "Amara Okafor"),
//!     channel,
//!     Arc::new(SampleMediaSource::new()),
//!     Arc::new(RtcConnector::new()),
//!     Arc::new(InMemoryDirectory::new()),
//!     ControllerConfig::default(),
//! );
//! controller.subscribe();
//!
//! let call_id = controller
//!     .initiate_call(UserId::new("u-200"), MediaKind::Video)
//!     .await?;
//! println!("ringing: {call_id}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers and session data structures
pub mod types;

/// Signaling wire protocol and channel seam
pub mod signaling;

/// Local capture and remote stream bookkeeping
pub mod media;

/// Pending connectivity-candidate queue
pub mod candidates;

/// Peer-link seam and WebRTC implementation
pub mod peer;

/// Best-effort call-record persistence
pub mod directory;

/// Call-session lifecycle control
pub mod session;

// Re-export main types at crate root
pub use candidates::PendingCandidates;
pub use directory::{CallDirectory, CallRecord, DirectoryError, HttpCallDirectory, InMemoryDirectory};
pub use media::{
    LocalStream, LocalTrack, MediaError, MediaSource, RemoteStream, SampleMediaSource, TrackKind,
};
pub use peer::{LinkState, PeerConnector, PeerError, PeerEvent, PeerLink, RtcConnector, RtcPeerLink};
pub use session::{
    CallController, CallError, CallSnapshot, ControllerConfig, EndReason, SessionEvent,
};
pub use signaling::{InboundEvent, OutboundEvent, SignalingChannel, SignalingError};
pub use types::{
    CallId, CallPhase, CallStatus, CallerInfo, CandidatePayload, LocalIdentity, MediaKind,
    SdpKind, SessionDescription, UserId,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::directory::{CallDirectory, InMemoryDirectory};
    pub use crate::media::{MediaSource, SampleMediaSource};
    pub use crate::peer::{PeerConnector, PeerLink, RtcConnector};
    pub use crate::session::{
        CallController, CallError, CallSnapshot, ControllerConfig, EndReason, SessionEvent,
    };
    pub use crate::signaling::{InboundEvent, OutboundEvent, SignalingChannel};
    pub use crate::types::{
        CallId, CallPhase, CallStatus, CallerInfo, LocalIdentity, MediaKind, UserId,
    };
}
