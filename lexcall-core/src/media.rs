//! Local capture and remote stream bookkeeping
//!
//! Local tracks are exclusively owned by the controller from acquisition
//! until cleanup stops them. The remote stream is rebuilt as a new value on
//! every added track so observers can rely on identity-based change
//! detection.

use crate::types::MediaKind;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media acquisition and stream errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// The user denied camera/microphone access
    #[error("camera or microphone access was denied: {0}")]
    PermissionDenied(String),

    /// A capture device is busy or missing
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Stream bookkeeping error
    #[error("media stream error: {0}")]
    StreamError(String),
}

/// Kind of an individual track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Microphone capture
    Audio,
    /// Camera capture
    Video,
}

/// One locally captured track
///
/// The `enabled` flag is what mute/hold toggles flip; `live` drops to false
/// exactly once, when cleanup stops the track.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    /// Create a track without a transport backing (tests, headless use)
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtc: None,
        }
    }

    /// Create a track backed by a WebRTC sample track
    pub fn with_rtc(
        id: impl Into<String>,
        kind: TrackKind,
        rtc: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtc: Some(rtc),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track currently produces media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Set the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the enabled flag, returning the new value
    pub fn toggle(&self) -> bool {
        // fetch_xor returns the previous value
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Whether the track has not been stopped yet
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop the track permanently
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// The WebRTC backing, when present
    pub fn rtc(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.rtc.as_ref()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// The locally captured stream for one call
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    /// Assemble a stream from its tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks, audio first
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// The audio track, if present
    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// The video track, if present
    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Whether the audio track is enabled
    pub fn audio_enabled(&self) -> bool {
        self.audio().is_some_and(|t| t.is_enabled())
    }

    /// Whether the video track is enabled
    pub fn video_enabled(&self) -> bool {
        self.video().is_some_and(|t| t.is_enabled())
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// The stream of media received from the peer
///
/// Rebuilt, never mutated: each added track produces a fresh value with a
/// bumped revision, so `PartialEq`/revision checks detect changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    revision: u64,
    track_ids: Vec<String>,
}

impl RemoteStream {
    /// Build the first revision holding one track
    pub fn first(track_id: impl Into<String>) -> Self {
        Self {
            revision: 1,
            track_ids: vec![track_id.into()],
        }
    }

    /// Build the next revision with an additional track
    #[must_use]
    pub fn with_track(&self, track_id: impl Into<String>) -> Self {
        let mut track_ids = self.track_ids.clone();
        track_ids.push(track_id.into());
        Self {
            revision: self.revision + 1,
            track_ids,
        }
    }

    /// Monotonic revision, bumped per added track
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Identifiers of the received tracks, in arrival order
    pub fn track_ids(&self) -> &[String] {
        &self.track_ids
    }
}

/// Acquires local capture on demand
///
/// May fail with [`MediaError::PermissionDenied`] or
/// [`MediaError::DeviceUnavailable`]; both are terminal for the attempt that
/// requested them.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    /// Acquire a local stream for the given call kind
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaError>;
}

/// Media source fabricating WebRTC sample tracks
///
/// Produces Opus audio and VP8 video sample tracks suitable for attachment
/// to a peer connection; capture pumps feed them outside this crate.
#[derive(Debug, Default)]
pub struct SampleMediaSource {
    counter: AtomicU64,
}

impl SampleMediaSource {
    /// Create a new source
    pub fn new() -> Self {
        Self::default()
    }

    fn audio_track(&self, stream: u64) -> Arc<LocalTrack> {
        let track_id = format!("audio-{stream}");
        let codec = RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            track_id.clone(),
            "audio".to_string(),
        ));
        Arc::new(LocalTrack::with_rtc(track_id, TrackKind::Audio, rtc))
    }

    fn video_track(&self, stream: u64) -> Arc<LocalTrack> {
        let track_id = format!("video-{stream}");
        let codec = RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            track_id.clone(),
            "video".to_string(),
        ));
        Arc::new(LocalTrack::with_rtc(track_id, TrackKind::Video, rtc))
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaError> {
        let stream = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![self.audio_track(stream)];
        if kind.has_video() {
            tracks.push(self.video_track(stream));
        }
        tracing::debug!(stream, tracks = tracks.len(), "local media acquired");
        Ok(LocalStream::new(format!("local-{stream}"), tracks))
    }
}
