//! Call-session lifecycle control
//!
//! [`CallController`] is the single authority for the active call: it maps
//! signaling events and UI intents to phase transitions, peer-link
//! lifecycle, and timers, and guarantees that every exit path converges on
//! one idempotent cleanup routine.
//!
//! Concurrency model: reactions run under a short mutex that is never held
//! across an await. Each async step (media acquisition, description work,
//! candidate application) revalidates the session epoch when it re-locks,
//! so events that arrived during the suspension are honored rather than
//! clobbered. Timers carry the epoch they were armed under and are no-ops
//! once it moves on.

use crate::candidates::PendingCandidates;
use crate::directory::CallDirectory;
use crate::media::{LocalStream, MediaSource, RemoteStream};
use crate::peer::{LinkState, PeerConnector, PeerEvent, PeerLink};
use crate::signaling::{InboundEvent, OutboundEvent, SignalingChannel};
use crate::types::{
    CallId, CallPhase, CallStatus, CallerInfo, CandidatePayload, LocalIdentity, MediaKind,
    SessionDescription, UserId,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Controller errors surfaced to the UI
#[derive(Error, Debug)]
pub enum CallError {
    /// A session is already active; concurrent attempts are rejected
    #[error("another call is already in progress")]
    Busy,

    /// The current phase does not permit this intent
    #[error("no active call permits this action")]
    InvalidState,

    /// Media acquisition failed
    #[error(transparent)]
    Media(#[from] crate::media::MediaError),

    /// Peer transport failed
    #[error(transparent)]
    Peer(#[from] crate::peer::PeerError),

    /// The signaling channel refused our event
    #[error("signaling send failed: {0}")]
    Signaling(String),
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long an unanswered outgoing call rings before being abandoned
    pub ring_timeout: Duration,
    /// Observation window for a degraded connection to self-heal
    pub grace_window: Duration,
    /// Capacity of the observer broadcast channel
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            grace_window: Duration::from_secs(3),
            event_capacity: 100,
        }
    }
}

/// Why a session terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Hung up normally
    Ended {
        /// Whether the peer, rather than this endpoint, hung up
        by_peer: bool,
    },
    /// The incoming call was rejected locally
    Rejected,
    /// No answer arrived within the ring timeout
    NoAnswer,
    /// The relay reported the peer offline
    PeerOffline,
    /// Media acquisition failed (message distinguishes permission vs device)
    MediaFailed {
        /// Human-readable failure description
        message: String,
    },
    /// Peer transport setup or signaling emission failed
    SetupFailed {
        /// Human-readable failure description
        message: String,
    },
    /// The connection stayed degraded past the grace window
    ConnectivityLost,
}

impl EndReason {
    fn terminal_phase(&self) -> CallPhase {
        match self {
            Self::Ended { .. } | Self::Rejected => CallPhase::Ended,
            _ => CallPhase::Failed,
        }
    }

    fn record_status(&self) -> CallStatus {
        match self {
            Self::Rejected => CallStatus::Rejected,
            _ => CallStatus::Ended,
        }
    }
}

/// Notifications broadcast to observers (the UI renders these)
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session phase changed
    PhaseChanged {
        /// New phase
        phase: CallPhase,
    },
    /// A peer is calling; the UI should present accept/reject
    IncomingCall {
        /// Caller details
        caller: CallerInfo,
        /// Audio or video
        kind: MediaKind,
    },
    /// The relay reports the callee's device is ringing
    RingingAtPeer,
    /// Local capture is available for preview
    LocalStream {
        /// Stream identifier
        stream_id: String,
    },
    /// The remote stream was rebuilt with a new track
    RemoteStream {
        /// The new stream value
        stream: RemoteStream,
    },
    /// Mute/hold flags changed
    MediaFlags {
        /// Microphone enabled
        audio_enabled: bool,
        /// Camera enabled
        video_enabled: bool,
        /// Session held
        on_hold: bool,
    },
    /// One second of connected call time elapsed
    DurationTick {
        /// Seconds since the session connected
        seconds: u64,
    },
    /// The session reached a terminal state and was cleaned up
    Terminated {
        /// Why it ended
        reason: EndReason,
    },
}

/// Point-in-time view of the controller for rendering
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Current phase
    pub phase: CallPhase,
    /// Active call id, if any
    pub call_id: Option<CallId>,
    /// The other party, if any
    pub peer: Option<UserId>,
    /// Call kind, if any
    pub kind: Option<MediaKind>,
    /// Correlation token shared with the peer, if any
    pub room_name: Option<String>,
    /// Microphone enabled
    pub audio_enabled: bool,
    /// Camera enabled
    pub video_enabled: bool,
    /// Session held
    pub on_hold: bool,
    /// Seconds since the session connected
    pub elapsed_seconds: u64,
    /// Wall-clock connect time, if connected
    pub connected_at: Option<DateTime<Utc>>,
    /// Local stream id, once capture is live
    pub local_stream: Option<String>,
    /// Latest remote stream value
    pub remote_stream: Option<RemoteStream>,
}

impl CallSnapshot {
    fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            call_id: None,
            peer: None,
            kind: None,
            room_name: None,
            audio_enabled: false,
            video_enabled: false,
            on_hold: false,
            elapsed_seconds: 0,
            connected_at: None,
            local_stream: None,
            remote_stream: None,
        }
    }
}

/// Audio/video enabled flags captured when hold engages
#[derive(Debug, Clone, Copy)]
struct HoldSnapshot {
    audio_enabled: bool,
    video_enabled: bool,
}

struct Session {
    id: CallId,
    room_name: String,
    remote_party: UserId,
    kind: MediaKind,
    phase: CallPhase,
    /// Offer stored by an incoming call until accept
    stored_offer: Option<SessionDescription>,
    local: Option<LocalStream>,
    remote: Option<RemoteStream>,
    link: Option<Arc<dyn PeerLink>>,
    link_state: LinkState,
    remote_description_set: bool,
    pending: PendingCandidates,
    hold: Option<HoldSnapshot>,
    connected_at: Option<Instant>,
    connected_wallclock: Option<DateTime<Utc>>,
    ring_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    peer_pump: Option<JoinHandle<()>>,
}

impl Session {
    fn new(id: CallId, remote_party: UserId, kind: MediaKind, phase: CallPhase) -> Self {
        Self {
            id,
            room_name: String::new(),
            remote_party,
            kind,
            phase,
            stored_offer: None,
            local: None,
            remote: None,
            link: None,
            link_state: LinkState::New,
            remote_description_set: false,
            pending: PendingCandidates::new(),
            hold: None,
            connected_at: None,
            connected_wallclock: None,
            ring_timer: None,
            grace_timer: None,
            ticker: None,
            peer_pump: None,
        }
    }

    fn abort_timers(&mut self) {
        for handle in [
            self.ring_timer.take(),
            self.grace_timer.take(),
            self.ticker.take(),
            self.peer_pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Slot {
    session: Option<Session>,
    /// Bumped by every cleanup; async work and timers armed under an older
    /// epoch find it stale and stand down.
    epoch: u64,
}

/// Resources whose release needs an await, handed out of the locked cleanup
struct Teardown {
    link: Option<Arc<dyn PeerLink>>,
}

/// The call-session lifecycle controller
///
/// One instance per signed-in user session. Collaborators are injected at
/// construction; the rendering layer observes through [`subscribe_events`]
/// (a broadcast stream) and [`snapshot`], and issues intents through the
/// `*_call` / `toggle_*` methods.
///
/// [`subscribe_events`]: CallController::subscribe_events
/// [`snapshot`]: CallController::snapshot
pub struct CallController<S, M, P>
where
    S: SignalingChannel,
    M: MediaSource,
    P: PeerConnector,
{
    identity: LocalIdentity,
    channel: Arc<S>,
    media: Arc<M>,
    connector: Arc<P>,
    directory: Arc<dyn CallDirectory>,
    config: ControllerConfig,
    slot: Mutex<Slot>,
    events: broadcast::Sender<SessionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Handed to spawned timers and pumps; a fired timer that cannot
    /// upgrade simply stands down.
    weak: Weak<Self>,
}

impl<S, M, P> CallController<S, M, P>
where
    S: SignalingChannel,
    M: MediaSource,
    P: PeerConnector,
{
    /// Create a controller for one signed-in user
    pub fn new(
        identity: LocalIdentity,
        channel: Arc<S>,
        media: Arc<M>,
        connector: Arc<P>,
        directory: Arc<dyn CallDirectory>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        Arc::new_cyclic(|weak| Self {
            identity,
            channel,
            media,
            connector,
            directory,
            config,
            slot: Mutex::new(Slot {
                session: None,
                epoch: 0,
            }),
            events,
            pump: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Subscribe to observer notifications
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current observable state
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        let slot = self.slot.lock();
        match slot.session.as_ref() {
            None => CallSnapshot::idle(),
            Some(s) => CallSnapshot {
                phase: s.phase,
                call_id: Some(s.id),
                peer: Some(s.remote_party.clone()),
                kind: Some(s.kind),
                room_name: Some(s.room_name.clone()),
                audio_enabled: s.local.as_ref().is_some_and(|l| l.audio_enabled()),
                video_enabled: s.local.as_ref().is_some_and(|l| l.video_enabled()),
                on_hold: s.phase == CallPhase::OnHold,
                elapsed_seconds: s.connected_at.map_or(0, |t| t.elapsed().as_secs()),
                connected_at: s.connected_wallclock,
                local_stream: s.local.as_ref().map(|l| l.id().to_string()),
                remote_stream: s.remote.clone(),
            },
        }
    }

    /// Start consuming the signaling channel
    ///
    /// Idempotent; pairs with [`unsubscribe`](CallController::unsubscribe).
    /// Independent of any rendering lifecycle.
    pub fn subscribe(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let weak = self.weak.clone();
        let channel = Arc::clone(&self.channel);
        *pump = Some(tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Ok(value) => {
                        let Some(controller) = weak.upgrade() else { break };
                        match InboundEvent::from_value(value) {
                            Ok(event) => controller.handle_signal(event).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed signaling event");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "signaling channel closed");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop consuming the signaling channel
    pub fn unsubscribe(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // UI intents
    // ------------------------------------------------------------------

    /// Place a call to `target`
    ///
    /// # Errors
    ///
    /// [`CallError::Busy`] when a session is already active, media or peer
    /// errors when setup fails (the attempt is cleaned up first).
    pub async fn initiate_call(
        &self,
        target: UserId,
        kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let epoch = {
            let mut slot = self.slot.lock();
            if slot.session.is_some() {
                tracing::warn!(callee = %target, "initiate rejected, session already active");
                return Err(CallError::Busy);
            }
            let session = Session::new(
                CallId::new(),
                target.clone(),
                kind,
                CallPhase::OutgoingRinging,
            );
            slot.session = Some(session);
            self.emit(SessionEvent::PhaseChanged {
                phase: CallPhase::OutgoingRinging,
            });
            slot.epoch
        };

        tracing::info!(callee = %target, kind = ?kind, "initiating call");

        // Call record, best-effort: a failed create falls back to local ids
        // rather than blocking the attempt.
        let (call_id, room_name) = match self
            .directory
            .create_record(&self.identity.id, &target, kind)
            .await
        {
            Ok(record) => (record.id, record.room_name),
            Err(e) => {
                tracing::warn!(error = %e, "call record creation failed, using local ids");
                let id = CallId::new();
                (id, format!("room-{id}"))
            }
        };

        {
            let mut slot = self.slot.lock();
            let Some(s) = Self::session_at(&mut slot, epoch) else {
                return Err(CallError::InvalidState);
            };
            s.id = call_id;
            s.room_name = room_name.clone();
        }

        let local = match self.media.acquire(kind).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(error = %e, "media acquisition failed during initiate");
                self.terminate_if(
                    Some(epoch),
                    |_| true,
                    EndReason::MediaFailed {
                        message: e.to_string(),
                    },
                    false,
                )
                .await;
                return Err(e.into());
            }
        };

        let (peer_tx, peer_rx) = mpsc::channel(64);
        let link = match self.connector.connect(kind, &local, peer_tx).await {
            Ok(link) => link,
            Err(e) => {
                local.stop_all();
                tracing::warn!(error = %e, "peer link construction failed during initiate");
                self.terminate_if(
                    Some(epoch),
                    |_| true,
                    EndReason::SetupFailed {
                        message: e.to_string(),
                    },
                    false,
                )
                .await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .install_transport(epoch, local, Arc::clone(&link), peer_rx)
            .await
        {
            return Err(e);
        }

        let offer = match self.negotiate_local_offer(&link).await {
            Ok(offer) => offer,
            Err(e) => {
                self.terminate_if(
                    Some(epoch),
                    |_| true,
                    EndReason::SetupFailed {
                        message: e.to_string(),
                    },
                    false,
                )
                .await;
                return Err(e);
            }
        };

        let caller_info = CallerInfo {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            avatar: self.identity.avatar.clone(),
            call_id,
            room_name,
        };
        let event = OutboundEvent::CallUser {
            to: target.clone(),
            offer,
            from: self.identity.id.clone(),
            kind,
            caller_info,
        };
        if let Err(e) = self.channel.send(event).await {
            tracing::warn!(error = %e, "failed to emit offer");
            self.terminate_if(
                Some(epoch),
                |_| true,
                EndReason::SetupFailed {
                    message: format!("signaling send failed: {e}"),
                },
                false,
            )
            .await;
            return Err(CallError::Signaling(e.to_string()));
        }

        // No-answer timer: cancelled the instant an answer arrives, never
        // reset or extended.
        let ring_timer = self.spawn_ring_timer(epoch);
        {
            let mut slot = self.slot.lock();
            match Self::session_at(&mut slot, epoch) {
                Some(s) => s.ring_timer = Some(ring_timer),
                None => ring_timer.abort(),
            }
        }

        Ok(call_id)
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidState`] when nothing is ringing, media or peer
    /// errors when setup fails (the attempt is cleaned up first).
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (epoch, offer, caller, kind, call_id) = {
            let mut slot = self.slot.lock();
            let epoch = slot.epoch;
            let Some(s) = slot.session.as_mut() else {
                return Err(CallError::InvalidState);
            };
            if s.phase != CallPhase::IncomingRinging {
                tracing::warn!(phase = ?s.phase, "accept rejected in current phase");
                return Err(CallError::InvalidState);
            }
            let Some(offer) = s.stored_offer.take() else {
                return Err(CallError::InvalidState);
            };
            s.phase = CallPhase::Connecting;
            self.emit(SessionEvent::PhaseChanged {
                phase: CallPhase::Connecting,
            });
            (epoch, offer, s.remote_party.clone(), s.kind, s.id)
        };

        tracing::info!(caller = %caller, "accepting call");

        let local = match self.media.acquire(kind).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(error = %e, "media acquisition failed during accept");
                self.terminate_if(
                    Some(epoch),
                    |_| true,
                    EndReason::MediaFailed {
                        message: e.to_string(),
                    },
                    true,
                )
                .await;
                return Err(e.into());
            }
        };

        let (peer_tx, peer_rx) = mpsc::channel(64);
        let link = match self.connector.connect(kind, &local, peer_tx).await {
            Ok(link) => link,
            Err(e) => {
                local.stop_all();
                self.fail_setup(epoch, &e.to_string(), true).await;
                return Err(e.into());
            }
        };

        self.install_transport(epoch, local, Arc::clone(&link), peer_rx)
            .await?;

        if let Err(e) = link.set_remote_description(offer).await {
            tracing::warn!(error = %e, "failed to apply stored offer");
            self.fail_setup(epoch, &e.to_string(), true).await;
            return Err(e.into());
        }

        // Everything buffered before the remote description goes on now,
        // in arrival order, ahead of any later candidate.
        self.drain_candidates(epoch, &link).await;

        let answer = match link.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_setup(epoch, &e.to_string(), true).await;
                return Err(e.into());
            }
        };
        if let Err(e) = link.set_local_description(answer.clone()).await {
            self.fail_setup(epoch, &e.to_string(), true).await;
            return Err(e.into());
        }

        if let Err(e) = self
            .channel
            .send(OutboundEvent::AnswerCall { to: caller, answer })
            .await
        {
            tracing::warn!(error = %e, "failed to emit answer");
            self.fail_setup(epoch, &format!("signaling send failed: {e}"), false)
                .await;
            return Err(CallError::Signaling(e.to_string()));
        }

        self.mark_connected(epoch);
        self.write_status(call_id, CallStatus::Accepted).await;
        Ok(())
    }

    /// Reject the ringing incoming call
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidState`] when nothing is ringing.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let rejected = self
            .terminate_if(
                None,
                |s| s.phase == CallPhase::IncomingRinging,
                EndReason::Rejected,
                true,
            )
            .await;
        if rejected {
            Ok(())
        } else {
            Err(CallError::InvalidState)
        }
    }

    /// End the active call, whatever its phase
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidState`] when no session is active.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let ended = self
            .terminate_if(None, |_| true, EndReason::Ended { by_peer: false }, true)
            .await;
        if ended {
            Ok(())
        } else {
            Err(CallError::InvalidState)
        }
    }

    /// Flip the microphone, returning the new enabled flag
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidState`] without a local stream.
    pub fn toggle_audio(&self) -> Result<bool, CallError> {
        self.toggle_track(|local| local.audio().map(|t| t.toggle()))
    }

    /// Flip the camera, returning the new enabled flag
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidState`] without a local stream or video track.
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle_track(|local| local.video().map(|t| t.toggle()))
    }

    /// Hold or resume the connected call, returning the new hold flag
    ///
    /// Engaging snapshots the current audio/video enabled flags and mutes
    /// both; releasing restores exactly the snapshot.
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidState`] outside `Connected`/`OnHold`, or before
    /// a local stream exists.
    pub fn toggle_hold(&self) -> Result<bool, CallError> {
        let mut slot = self.slot.lock();
        let Some(s) = slot.session.as_mut() else {
            return Err(CallError::InvalidState);
        };
        match s.phase {
            CallPhase::Connected => {
                let Some(local) = s.local.as_ref() else {
                    return Err(CallError::InvalidState);
                };
                s.hold = Some(HoldSnapshot {
                    audio_enabled: local.audio_enabled(),
                    video_enabled: local.video_enabled(),
                });
                if let Some(track) = local.audio() {
                    track.set_enabled(false);
                }
                if let Some(track) = local.video() {
                    track.set_enabled(false);
                }
                s.phase = CallPhase::OnHold;
                tracing::debug!("hold engaged");
                self.emit(SessionEvent::PhaseChanged {
                    phase: CallPhase::OnHold,
                });
                self.emit(SessionEvent::MediaFlags {
                    audio_enabled: false,
                    video_enabled: false,
                    on_hold: true,
                });
                Ok(true)
            }
            CallPhase::OnHold => {
                let Some(local) = s.local.as_ref() else {
                    return Err(CallError::InvalidState);
                };
                let Some(snapshot) = s.hold.take() else {
                    return Err(CallError::InvalidState);
                };
                if let Some(track) = local.audio() {
                    track.set_enabled(snapshot.audio_enabled);
                }
                if let Some(track) = local.video() {
                    track.set_enabled(snapshot.video_enabled);
                }
                s.phase = CallPhase::Connected;
                tracing::debug!("hold released");
                self.emit(SessionEvent::PhaseChanged {
                    phase: CallPhase::Connected,
                });
                self.emit(SessionEvent::MediaFlags {
                    audio_enabled: snapshot.audio_enabled,
                    video_enabled: snapshot.video_enabled,
                    on_hold: false,
                });
                Ok(false)
            }
            _ => Err(CallError::InvalidState),
        }
    }

    // ------------------------------------------------------------------
    // Signaling event handlers
    // ------------------------------------------------------------------

    /// React to one validated signaling event
    ///
    /// Exposed for transports that deliver events directly instead of
    /// through [`subscribe`](CallController::subscribe).
    pub async fn handle_signal(&self, event: InboundEvent) {
        tracing::debug!(event = event.name(), "signaling event");
        match event {
            InboundEvent::IncomingCall {
                from,
                offer,
                kind,
                caller_info,
            } => self.on_incoming_call(from, offer, kind, caller_info),
            InboundEvent::CallAnswered { answer } => self.on_call_answered(answer).await,
            InboundEvent::Ringing {} => self.on_ringing(),
            InboundEvent::UserOffline {} => {
                self.terminate_if(
                    None,
                    |s| s.phase == CallPhase::OutgoingRinging,
                    EndReason::PeerOffline,
                    false,
                )
                .await;
            }
            InboundEvent::IceCandidate { candidate } => self.on_candidate(candidate).await,
            InboundEvent::Hangup {} => {
                self.terminate_if(None, |_| true, EndReason::Ended { by_peer: true }, false)
                    .await;
            }
        }
    }

    fn on_incoming_call(
        &self,
        from: UserId,
        offer: SessionDescription,
        kind: MediaKind,
        caller_info: CallerInfo,
    ) {
        let mut slot = self.slot.lock();
        if slot.session.is_some() {
            tracing::warn!(from = %from, "inbound offer ignored, session already active");
            return;
        }
        let mut session = Session::new(
            caller_info.call_id,
            from.clone(),
            kind,
            CallPhase::IncomingRinging,
        );
        session.room_name = caller_info.room_name.clone();
        session.stored_offer = Some(offer);
        slot.session = Some(session);

        tracing::info!(from = %from, kind = ?kind, "incoming call");
        self.emit(SessionEvent::IncomingCall {
            caller: caller_info,
            kind,
        });
        self.emit(SessionEvent::PhaseChanged {
            phase: CallPhase::IncomingRinging,
        });
    }

    fn on_ringing(&self) {
        let slot = self.slot.lock();
        match slot.session.as_ref() {
            Some(s) if s.phase == CallPhase::OutgoingRinging => {
                self.emit(SessionEvent::RingingAtPeer);
            }
            _ => tracing::debug!("ringing event outside outgoing call, ignored"),
        }
    }

    async fn on_call_answered(&self, answer: SessionDescription) {
        let (epoch, link, call_id) = {
            let mut slot = self.slot.lock();
            let epoch = slot.epoch;
            let Some(s) = slot.session.as_mut() else {
                tracing::debug!("answer with no session, ignored");
                return;
            };
            if s.phase != CallPhase::OutgoingRinging {
                tracing::warn!(phase = ?s.phase, "answer in unexpected phase, ignored");
                return;
            }
            if let Some(timer) = s.ring_timer.take() {
                timer.abort();
            }
            let Some(link) = s.link.clone() else {
                tracing::warn!("answer before link exists, ignored");
                return;
            };
            s.phase = CallPhase::Connecting;
            self.emit(SessionEvent::PhaseChanged {
                phase: CallPhase::Connecting,
            });
            (epoch, link, s.id)
        };

        if let Err(e) = link.set_remote_description(answer).await {
            // Not terminal on its own; the connection-state monitor reacts
            // to whatever failure follows.
            tracing::warn!(error = %e, "failed to apply remote answer");
            return;
        }

        self.drain_candidates(epoch, &link).await;
        self.mark_connected(epoch);
        self.write_status(call_id, CallStatus::Accepted).await;
    }

    async fn on_candidate(&self, candidate: CandidatePayload) {
        enum Disposition {
            Apply(Arc<dyn PeerLink>, CandidatePayload),
            Queued,
            NoSession,
        }

        let disposition = {
            let mut slot = self.slot.lock();
            match slot.session.as_mut() {
                None => Disposition::NoSession,
                Some(s) if !s.remote_description_set => {
                    s.pending.push(candidate);
                    Disposition::Queued
                }
                Some(s) => match s.link.clone() {
                    Some(link) => Disposition::Apply(link, candidate),
                    None => Disposition::NoSession,
                },
            }
        };

        match disposition {
            Disposition::Apply(link, candidate) => {
                if let Err(e) = link.add_candidate(candidate).await {
                    tracing::warn!(error = %e, "failed to apply remote candidate");
                }
            }
            Disposition::Queued => tracing::debug!("candidate buffered until remote description"),
            Disposition::NoSession => tracing::debug!("candidate with no session, dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Peer link events
    // ------------------------------------------------------------------

    async fn handle_peer_event(&self, epoch: u64, event: PeerEvent) {
        match event {
            PeerEvent::CandidateDiscovered(candidate) => {
                let target = {
                    let mut slot = self.slot.lock();
                    match Self::session_at(&mut slot, epoch) {
                        Some(s) => s.remote_party.clone(),
                        None => return,
                    }
                };
                if let Err(e) = self
                    .channel
                    .send(OutboundEvent::IceCandidate {
                        to: target,
                        candidate,
                    })
                    .await
                {
                    tracing::warn!(error = %e, "failed to forward local candidate");
                }
            }
            PeerEvent::RemoteTrack { track_id } => {
                let stream = {
                    let mut slot = self.slot.lock();
                    let Some(s) = Self::session_at(&mut slot, epoch) else {
                        return;
                    };
                    let next = match s.remote.as_ref() {
                        Some(stream) => stream.with_track(&track_id),
                        None => RemoteStream::first(&track_id),
                    };
                    s.remote = Some(next.clone());
                    next
                };
                self.emit(SessionEvent::RemoteStream { stream });
            }
            PeerEvent::StateChanged(state) => {
                let mut slot = self.slot.lock();
                let Some(s) = Self::session_at(&mut slot, epoch) else {
                    return;
                };
                s.link_state = state;
                if state == LinkState::Connected {
                    if let Some(timer) = s.grace_timer.take() {
                        timer.abort();
                        tracing::debug!("connection recovered inside grace window");
                    }
                } else if state.is_degraded()
                    && matches!(
                        s.phase,
                        CallPhase::Connecting | CallPhase::Connected | CallPhase::OnHold
                    )
                    && s.grace_timer.is_none()
                {
                    tracing::warn!(state = ?state, "connection degraded, opening grace window");
                    s.grace_timer = Some(self.spawn_grace_timer(epoch));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn session_at<'a>(slot: &'a mut Slot, epoch: u64) -> Option<&'a mut Session> {
        if slot.epoch == epoch {
            slot.session.as_mut()
        } else {
            None
        }
    }

    fn toggle_track(
        &self,
        flip: impl FnOnce(&LocalStream) -> Option<bool>,
    ) -> Result<bool, CallError> {
        let slot = self.slot.lock();
        let Some(s) = slot.session.as_ref() else {
            return Err(CallError::InvalidState);
        };
        let Some(local) = s.local.as_ref() else {
            return Err(CallError::InvalidState);
        };
        let Some(enabled) = flip(local) else {
            return Err(CallError::InvalidState);
        };
        self.emit(SessionEvent::MediaFlags {
            audio_enabled: local.audio_enabled(),
            video_enabled: local.video_enabled(),
            on_hold: s.phase == CallPhase::OnHold,
        });
        Ok(enabled)
    }

    /// Install the acquired stream and link into the session, rolling both
    /// back if the session changed underneath the async setup.
    async fn install_transport(
        &self,
        epoch: u64,
        local: LocalStream,
        link: Arc<dyn PeerLink>,
        peer_rx: mpsc::Receiver<PeerEvent>,
    ) -> Result<(), CallError> {
        let pump = self.spawn_peer_pump(epoch, peer_rx);
        let stream_id = local.id().to_string();
        let stale = {
            let mut slot = self.slot.lock();
            match Self::session_at(&mut slot, epoch) {
                Some(s) => {
                    s.local = Some(local);
                    s.link = Some(link);
                    s.peer_pump = Some(pump);
                    None
                }
                None => Some((local, link, pump)),
            }
        };
        match stale {
            None => {
                self.emit(SessionEvent::LocalStream { stream_id });
                Ok(())
            }
            Some((local, link, pump)) => {
                pump.abort();
                local.stop_all();
                link.close().await;
                Err(CallError::InvalidState)
            }
        }
    }

    async fn negotiate_local_offer(
        &self,
        link: &Arc<dyn PeerLink>,
    ) -> Result<SessionDescription, CallError> {
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Apply buffered candidates in arrival order, then flip the
    /// remote-description flag so later candidates apply directly.
    ///
    /// Candidates arriving mid-drain are still buffered (the flag is not
    /// yet set) and picked up by the next pass, preserving FIFO order
    /// relative to direct application.
    async fn drain_candidates(&self, epoch: u64, link: &Arc<dyn PeerLink>) {
        loop {
            let batch = {
                let mut slot = self.slot.lock();
                let Some(s) = Self::session_at(&mut slot, epoch) else {
                    return;
                };
                let batch = s.pending.drain();
                if batch.is_empty() {
                    s.remote_description_set = true;
                }
                batch
            };
            if batch.is_empty() {
                return;
            }
            tracing::debug!(count = batch.len(), "applying buffered candidates");
            for candidate in batch {
                if let Err(e) = link.add_candidate(candidate).await {
                    tracing::warn!(error = %e, "failed to apply buffered candidate");
                }
            }
        }
    }

    fn mark_connected(&self, epoch: u64) {
        let mut slot = self.slot.lock();
        let Some(s) = Self::session_at(&mut slot, epoch) else {
            return;
        };
        s.connected_at = Some(Instant::now());
        s.connected_wallclock = Some(Utc::now());
        s.phase = CallPhase::Connected;
        s.ticker = Some(self.spawn_ticker(epoch));
        tracing::info!(call_id = %s.id, "call connected");
        self.emit(SessionEvent::PhaseChanged {
            phase: CallPhase::Connected,
        });
    }

    async fn fail_setup(&self, epoch: u64, message: &str, notify_peer: bool) {
        self.terminate_if(
            Some(epoch),
            |_| true,
            EndReason::SetupFailed {
                message: message.to_string(),
            },
            notify_peer,
        )
        .await;
    }

    /// Terminate the session when the guard admits it, running the single
    /// cleanup routine and the best-effort follow-ups.
    ///
    /// Returns whether a session was actually torn down. Safe to race:
    /// guard evaluation and cleanup happen under one lock, and a second
    /// caller finds the slot empty.
    async fn terminate_if(
        &self,
        epoch: Option<u64>,
        guard: impl FnOnce(&Session) -> bool,
        reason: EndReason,
        notify_peer: bool,
    ) -> bool {
        let (teardown, target, call_id) = {
            let mut slot = self.slot.lock();
            if let Some(expected) = epoch {
                if slot.epoch != expected {
                    return false;
                }
            }
            let Some(s) = slot.session.as_ref() else {
                return false;
            };
            if !guard(s) {
                return false;
            }
            let target = s.remote_party.clone();
            let call_id = s.id;
            let teardown = self.cleanup_locked(&mut slot, &reason);
            (teardown, target, call_id)
        };

        if let Some(teardown) = teardown {
            if let Some(link) = teardown.link {
                link.close().await;
            }
        }

        if notify_peer {
            if let Err(e) = self.channel.send(OutboundEvent::Hangup { to: target }).await {
                tracing::warn!(error = %e, "failed to emit hangup");
            }
        }

        self.write_status(call_id, reason.record_status()).await;
        true
    }

    /// The single cleanup routine: every terminal transition funnels here.
    ///
    /// Clears all timers, stops every local track, clears the candidate
    /// queue and hold snapshot, publishes the terminal phase and the reset
    /// to idle, and bumps the epoch so in-flight work stands down. The
    /// peer link is handed back for the caller to close outside the lock.
    fn cleanup_locked(&self, slot: &mut Slot, reason: &EndReason) -> Option<Teardown> {
        let mut session = slot.session.take()?;
        slot.epoch = slot.epoch.wrapping_add(1);

        session.abort_timers();
        if let Some(local) = session.local.take() {
            local.stop_all();
        }
        session.pending.clear();
        session.hold = None;

        let terminal = reason.terminal_phase();
        tracing::info!(call_id = %session.id, reason = ?reason, phase = ?terminal, "session cleaned up");
        self.emit(SessionEvent::PhaseChanged { phase: terminal });
        self.emit(SessionEvent::Terminated {
            reason: reason.clone(),
        });
        self.emit(SessionEvent::PhaseChanged {
            phase: CallPhase::Idle,
        });

        Some(Teardown {
            link: session.link.take(),
        })
    }

    async fn write_status(&self, call_id: CallId, status: CallStatus) {
        if let Err(e) = self.directory.update_status(call_id, status).await {
            tracing::warn!(error = %e, call_id = %call_id, "call record status write failed");
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn spawn_ring_timer(&self, epoch: u64) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            let timed_out = controller
                .terminate_if(
                    Some(epoch),
                    |s| s.phase == CallPhase::OutgoingRinging,
                    EndReason::NoAnswer,
                    true,
                )
                .await;
            if timed_out {
                tracing::info!("no answer within ring timeout, call abandoned");
            }
        })
    }

    fn spawn_grace_timer(&self, epoch: u64) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let window = self.config.grace_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            let lost = controller
                .terminate_if(
                    Some(epoch),
                    |s| s.link_state.is_degraded(),
                    EndReason::ConnectivityLost,
                    false,
                )
                .await;
            if lost {
                tracing::warn!("connection did not recover inside grace window");
            }
        })
    }

    fn spawn_ticker(&self, epoch: u64) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                let seconds = {
                    let mut slot = controller.slot.lock();
                    match Self::session_at(&mut slot, epoch) {
                        Some(s) => match s.connected_at {
                            Some(start) => start.elapsed().as_secs(),
                            None => break,
                        },
                        None => break,
                    }
                };
                controller.emit(SessionEvent::DurationTick { seconds });
            }
        })
    }

    fn spawn_peer_pump(
        &self,
        epoch: u64,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_peer_event(epoch, event).await;
            }
        })
    }
}

impl<S, M, P> Drop for CallController<S, M, P>
where
    S: SignalingChannel,
    M: MediaSource,
    P: PeerConnector,
{
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        if let Some(session) = self.slot.lock().session.as_mut() {
            session.abort_timers();
            if let Some(local) = session.local.take() {
                local.stop_all();
            }
        }
    }
}
