//! Call-session lifecycle tests
//!
//! Drives the controller with mock collaborators under paused tokio time,
//! covering the single-session invariant, cleanup idempotency, candidate
//! ordering, hold round-trips, the no-answer timeout, and the degraded-
//! connection grace window.

use async_trait::async_trait;
use lexcall_core::{
    CallController, CallError, CallPhase, CallStatus, CallerInfo, CandidatePayload,
    ControllerConfig, EndReason, InMemoryDirectory, InboundEvent, LocalIdentity, LocalStream,
    LocalTrack, MediaError, MediaKind, MediaSource, OutboundEvent, PeerConnector, PeerError,
    PeerEvent, PeerLink, SessionDescription, SessionEvent, SignalingChannel, TrackKind, UserId,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------

#[derive(Debug)]
struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed")
    }
}

impl std::error::Error for ChannelClosed {}

/// Records outbound events; inbound events are injected by the test.
struct RecordingChannel {
    sent: Mutex<Vec<OutboundEvent>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Value>>,
}

impl RecordingChannel {
    fn new() -> (Arc<Self>, mpsc::Sender<Value>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                inbound: tokio::sync::Mutex::new(rx),
            }),
            tx,
        )
    }

    fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().unwrap().clone()
    }

    fn hangups_to(&self, user: &UserId) -> usize {
        self.sent()
            .iter()
            .filter(|e| matches!(e, OutboundEvent::Hangup { to } if to == user))
            .count()
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    type Error = ChannelClosed;

    async fn send(&self, event: OutboundEvent) -> Result<(), ChannelClosed> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    async fn recv(&self) -> Result<Value, ChannelClosed> {
        self.inbound.lock().await.recv().await.ok_or(ChannelClosed)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum MediaBehavior {
    Grant,
    DenyPermission,
    DeviceBusy,
}

struct MockMedia {
    behavior: Mutex<MediaBehavior>,
    counter: AtomicU64,
}

impl MockMedia {
    fn new() -> Self {
        Self {
            behavior: Mutex::new(MediaBehavior::Grant),
            counter: AtomicU64::new(0),
        }
    }

    fn set_behavior(&self, behavior: MediaBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaError> {
        match *self.behavior.lock().unwrap() {
            MediaBehavior::DenyPermission => Err(MediaError::PermissionDenied(
                "user denied microphone".to_string(),
            )),
            MediaBehavior::DeviceBusy => Err(MediaError::DeviceUnavailable(
                "microphone already in use".to_string(),
            )),
            MediaBehavior::Grant => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                let mut tracks = vec![Arc::new(LocalTrack::new(
                    format!("audio-{n}"),
                    TrackKind::Audio,
                ))];
                if kind.has_video() {
                    tracks.push(Arc::new(LocalTrack::new(
                        format!("video-{n}"),
                        TrackKind::Video,
                    )));
                }
                Ok(LocalStream::new(format!("mock-local-{n}"), tracks))
            }
        }
    }
}

/// Peer link that records everything the controller does to it.
struct MockLink {
    applied: Mutex<Vec<CandidatePayload>>,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    closed: AtomicBool,
}

impl MockLink {
    fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn applied(&self) -> Vec<CandidatePayload> {
        self.applied.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(PeerError::Negotiation("no remote description".to_string()));
        }
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn add_candidate(&self, candidate: CandidatePayload) -> Result<(), PeerError> {
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockConnector {
    links: Mutex<Vec<Arc<MockLink>>>,
    event_senders: Mutex<Vec<mpsc::Sender<PeerEvent>>>,
}

impl MockConnector {
    fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
            event_senders: Mutex::new(Vec::new()),
        }
    }

    fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    fn last_link(&self) -> Arc<MockLink> {
        self.links.lock().unwrap().last().cloned().expect("no link")
    }

    fn last_events(&self) -> mpsc::Sender<PeerEvent> {
        self.event_senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no link")
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        _kind: MediaKind,
        _local: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let link = Arc::new(MockLink::new());
        self.links.lock().unwrap().push(Arc::clone(&link));
        self.event_senders.lock().unwrap().push(events);
        Ok(link)
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    controller: Arc<CallController<RecordingChannel, MockMedia, MockConnector>>,
    channel: Arc<RecordingChannel>,
    media: Arc<MockMedia>,
    connector: Arc<MockConnector>,
    directory: Arc<InMemoryDirectory>,
}

fn harness() -> Harness {
    let (channel, _inbound_tx) = RecordingChannel::new();
    let media = Arc::new(MockMedia::new());
    let connector = Arc::new(MockConnector::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let controller = CallController::new(
        LocalIdentity::new("u-self", "Sam Ortiz"),
        Arc::clone(&channel),
        Arc::clone(&media),
        Arc::clone(&connector),
        directory.clone(),
        ControllerConfig::default(),
    );
    Harness {
        controller,
        channel,
        media,
        connector,
        directory,
    }
}

fn caller_info(id: &str) -> CallerInfo {
    CallerInfo {
        id: UserId::new(id),
        name: "Priya Shah".to_string(),
        avatar: None,
        call_id: lexcall_core::CallId::new(),
        room_name: "room-test".to_string(),
    }
}

fn incoming_call(id: &str, kind: MediaKind) -> InboundEvent {
    InboundEvent::IncomingCall {
        from: UserId::new(id),
        offer: SessionDescription::offer("v=0 remote-offer"),
        kind,
        caller_info: caller_info(id),
    }
}

fn candidate(n: u16) -> CandidatePayload {
    CandidatePayload {
        candidate: format!("candidate:{n} 1 UDP 2122 192.0.2.{n} 5000 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Drive a harness to a connected incoming call.
async fn connect_incoming(h: &Harness, kind: MediaKind) {
    h.controller
        .handle_signal(incoming_call("u-peer", kind))
        .await;
    h.controller.accept_call().await.expect("accept failed");
    settle().await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Connected);
}

// ---------------------------------------------------------------------
// Single-session invariant
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_initiate_is_rejected_while_active() {
    let h = harness();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();

    let second = h
        .controller
        .initiate_call(UserId::new("u-3"), MediaKind::Audio)
        .await;
    assert!(matches!(second, Err(CallError::Busy)));

    // The original session is untouched.
    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.phase, CallPhase::OutgoingRinging);
    assert_eq!(snapshot.peer, Some(UserId::new("u-2")));
}

#[tokio::test(start_paused = true)]
async fn inbound_offer_is_ignored_while_active() {
    let h = harness();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();

    h.controller
        .handle_signal(incoming_call("u-3", MediaKind::Video))
        .await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.phase, CallPhase::OutgoingRinging);
    assert_eq!(snapshot.peer, Some(UserId::new("u-2")));
}

#[tokio::test(start_paused = true)]
async fn accept_without_incoming_call_is_rejected() {
    let h = harness();
    assert!(matches!(
        h.controller.accept_call().await,
        Err(CallError::InvalidState)
    ));
    assert!(matches!(
        h.controller.reject_call().await,
        Err(CallError::InvalidState)
    ));
}

#[tokio::test(start_paused = true)]
async fn double_accept_is_rejected() {
    let h = harness();
    h.controller
        .handle_signal(incoming_call("u-peer", MediaKind::Audio))
        .await;
    h.controller.accept_call().await.unwrap();
    assert!(matches!(
        h.controller.accept_call().await,
        Err(CallError::InvalidState)
    ));
}

// ---------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cleanup_is_idempotent() {
    let h = harness();
    connect_incoming(&h, MediaKind::Audio).await;
    let link = h.connector.last_link();

    h.controller.end_call().await.unwrap();
    let after_first = h.controller.snapshot();
    assert_eq!(after_first.phase, CallPhase::Idle);
    assert!(after_first.local_stream.is_none());
    assert!(link.is_closed());

    // A second end finds nothing, changes nothing.
    assert!(matches!(
        h.controller.end_call().await,
        Err(CallError::InvalidState)
    ));
    let after_second = h.controller.snapshot();
    assert_eq!(after_second.phase, CallPhase::Idle);
    assert!(after_second.local_stream.is_none());
}

#[tokio::test(start_paused = true)]
async fn peer_hangup_racing_local_end_cleans_up_once() {
    let h = harness();
    connect_incoming(&h, MediaKind::Audio).await;
    let peer = UserId::new("u-peer");

    h.controller.handle_signal(InboundEvent::Hangup {}).await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);

    // The local end racing in behind the hangup is a no-op.
    assert!(matches!(
        h.controller.end_call().await,
        Err(CallError::InvalidState)
    ));
    assert_eq!(h.channel.hangups_to(&peer), 0);
}

#[tokio::test(start_paused = true)]
async fn end_call_stops_local_tracks_and_notifies_peer() {
    let h = harness();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();
    let link = h.connector.last_link();

    h.controller.end_call().await.unwrap();

    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    assert_eq!(h.channel.hangups_to(&UserId::new("u-2")), 1);
    assert!(link.is_closed());
}

#[tokio::test(start_paused = true)]
async fn reject_notifies_caller() {
    let h = harness();
    h.controller
        .handle_signal(incoming_call("u-caller", MediaKind::Audio))
        .await;

    h.controller.reject_call().await.unwrap();

    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    assert_eq!(h.channel.hangups_to(&UserId::new("u-caller")), 1);
}

// ---------------------------------------------------------------------
// Timeout law / Scenario A
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scenario_a_unanswered_call_times_out() {
    let h = harness();
    let target = UserId::new("u-2");
    h.controller
        .initiate_call(target.clone(), MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(h.controller.snapshot().phase, CallPhase::OutgoingRinging);

    tokio::time::sleep(Duration::from_secs(46)).await;
    settle().await;

    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    assert!(h.channel.hangups_to(&target) >= 1);
}

#[tokio::test(start_paused = true)]
async fn answer_cancels_the_no_answer_timer() {
    let h = harness();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    h.controller
        .handle_signal(InboundEvent::CallAnswered {
            answer: SessionDescription::answer("v=0 remote-answer"),
        })
        .await;
    settle().await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Connected);

    // Well past the original deadline: the timer must not fire.
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Connected);
    assert_eq!(h.channel.hangups_to(&UserId::new("u-2")), 0);
}

#[tokio::test(start_paused = true)]
async fn peer_offline_fails_the_outgoing_call() {
    let h = harness();
    let mut events = h.controller.subscribe_events();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();

    h.controller.handle_signal(InboundEvent::UserOffline {}).await;

    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    let mut saw_offline = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            SessionEvent::Terminated {
                reason: EndReason::PeerOffline
            }
        ) {
            saw_offline = true;
        }
    }
    assert!(saw_offline);
}

// ---------------------------------------------------------------------
// Candidate ordering / Scenario B
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scenario_b_candidates_buffered_until_accept_apply_in_order() {
    let h = harness();
    h.controller
        .handle_signal(incoming_call("u-1", MediaKind::Video))
        .await;

    for n in 1..=3 {
        h.controller
            .handle_signal(InboundEvent::IceCandidate {
                candidate: candidate(n),
            })
            .await;
    }

    h.controller.accept_call().await.unwrap();

    // A candidate arriving after accept applies directly, behind the three.
    h.controller
        .handle_signal(InboundEvent::IceCandidate {
            candidate: candidate(4),
        })
        .await;

    let link = h.connector.last_link();
    assert_eq!(
        link.applied(),
        vec![candidate(1), candidate(2), candidate(3), candidate(4)]
    );
}

#[tokio::test(start_paused = true)]
async fn candidates_on_the_caller_side_wait_for_the_answer() {
    let h = harness();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();
    let link = h.connector.last_link();

    h.controller
        .handle_signal(InboundEvent::IceCandidate {
            candidate: candidate(1),
        })
        .await;
    assert!(link.applied().is_empty());

    h.controller
        .handle_signal(InboundEvent::CallAnswered {
            answer: SessionDescription::answer("v=0 remote-answer"),
        })
        .await;
    settle().await;

    assert_eq!(link.applied(), vec![candidate(1)]);
}

#[tokio::test(start_paused = true)]
async fn candidate_without_session_is_dropped() {
    let h = harness();
    h.controller
        .handle_signal(InboundEvent::IceCandidate {
            candidate: candidate(1),
        })
        .await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
}

// ---------------------------------------------------------------------
// Hold / Scenario C
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scenario_c_hold_restores_differing_flags() {
    let h = harness();
    connect_incoming(&h, MediaKind::Video).await;

    // Audio unmuted, video muted.
    let video_on = h.controller.toggle_video().unwrap();
    assert!(!video_on);
    let before = h.controller.snapshot();
    assert!(before.audio_enabled);
    assert!(!before.video_enabled);

    // Engage hold: both muted.
    assert!(h.controller.toggle_hold().unwrap());
    let held = h.controller.snapshot();
    assert_eq!(held.phase, CallPhase::OnHold);
    assert!(held.on_hold);
    assert!(!held.audio_enabled);
    assert!(!held.video_enabled);

    // Release: exactly the pre-hold flags come back.
    assert!(!h.controller.toggle_hold().unwrap());
    let released = h.controller.snapshot();
    assert_eq!(released.phase, CallPhase::Connected);
    assert!(released.audio_enabled);
    assert!(!released.video_enabled);
}

#[tokio::test(start_paused = true)]
async fn hold_is_rejected_before_media_exists() {
    let h = harness();
    h.controller
        .handle_signal(incoming_call("u-1", MediaKind::Audio))
        .await;

    // Incoming-ringing has no local stream yet: state-guarded no-op.
    assert!(matches!(
        h.controller.toggle_hold(),
        Err(CallError::InvalidState)
    ));
    assert_eq!(h.controller.snapshot().phase, CallPhase::IncomingRinging);
}

#[tokio::test(start_paused = true)]
async fn toggle_audio_flips_only_the_audio_track() {
    let h = harness();
    connect_incoming(&h, MediaKind::Video).await;

    assert!(!h.controller.toggle_audio().unwrap());
    let snapshot = h.controller.snapshot();
    assert!(!snapshot.audio_enabled);
    assert!(snapshot.video_enabled);

    assert!(h.controller.toggle_audio().unwrap());
    assert!(h.controller.snapshot().audio_enabled);
}

#[tokio::test(start_paused = true)]
async fn toggle_video_without_video_track_is_rejected() {
    let h = harness();
    connect_incoming(&h, MediaKind::Audio).await;
    assert!(matches!(
        h.controller.toggle_video(),
        Err(CallError::InvalidState)
    ));
}

// ---------------------------------------------------------------------
// Grace window / Scenario D
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scenario_d_transient_disconnect_self_heals() {
    let h = harness();
    connect_incoming(&h, MediaKind::Audio).await;
    let peer_events = h.connector.last_events();

    peer_events
        .send(PeerEvent::StateChanged(lexcall_core::LinkState::Disconnected))
        .await
        .unwrap();
    settle().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    peer_events
        .send(PeerEvent::StateChanged(lexcall_core::LinkState::Connected))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn unresolved_disconnect_fails_after_grace_window() {
    let h = harness();
    let mut events = h.controller.subscribe_events();
    connect_incoming(&h, MediaKind::Audio).await;
    let peer_events = h.connector.last_events();

    peer_events
        .send(PeerEvent::StateChanged(lexcall_core::LinkState::Failed))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;

    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    let mut saw_loss = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            SessionEvent::Terminated {
                reason: EndReason::ConnectivityLost
            }
        ) {
            saw_loss = true;
        }
    }
    assert!(saw_loss);
}

// ---------------------------------------------------------------------
// Media failure / Scenario E
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scenario_e_permission_denied_during_accept() {
    let h = harness();
    h.media.set_behavior(MediaBehavior::DenyPermission);
    h.controller
        .handle_signal(incoming_call("u-1", MediaKind::Audio))
        .await;

    let result = h.controller.accept_call().await;
    match result {
        Err(CallError::Media(MediaError::PermissionDenied(message))) => {
            assert!(message.contains("denied"));
        }
        other => unreachable!("expected permission error, got {other:?}"),
    }

    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    assert_eq!(h.connector.link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn device_busy_during_initiate_is_distinct() {
    let h = harness();
    h.media.set_behavior(MediaBehavior::DeviceBusy);

    let result = h
        .controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::DeviceUnavailable(_)))
    ));
    assert_eq!(h.controller.snapshot().phase, CallPhase::Idle);
    assert_eq!(h.connector.link_count(), 0);
}

// ---------------------------------------------------------------------
// Connected-call bookkeeping
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn outgoing_call_connects_and_ticks() {
    let h = harness();
    let mut events = h.controller.subscribe_events();
    h.controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();

    // The offer went out with our identity attached.
    let offer_sent = h
        .channel
        .sent()
        .iter()
        .any(|e| matches!(e, OutboundEvent::CallUser { to, .. } if to == &UserId::new("u-2")));
    assert!(offer_sent);

    h.controller.handle_signal(InboundEvent::Ringing {}).await;
    h.controller
        .handle_signal(InboundEvent::CallAnswered {
            answer: SessionDescription::answer("v=0 remote-answer"),
        })
        .await;
    settle().await;
    assert_eq!(h.controller.snapshot().phase, CallPhase::Connected);

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    assert!(h.controller.snapshot().elapsed_seconds >= 2);

    let mut saw_ringing = false;
    let mut saw_tick = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::RingingAtPeer => saw_ringing = true,
            SessionEvent::DurationTick { .. } => saw_tick = true,
            _ => {}
        }
    }
    assert!(saw_ringing);
    assert!(saw_tick);
}

#[tokio::test(start_paused = true)]
async fn remote_stream_is_rebuilt_per_track() {
    let h = harness();
    connect_incoming(&h, MediaKind::Video).await;
    let peer_events = h.connector.last_events();

    peer_events
        .send(PeerEvent::RemoteTrack {
            track_id: "remote-audio".to_string(),
        })
        .await
        .unwrap();
    settle().await;
    let first = h.controller.snapshot().remote_stream.unwrap();
    assert_eq!(first.revision(), 1);

    peer_events
        .send(PeerEvent::RemoteTrack {
            track_id: "remote-video".to_string(),
        })
        .await
        .unwrap();
    settle().await;
    let second = h.controller.snapshot().remote_stream.unwrap();

    assert_eq!(second.revision(), 2);
    assert_ne!(first, second);
    assert_eq!(
        second.track_ids(),
        ["remote-audio".to_string(), "remote-video".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn local_candidates_are_forwarded_to_the_peer() {
    let h = harness();
    connect_incoming(&h, MediaKind::Audio).await;
    let peer_events = h.connector.last_events();

    peer_events
        .send(PeerEvent::CandidateDiscovered(candidate(7)))
        .await
        .unwrap();
    settle().await;

    let forwarded = h.channel.sent().iter().any(|e| {
        matches!(
            e,
            OutboundEvent::IceCandidate { to, candidate: c }
                if to == &UserId::new("u-peer") && c == &candidate(7)
        )
    });
    assert!(forwarded);
}

#[tokio::test(start_paused = true)]
async fn accepted_call_writes_record_status() {
    let h = harness();
    // Record created through initiate so the directory knows the id.
    let call_id = h
        .controller
        .initiate_call(UserId::new("u-2"), MediaKind::Audio)
        .await
        .unwrap();
    h.controller
        .handle_signal(InboundEvent::CallAnswered {
            answer: SessionDescription::answer("v=0 remote-answer"),
        })
        .await;
    settle().await;
    assert_eq!(h.directory.status_of(call_id), Some(CallStatus::Accepted));

    h.controller.end_call().await.unwrap();
    assert_eq!(h.directory.status_of(call_id), Some(CallStatus::Ended));
}
