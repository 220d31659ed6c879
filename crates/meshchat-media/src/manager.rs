//! Media session manager.
//!
//! Owns every capture track and one [`CallSession`] per remote peer. Each
//! toggle rebuilds the outgoing stream and re-offers it to every connected
//! peer; calls are never patched track by track. Methods return the
//! envelopes to send, the caller owns the links.
//!
//! Turning a capture on is split in two. [`MediaSessionManager::begin_toggle`]
//! marks the slot `Acquiring` and hands back a [`CaptureRequest`] that the
//! caller awaits wherever it likes; the result goes back through
//! [`MediaSessionManager::finish_capture`]. Dropping the request cancels it
//! and frees the slot.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use meshchat_shared::{Envelope, PeerIdentity};
use tracing::{debug, info, warn};

use crate::capture::{CaptureDevices, MediaError, MediaStream, Track, TrackKind};
use crate::signaling::{CallSession, SignalingAction};

/// Envelopes addressed to individual peers.
pub type Outbound = Vec<(PeerIdentity, Envelope)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Disabled,
    Acquiring,
    Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    CaptureStateChanged { kind: TrackKind, state: CaptureState },
    ScreenShareChanged { active: bool },
    RemoteStreamAdded { peer: PeerIdentity, stream: MediaStream },
    RemoteStreamRemoved { peer: PeerIdentity },
}

/// Read-only view of the call state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaCallState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub local_stream: Option<MediaStream>,
    pub remote_streams: BTreeMap<PeerIdentity, MediaStream>,
}

/// Result of [`MediaSessionManager::begin_toggle`].
pub enum Toggle {
    /// Nothing to wait for; send these envelopes.
    Done(Outbound),
    /// Capture was requested; await it and pass the outcome to
    /// [`MediaSessionManager::finish_capture`].
    Pending(CaptureRequest),
}

/// An outstanding capture request.
pub struct CaptureRequest {
    kind: TrackKind,
    ticket: Arc<()>,
    acquire: BoxFuture<'static, Result<Track, MediaError>>,
}

impl CaptureRequest {
    pub fn kind(&self) -> TrackKind {
        self.kind
    }
}

impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRequest").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl Future for CaptureRequest {
    type Output = CaptureOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let kind = self.kind;
        let ticket = Arc::clone(&self.ticket);
        self.acquire.poll_unpin(cx).map(|result| CaptureOutcome {
            kind,
            ticket,
            result,
        })
    }
}

/// A resolved [`CaptureRequest`].
#[derive(Debug)]
pub struct CaptureOutcome {
    kind: TrackKind,
    ticket: Arc<()>,
    result: Result<Track, MediaError>,
}

impl CaptureOutcome {
    pub fn kind(&self) -> TrackKind {
        self.kind
    }
}

#[derive(Debug, Default)]
struct CaptureSlot {
    state: CaptureState,
    track: Option<Track>,
    /// Held strongly by the outstanding request while `Acquiring`.
    pending: Option<Weak<()>>,
}

impl CaptureSlot {
    /// `Acquiring` whose request was dropped counts as `Disabled`.
    fn effective_state(&self) -> CaptureState {
        match self.state {
            CaptureState::Acquiring if !self.request_alive() => CaptureState::Disabled,
            state => state,
        }
    }

    fn request_alive(&self) -> bool {
        self.pending.as_ref().is_some_and(|ticket| ticket.strong_count() > 0)
    }

    fn is_current(&self, ticket: &Arc<()>) -> bool {
        self.pending
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|pending| Arc::ptr_eq(&pending, ticket))
    }
}

pub struct MediaSessionManager<D: CaptureDevices> {
    local: PeerIdentity,
    devices: D,
    audio: CaptureSlot,
    video: CaptureSlot,
    screen: CaptureSlot,
    local_stream: Option<MediaStream>,
    calls: BTreeMap<PeerIdentity, CallSession>,
    events: Vec<MediaEvent>,
}

impl<D: CaptureDevices> MediaSessionManager<D> {
    pub fn new(local: PeerIdentity, devices: D) -> Self {
        Self {
            local,
            devices,
            audio: CaptureSlot::default(),
            video: CaptureSlot::default(),
            screen: CaptureSlot::default(),
            local_stream: None,
            calls: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Rename the local side after an identity change.
    pub fn set_local(&mut self, local: PeerIdentity) {
        self.local = local;
    }

    pub fn capture_state(&self, kind: TrackKind) -> CaptureState {
        self.slot(kind).effective_state()
    }

    pub fn state(&self) -> MediaCallState {
        MediaCallState {
            audio_enabled: self.audio.state == CaptureState::Enabled,
            video_enabled: self.video.state == CaptureState::Enabled,
            screen_sharing: self.screen.state == CaptureState::Enabled,
            local_stream: self.local_stream.clone(),
            remote_streams: self
                .calls
                .iter()
                .filter_map(|(peer, call)| call.remote_stream.clone().map(|s| (peer.clone(), s)))
                .collect(),
        }
    }

    /// Events recorded since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.events)
    }

    pub async fn toggle_audio(&mut self, peers: &BTreeSet<PeerIdentity>) -> Result<Outbound, MediaError> {
        let toggle = self.begin_toggle(TrackKind::Audio, peers);
        self.complete(toggle, peers).await
    }

    pub async fn toggle_video(&mut self, peers: &BTreeSet<PeerIdentity>) -> Result<Outbound, MediaError> {
        let toggle = self.begin_toggle(TrackKind::Video, peers);
        self.complete(toggle, peers).await
    }

    pub async fn start_screen_share(&mut self, peers: &BTreeSet<PeerIdentity>) -> Result<Outbound, MediaError> {
        let toggle = self.begin_screen_share();
        self.complete(toggle, peers).await
    }

    async fn complete(&mut self, toggle: Toggle, peers: &BTreeSet<PeerIdentity>) -> Result<Outbound, MediaError> {
        match toggle {
            Toggle::Done(outbound) => Ok(outbound),
            Toggle::Pending(request) => {
                let outcome = request.await;
                self.finish_capture(outcome, peers)
            }
        }
    }

    /// Flip an audio or video capture. Turning off is immediate; turning
    /// on returns the request to await. A toggle while a live request is
    /// outstanding does nothing.
    pub fn begin_toggle(&mut self, kind: TrackKind, peers: &BTreeSet<PeerIdentity>) -> Toggle {
        self.settle(kind);
        match self.slot(kind).state {
            CaptureState::Enabled => {
                self.stop_capture(kind);
                Toggle::Done(self.reoffer(peers))
            }
            CaptureState::Acquiring => Toggle::Done(Outbound::new()),
            CaptureState::Disabled => Toggle::Pending(self.request(kind)),
        }
    }

    /// Start sharing the screen unless a share is live or being requested.
    pub fn begin_screen_share(&mut self) -> Toggle {
        self.settle(TrackKind::Screen);
        match self.screen.state {
            CaptureState::Disabled => Toggle::Pending(self.request(TrackKind::Screen)),
            _ => Toggle::Done(Outbound::new()),
        }
    }

    /// Apply a resolved capture request. A result for a request that was
    /// superseded or shut down is released and ignored.
    pub fn finish_capture(
        &mut self,
        outcome: CaptureOutcome,
        peers: &BTreeSet<PeerIdentity>,
    ) -> Result<Outbound, MediaError> {
        let CaptureOutcome { kind, ticket, result } = outcome;
        if !self.slot(kind).is_current(&ticket) {
            debug!(kind = %kind, "Stale capture result dropped");
            if let Ok(track) = result {
                self.devices.release(&track);
            }
            return Ok(Outbound::new());
        }
        self.slot_mut(kind).pending = None;

        match result {
            Ok(track) => {
                info!(kind = %kind, track = %track.id, "Capture started");
                self.slot_mut(kind).track = Some(track);
                self.set_capture_state(kind, CaptureState::Enabled);
                Ok(self.reoffer(peers))
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Capture failed");
                self.set_capture_state(kind, CaptureState::Disabled);
                Err(e)
            }
        }
    }

    pub fn stop_screen_share(&mut self, peers: &BTreeSet<PeerIdentity>) -> Outbound {
        if self.screen.state != CaptureState::Enabled {
            return Outbound::new();
        }
        self.stop_capture(TrackKind::Screen);
        self.reoffer(peers)
    }

    /// A track ended outside our control (e.g. the OS "stop sharing" button).
    pub fn on_capture_ended(&mut self, track_id: &str, peers: &BTreeSet<PeerIdentity>) -> Outbound {
        for kind in [TrackKind::Screen, TrackKind::Audio, TrackKind::Video] {
            if self.slot(kind).track.as_ref().is_some_and(|t| t.id == track_id) {
                self.stop_capture(kind);
                return self.reoffer(peers);
            }
        }
        debug!(track = %track_id, "Ended track is not ours");
        Outbound::new()
    }

    /// Handle an inbound `media-*` envelope from `from`.
    pub fn handle_signal(&mut self, from: &PeerIdentity, envelope: &Envelope) -> Outbound {
        let call = self
            .calls
            .entry(from.clone())
            .or_insert_with(|| CallSession::new(self.local.clone(), from.clone()));
        let had_stream = call.remote_stream.is_some();

        let mut outbound = Outbound::new();
        match call.handle_signal(envelope) {
            SignalingAction::CreateAnswer => {
                let answer = call.create_answer(self.local_stream.as_ref());
                outbound.push((from.clone(), answer));
                self.note_remote_stream(from, had_stream);
            }
            SignalingAction::SetRemoteStream => self.note_remote_stream(from, had_stream),
            SignalingAction::Close => {
                self.calls.remove(from);
                if had_stream {
                    self.events.push(MediaEvent::RemoteStreamRemoved { peer: from.clone() });
                }
            }
            SignalingAction::Ignore => {}
        }
        outbound
    }

    /// Drop everything tied to a peer whose link closed.
    pub fn peer_disconnected(&mut self, peer: &PeerIdentity) {
        if let Some(call) = self.calls.remove(peer) {
            debug!(peer = %peer, "Dropping call for disconnected peer");
            if call.remote_stream.is_some() {
                self.events.push(MediaEvent::RemoteStreamRemoved { peer: peer.clone() });
            }
        }
    }

    /// A peer connected while we are sending: offer it the current stream.
    pub fn offer_to(&mut self, peer: &PeerIdentity) -> Outbound {
        let Some(stream) = self.local_stream.clone() else {
            return Outbound::new();
        };
        let call = self
            .calls
            .entry(peer.clone())
            .or_insert_with(|| CallSession::new(self.local.clone(), peer.clone()));
        vec![(peer.clone(), call.create_offer(&stream))]
    }

    /// Stop every track, cancel pending requests and hang up every call.
    pub fn shutdown(&mut self) -> Outbound {
        for kind in [TrackKind::Audio, TrackKind::Video, TrackKind::Screen] {
            self.slot_mut(kind).pending = None;
            self.stop_capture(kind);
        }
        self.local_stream = None;
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(peer, mut call)| (peer, call.hangup()))
            .collect()
    }

    fn request(&mut self, kind: TrackKind) -> CaptureRequest {
        let ticket = Arc::new(());
        self.slot_mut(kind).pending = Some(Arc::downgrade(&ticket));
        self.set_capture_state(kind, CaptureState::Acquiring);
        debug!(kind = %kind, "Capture requested");
        CaptureRequest {
            kind,
            ticket,
            acquire: self.devices.acquire(kind),
        }
    }

    /// Return a slot whose request was dropped to `Disabled`.
    fn settle(&mut self, kind: TrackKind) {
        let slot = self.slot(kind);
        if slot.state == CaptureState::Acquiring && !slot.request_alive() {
            debug!(kind = %kind, "Capture request abandoned");
            self.slot_mut(kind).pending = None;
            self.set_capture_state(kind, CaptureState::Disabled);
        }
    }

    fn stop_capture(&mut self, kind: TrackKind) {
        if let Some(track) = self.slot_mut(kind).track.take() {
            self.devices.release(&track);
            info!(kind = %kind, track = %track.id, "Capture stopped");
        }
        self.set_capture_state(kind, CaptureState::Disabled);
    }

    /// Outgoing tracks: the screen replaces the camera while sharing.
    fn outgoing_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.audio.track.iter().cloned().collect();
        match &self.screen.track {
            Some(screen) => tracks.push(screen.clone()),
            None => tracks.extend(self.video.track.iter().cloned()),
        }
        tracks
    }

    /// Rebuild the outgoing stream and re-initiate every call with it, or
    /// end every call when nothing is left to send.
    fn reoffer(&mut self, peers: &BTreeSet<PeerIdentity>) -> Outbound {
        let tracks = self.outgoing_tracks();
        let mut outbound = Outbound::new();

        if tracks.is_empty() {
            self.local_stream = None;
            let ended: Vec<PeerIdentity> = self
                .calls
                .iter()
                .filter(|(_, call)| call.local_stream.is_some())
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in ended {
                if let Some(call) = self.calls.get_mut(&peer) {
                    outbound.push((peer.clone(), call.hangup()));
                    if call.remote_stream.is_none() {
                        self.calls.remove(&peer);
                    }
                }
            }
            debug!(ended = outbound.len(), "Nothing left to send, calls ended");
            return outbound;
        }

        let stream = MediaStream::new(tracks);
        for peer in peers {
            let call = self
                .calls
                .entry(peer.clone())
                .or_insert_with(|| CallSession::new(self.local.clone(), peer.clone()));
            outbound.push((peer.clone(), call.create_offer(&stream)));
        }
        debug!(stream = %stream.id, tracks = stream.tracks.len(), peers = peers.len(), "Re-offered calls");
        self.local_stream = Some(stream);
        outbound
    }

    fn note_remote_stream(&mut self, peer: &PeerIdentity, had_stream: bool) {
        let stream = self.calls.get(peer).and_then(|c| c.remote_stream.clone());
        match stream {
            Some(stream) => self.events.push(MediaEvent::RemoteStreamAdded {
                peer: peer.clone(),
                stream,
            }),
            None if had_stream => self.events.push(MediaEvent::RemoteStreamRemoved { peer: peer.clone() }),
            None => {}
        }
    }

    fn set_capture_state(&mut self, kind: TrackKind, state: CaptureState) {
        let slot = self.slot_mut(kind);
        if slot.state == state {
            return;
        }
        let was_enabled = slot.state == CaptureState::Enabled;
        slot.state = state;
        let event = match kind {
            TrackKind::Screen if state == CaptureState::Enabled || was_enabled => {
                MediaEvent::ScreenShareChanged {
                    active: state == CaptureState::Enabled,
                }
            }
            TrackKind::Screen => return,
            _ => MediaEvent::CaptureStateChanged { kind, state },
        };
        self.events.push(event);
    }

    fn slot(&self, kind: TrackKind) -> &CaptureSlot {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
            TrackKind::Screen => &self.screen,
        }
    }

    fn slot_mut(&mut self, kind: TrackKind) -> &mut CaptureSlot {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
            TrackKind::Screen => &mut self.screen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedDevices;
    use std::time::Duration;

    fn peers(ids: &[&str]) -> BTreeSet<PeerIdentity> {
        ids.iter().map(|s| PeerIdentity::new(*s)).collect()
    }

    fn manager() -> (MediaSessionManager<ScriptedDevices>, ScriptedDevices) {
        let devices = ScriptedDevices::new();
        (
            MediaSessionManager::new(PeerIdentity::new("user-me"), devices.clone()),
            devices,
        )
    }

    #[tokio::test]
    async fn test_video_toggle_cycle() {
        let (mut media, devices) = manager();
        let connected = peers(&["user-b", "user-c"]);

        let outbound = media.toggle_video(&connected).await.unwrap();
        assert_eq!(outbound.len(), 2);
        assert!(outbound.iter().all(|(_, env)| matches!(env, Envelope::MediaOffer(_))));
        assert_eq!(
            media.drain_events(),
            vec![
                MediaEvent::CaptureStateChanged { kind: TrackKind::Video, state: CaptureState::Acquiring },
                MediaEvent::CaptureStateChanged { kind: TrackKind::Video, state: CaptureState::Enabled },
            ]
        );
        assert!(media.state().video_enabled);
        assert_eq!(devices.live_tracks().len(), 1);

        let outbound = media.toggle_video(&connected).await.unwrap();
        assert!(outbound.iter().all(|(_, env)| matches!(env, Envelope::MediaEnd(_))));
        assert_eq!(media.capture_state(TrackKind::Video), CaptureState::Disabled);
        assert!(devices.live_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_off_reoffers_remaining_tracks() {
        let (mut media, _) = manager();
        let connected = peers(&["user-b"]);
        media.toggle_audio(&connected).await.unwrap();
        media.toggle_video(&connected).await.unwrap();

        let outbound = media.toggle_video(&connected).await.unwrap();
        match &outbound[..] {
            [(_, Envelope::MediaOffer(signal))] => {
                let stream: MediaStream = serde_json::from_value(signal.body.clone()).unwrap();
                assert!(stream.has(TrackKind::Audio));
                assert!(!stream.has(TrackKind::Video));
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capture_failure_leaves_disabled() {
        let (mut media, devices) = manager();
        devices.deny(TrackKind::Audio);

        let err = media.toggle_audio(&peers(&["user-b"])).await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied(TrackKind::Audio));
        assert_eq!(media.capture_state(TrackKind::Audio), CaptureState::Disabled);
        assert!(media.state().local_stream.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_prompt_frees_the_slot() {
        let (mut media, devices) = manager();
        let connected = peers(&["user-b"]);
        devices.hang(TrackKind::Video);

        let abandoned = tokio::time::timeout(Duration::from_millis(20), media.toggle_video(&connected)).await;
        assert!(abandoned.is_err());
        assert_eq!(media.capture_state(TrackKind::Video), CaptureState::Disabled);

        devices.resume(TrackKind::Video);
        let outbound = media.toggle_video(&connected).await.unwrap();
        assert!(matches!(&outbound[..], [(_, Envelope::MediaOffer(_))]));
        assert!(media.state().video_enabled);
        assert_eq!(devices.acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_pending_request_runs_outside_the_manager() {
        let (mut media, devices) = manager();
        let connected = peers(&["user-b"]);

        let Toggle::Pending(request) = media.begin_toggle(TrackKind::Audio, &connected) else {
            panic!("expected a capture request");
        };
        assert_eq!(request.kind(), TrackKind::Audio);
        assert_eq!(media.capture_state(TrackKind::Audio), CaptureState::Acquiring);
        assert!(matches!(
            media.begin_toggle(TrackKind::Audio, &connected),
            Toggle::Done(ref out) if out.is_empty()
        ));

        let outcome = request.await;
        media.finish_capture(outcome, &connected).unwrap();
        assert!(media.state().audio_enabled);
        assert_eq!(devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_result_after_shutdown_is_released() {
        let (mut media, devices) = manager();
        let connected = peers(&["user-b"]);

        let Toggle::Pending(request) = media.begin_toggle(TrackKind::Video, &connected) else {
            panic!("expected a capture request");
        };
        media.shutdown();
        let outcome = request.await;

        assert!(media.finish_capture(outcome, &connected).unwrap().is_empty());
        assert_eq!(media.capture_state(TrackKind::Video), CaptureState::Disabled);
        assert!(devices.live_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_end_restores_camera() {
        let (mut media, devices) = manager();
        let connected = peers(&["user-b"]);
        media.toggle_video(&connected).await.unwrap();
        media.start_screen_share(&connected).await.unwrap();
        assert!(media.state().screen_sharing);
        assert!(media.state().video_enabled);

        let screen = devices
            .live_tracks()
            .into_iter()
            .find(|t| t.kind == TrackKind::Screen)
            .unwrap();
        let outbound = media.on_capture_ended(&screen.id, &connected);
        match &outbound[..] {
            [(_, Envelope::MediaOffer(signal))] => {
                let stream: MediaStream = serde_json::from_value(signal.body.clone()).unwrap();
                assert!(stream.has(TrackKind::Video));
                assert!(!stream.has(TrackKind::Screen));
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert!(!media.state().screen_sharing);
    }

    #[tokio::test]
    async fn test_screen_share_end_without_camera_ends_calls() {
        let (mut media, _) = manager();
        let connected = peers(&["user-b"]);
        media.start_screen_share(&connected).await.unwrap();

        let outbound = media.stop_screen_share(&connected);
        assert!(matches!(&outbound[..], [(_, Envelope::MediaEnd(_))]));
    }

    #[tokio::test]
    async fn test_incoming_offer_is_answered_with_local_stream() {
        let (mut caller, _) = manager();
        let (mut callee, _) = manager();
        let b = PeerIdentity::new("user-b");
        let me = PeerIdentity::new("user-me");

        let offer = caller.toggle_audio(&peers(&["user-b"])).await.unwrap().remove(0).1;
        let reply = callee.handle_signal(&me, &offer);
        assert!(matches!(&reply[..], [(_, Envelope::MediaAnswer(_))]));
        assert!(callee.state().remote_streams.contains_key(&me));
        assert!(matches!(
            callee.drain_events().last(),
            Some(MediaEvent::RemoteStreamAdded { .. })
        ));

        caller.handle_signal(&b, &reply[0].1);
        callee.peer_disconnected(&me);
        assert!(callee.state().remote_streams.is_empty());
    }
}
