//! The session object: one per local identity.
//!
//! A [`Session`] owns everything a running chat node needs (transport,
//! connection registry, chat state, media calls, typing timer, snapshot
//! persistence) and is driven from a single task. Public operations take
//! `&mut self` and complete before the next event is handled. Capture
//! prompts are the exception: [`Session::begin_toggle`] hands the pending
//! request to the caller so the session keeps running while it waits. The
//! UI learns about changes through the [`SessionEvents`] receiver returned
//! by [`Session::new`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use meshchat_media::{
    CaptureDevices, CaptureOutcome, CaptureRequest, CaptureState, MediaCallState, MediaError,
    MediaSessionManager, Outbound, Toggle, TrackKind,
};
use meshchat_net::{SessionRegistry, Transport, TransportError, TransportEvent, TransportEvents};
use meshchat_shared::identity::generate_peer_identity;
use meshchat_shared::protocol::TypingState;
use meshchat_shared::{
    Channel, ChannelId, ChannelKind, ChatSnapshot, ConnectionStatus, Decoded, Envelope, Message,
    MessageId, MessageKind, PeerIdentity, PresenceStatus, Server, User, Visibility,
};
use meshchat_store::SnapshotStore;

use crate::bot::{self, CompletionService};
use crate::clock::MonotonicClock;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{EventSink, NoticeLevel, SessionEvent, SessionEvents};
use crate::reconcile::{plan_local, plan_remote, plan_send, Fanout, LocalAction, LocalPlan, Outcome};
use crate::state::{Change, ChatState};
use crate::typing::TypingDebouncer;

enum Wake {
    Transport(Option<TransportEvent>),
    TypingDeadline,
}

pub struct Session<T: Transport, D: CaptureDevices> {
    config: SessionConfig,
    local_id: PeerIdentity,
    display_name: String,
    transport: T,
    events: Option<TransportEvents>,
    registry: SessionRegistry,
    state: ChatState,
    media: MediaSessionManager<D>,
    typing: TypingDebouncer,
    clock: MonotonicClock,
    sink: EventSink,
    snapshots: Option<SnapshotStore>,
}

impl<T: Transport, D: CaptureDevices> Session<T, D> {
    pub fn new(
        config: SessionConfig,
        local_id: PeerIdentity,
        display_name: impl Into<String>,
        transport: T,
        devices: D,
    ) -> (Self, SessionEvents) {
        let (sink, events) = EventSink::channel();
        let session = Self {
            typing: TypingDebouncer::new(config.typing_timeout),
            media: MediaSessionManager::new(local_id.clone(), devices),
            config,
            local_id,
            display_name: display_name.into(),
            transport,
            events: None,
            registry: SessionRegistry::new(),
            state: ChatState::new(),
            clock: MonotonicClock::new(),
            sink,
            snapshots: None,
        };
        (session, events)
    }

    /// Attach snapshot persistence and restore the saved chat, if any.
    pub fn with_snapshots(mut self, mut store: SnapshotStore) -> Result<Self, SessionError> {
        if self.config.persist {
            store.set_enabled(true)?;
        }
        if let Some(snapshot) = store.load()? {
            info!(
                channels = snapshot.channels.len(),
                messages = snapshot.messages.len(),
                "Restored chat snapshot"
            );
            self.state = ChatState::from_snapshot(snapshot);
        }
        self.snapshots = Some(store);
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local_id(&self) -> &PeerIdentity {
        &self.local_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.registry.status()
    }

    pub fn is_open(&self) -> bool {
        self.events.is_some()
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.state.snapshot()
    }

    pub fn connected_peers(&self) -> std::collections::BTreeSet<PeerIdentity> {
        self.registry.list_connected_peers()
    }

    pub fn media_state(&self) -> MediaCallState {
        self.media.state()
    }

    pub fn capture_state(&self, kind: TrackKind) -> CaptureState {
        self.media.capture_state(kind)
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_typing()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register with the rendezvous facility and start accepting links.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        if self.events.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        if self.display_name.trim().is_empty() {
            return Err(SessionError::EmptyName);
        }

        self.set_status(ConnectionStatus::Connecting);
        match self.transport.open(&self.local_id).await {
            Ok(events) => {
                self.events = Some(events);
                self.registry
                    .register_self(self.local_id.clone(), self.display_name.clone());
                self.set_status(ConnectionStatus::Connected);
                info!(peer = %self.local_id, "Session open");
                self.act(LocalAction::AnnounceSelf {
                    name: self.display_name.clone(),
                })?;
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Disconnected);
                let text = match &e {
                    TransportError::IdCollision(id) => {
                        format!("The identity {id} is already in use. Generate a new one and try again.")
                    }
                    other => format!("Could not reach the rendezvous service: {other}"),
                };
                warn!(peer = %self.local_id, error = %e, "Failed to open session");
                self.sink.notice(NoticeLevel::Error, text);
                Err(e.into())
            }
        }
    }

    /// Mint a fresh identity after a collision. Only valid while closed.
    pub fn regenerate_identity(&mut self) -> Result<PeerIdentity, SessionError> {
        if self.events.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        let id = generate_peer_identity();
        info!(old = %self.local_id, new = %id, "Regenerated identity");
        self.local_id = id.clone();
        self.media.set_local(id.clone());
        Ok(id)
    }

    /// Wait for the next transport event or the typing deadline and handle
    /// it. Returns `false` once the transport has stopped reporting.
    pub async fn step(&mut self) -> Result<bool, SessionError> {
        let deadline = self.typing.deadline();
        let events = self.events.as_mut().ok_or(SessionError::NotOpen)?;

        let wake = tokio::select! {
            event = events.recv() => Wake::Transport(event),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Wake::TypingDeadline
            }
        };

        match wake {
            Wake::Transport(Some(event)) => {
                self.handle_transport_event(event);
                Ok(true)
            }
            Wake::Transport(None) => {
                self.transport_stopped();
                Ok(false)
            }
            Wake::TypingDeadline => {
                self.expire_typing();
                Ok(true)
            }
        }
    }

    /// Handle every event already queued without waiting. Returns how many
    /// were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(events) = self.events.as_mut() {
            match events.try_recv() {
                Ok(event) => {
                    self.handle_transport_event(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.transport_stopped();
                    break;
                }
            }
        }
        self.expire_typing();
        handled
    }

    /// End calls, stop typing, close every link and leave the rendezvous.
    pub fn disconnect(&mut self) {
        if self.events.is_none() {
            return;
        }
        if let Some(is_typing) = self.typing.update(false, Instant::now()) {
            self.broadcast_typing(is_typing);
        }
        let outbound = self.media.shutdown();
        self.send_outbound(outbound);
        self.forward_media_events();
        info!(peer = %self.local_id, "Disconnecting");
        self.teardown();
    }

    // -----------------------------------------------------------------------
    // Chat operations
    // -----------------------------------------------------------------------

    /// Send a text message. Works while disconnected: the message is kept
    /// locally and reaches whoever is connected at the time.
    pub fn send(
        &mut self,
        content: impl Into<String>,
        channel: Option<ChannelId>,
    ) -> Result<Message, SessionError> {
        self.send_kind(content.into(), MessageKind::Text, channel)
    }

    /// Send an image (or audio/video clip) inline as a data URL.
    pub fn send_attachment(
        &mut self,
        kind: MessageKind,
        mime: &str,
        bytes: &[u8],
        channel: Option<ChannelId>,
    ) -> Result<Message, SessionError> {
        if bytes.is_empty() {
            return Err(SessionError::EmptyContent);
        }
        let content = format!("data:{mime};base64,{}", BASE64.encode(bytes));
        self.send_kind(content, kind, channel)
    }

    fn send_kind(
        &mut self,
        content: String,
        kind: MessageKind,
        channel: Option<ChannelId>,
    ) -> Result<Message, SessionError> {
        let now = self.clock.now();
        let (plan, message) = plan_send(&self.state, &self.local_id, now, content, kind, channel)?;
        self.commit(plan);
        self.update_typing(false);
        Ok(message)
    }

    /// Create a channel and select it. A blank name yields `None`.
    pub fn create_channel(
        &mut self,
        name: &str,
        kind: ChannelKind,
        visibility: Visibility,
        description: Option<String>,
    ) -> Result<Option<Channel>, SessionError> {
        let outcome = self.act(LocalAction::CreateChannel {
            name: name.to_string(),
            kind,
            visibility,
            description,
        })?;
        Ok(match outcome {
            Outcome::Channel(channel) => {
                info!(channel = %channel.id, name = %channel.name, "Created channel");
                Some(channel)
            }
            _ => None,
        })
    }

    pub fn select_channel(&mut self, channel: ChannelId) -> Result<(), SessionError> {
        self.act(LocalAction::SelectChannel(channel)).map(|_| ())
    }

    pub fn set_channel_visibility(
        &mut self,
        channel: ChannelId,
        visibility: Visibility,
    ) -> Result<(), SessionError> {
        self.act(LocalAction::SetVisibility {
            channel,
            visibility,
        })
        .map(|_| ())
    }

    /// Invite `peer` to the current channel: share it, add the peer as a
    /// member, then dial. The channel is announced once the link opens.
    pub fn invite(&mut self, peer: PeerIdentity) -> Result<(), SessionError> {
        let channel = self
            .state
            .current_channel()
            .cloned()
            .ok_or(SessionError::NoChannelSelected)?;
        self.invite_to(channel, peer)
    }

    pub fn invite_to(&mut self, channel: ChannelId, peer: PeerIdentity) -> Result<(), SessionError> {
        self.act(LocalAction::Invite {
            channel: channel.clone(),
            peer: peer.clone(),
        })?;
        info!(channel = %channel, peer = %peer, "Invited peer");
        self.connect_to_peer(&peer)
    }

    /// Dial `peer` unless a link to it is already pending or open.
    pub fn connect_to_peer(&mut self, peer: &PeerIdentity) -> Result<(), SessionError> {
        if self.events.is_none() {
            return Err(SessionError::NotOpen);
        }
        if self.registry.is_tracked(peer) {
            debug!(peer = %peer, "Already linked");
            return Ok(());
        }
        let connection = self.transport.connect(peer)?;
        self.registry.record_dial(connection);
        Ok(())
    }

    pub fn mark_read(&mut self, message: MessageId) -> Result<(), SessionError> {
        self.act(LocalAction::MarkRead(message)).map(|_| ())
    }

    pub fn react(&mut self, message: MessageId, emoji: &str, add: bool) -> Result<(), SessionError> {
        self.act(LocalAction::React {
            message,
            emoji: emoji.to_string(),
            add,
        })
        .map(|_| ())
    }

    pub fn create_server(
        &mut self,
        name: &str,
        channels: Vec<ChannelId>,
    ) -> Result<Option<Server>, SessionError> {
        let outcome = self.act(LocalAction::CreateServer {
            name: name.to_string(),
            channels,
        })?;
        Ok(match outcome {
            Outcome::Server(server) => Some(server),
            _ => None,
        })
    }

    /// Rename the local user and tell the mesh.
    pub fn set_display_name(&mut self, name: &str) -> Result<(), SessionError> {
        self.act(LocalAction::AnnounceSelf {
            name: name.to_string(),
        })?;
        self.display_name = name.trim().to_string();
        Ok(())
    }

    /// Feed keystroke activity. Only transitions reach the wire.
    pub fn update_typing(&mut self, is_typing: bool) {
        if let Some(state) = self.typing.update(is_typing, Instant::now()) {
            self.broadcast_typing(state);
        }
    }

    /// Answer an `@bot` message. Returns the injected reply, or `None` when
    /// the message is not a bot prompt or the service produced nothing
    /// usable (the user is told through a notice).
    pub async fn invoke_bot(
        &mut self,
        service: &dyn CompletionService,
        trigger: &Message,
    ) -> Result<Option<Message>, SessionError> {
        let Some(prompt) = bot::extract_prompt(&trigger.content) else {
            return Ok(None);
        };
        let context = match trigger.channel_id.as_ref().and_then(|id| self.state.channel(id)) {
            Some(channel) => channel.messages.as_slice(),
            None => self.state.messages(),
        };
        let history = bot::build_history(context, &trigger.id, self.config.bot_history);
        let provider = service.provider();
        debug!(provider = provider.tag(), turns = history.len(), "Invoking completion service");

        let reply = match service.complete(prompt, &history).await {
            Ok(completion) => bot::collect(completion).await,
            Err(e) => Err(e),
        };
        let text = match reply {
            Ok(text) if text.trim().is_empty() => {
                self.sink
                    .notice(NoticeLevel::Info, "The bot returned no content");
                return Ok(None);
            }
            Ok(text) => text,
            Err(e) => {
                warn!(provider = provider.tag(), error = %e, "Completion failed");
                self.sink.notice(
                    NoticeLevel::Error,
                    format!("{} request failed: {e}", provider.tag()),
                );
                return Ok(None);
            }
        };

        let now = self.clock.now();
        let (plan, message) = plan_send(
            &self.state,
            &provider.sender(),
            now,
            text,
            MessageKind::Text,
            trigger.channel_id.clone(),
        )?;
        self.commit(plan);
        Ok(Some(message))
    }

    // -----------------------------------------------------------------------
    // Media
    // -----------------------------------------------------------------------

    /// Flip the microphone. Waits for the capture prompt while holding the
    /// session; [`Session::begin_toggle`] keeps the session usable instead.
    pub async fn toggle_audio(&mut self) -> Result<(), SessionError> {
        let request = self.begin_toggle(TrackKind::Audio);
        self.await_capture(request).await
    }

    pub async fn toggle_video(&mut self) -> Result<(), SessionError> {
        let request = self.begin_toggle(TrackKind::Video);
        self.await_capture(request).await
    }

    pub async fn start_screen_share(&mut self) -> Result<(), SessionError> {
        let request = self.begin_screen_share();
        self.await_capture(request).await
    }

    /// Flip an audio or video capture. Turning off finishes here and yields
    /// `None`. Turning on yields the pending capture request: await it
    /// anywhere while the session keeps sending and receiving, then pass
    /// the outcome to [`Session::finish_capture`]. Dropping the request
    /// cancels it.
    pub fn begin_toggle(&mut self, kind: TrackKind) -> Option<CaptureRequest> {
        let peers = self.registry.list_connected_peers();
        let toggle = self.media.begin_toggle(kind, &peers);
        self.take_toggle(toggle)
    }

    pub fn begin_screen_share(&mut self) -> Option<CaptureRequest> {
        let toggle = self.media.begin_screen_share();
        self.take_toggle(toggle)
    }

    /// Apply a resolved capture request, offering the new stream to every
    /// peer connected now.
    pub fn finish_capture(&mut self, outcome: CaptureOutcome) -> Result<(), SessionError> {
        let peers = self.registry.list_connected_peers();
        let result = self.media.finish_capture(outcome, &peers);
        self.finish_media(result)
    }

    async fn await_capture(&mut self, request: Option<CaptureRequest>) -> Result<(), SessionError> {
        match request {
            Some(request) => {
                let outcome = request.await;
                self.finish_capture(outcome)
            }
            None => Ok(()),
        }
    }

    fn take_toggle(&mut self, toggle: Toggle) -> Option<CaptureRequest> {
        match toggle {
            Toggle::Done(outbound) => {
                self.send_outbound(outbound);
                self.forward_media_events();
                None
            }
            Toggle::Pending(request) => {
                self.forward_media_events();
                Some(request)
            }
        }
    }

    pub fn stop_screen_share(&mut self) {
        let peers = self.registry.list_connected_peers();
        let outbound = self.media.stop_screen_share(&peers);
        self.send_outbound(outbound);
        self.forward_media_events();
    }

    /// A capture track ended outside our control (e.g. the browser's
    /// "stop sharing" button).
    pub fn on_capture_ended(&mut self, track_id: &str) {
        let peers = self.registry.list_connected_peers();
        let outbound = self.media.on_capture_ended(track_id, &peers);
        self.send_outbound(outbound);
        self.forward_media_events();
    }

    fn finish_media(&mut self, result: Result<Outbound, MediaError>) -> Result<(), SessionError> {
        self.forward_media_events();
        match result {
            Ok(outbound) => {
                self.send_outbound(outbound);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Media capture failed");
                self.sink.notice(NoticeLevel::Error, e.to_string());
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Replace the chat state with a saved snapshot.
    pub fn seed(&mut self, snapshot: ChatSnapshot) {
        self.state = ChatState::from_snapshot(snapshot);
        self.state_changed();
    }

    /// Turn snapshot saving on or off. Enabling saves immediately.
    pub fn set_persistence(&mut self, enabled: bool) -> Result<(), SessionError> {
        let snapshot = self.state.snapshot();
        let Some(store) = self.snapshots.as_mut() else {
            return Ok(());
        };
        store.set_enabled(enabled)?;
        store.save(&snapshot)?;
        Ok(())
    }

    /// Stored bot settings and chat data as one JSON document.
    pub fn export_data(&self) -> Result<Option<String>, SessionError> {
        match &self.snapshots {
            Some(store) => Ok(Some(store.export()?)),
            None => Ok(None),
        }
    }

    /// Load an exported document and adopt its chat data.
    pub fn import_data(&mut self, raw: &str) -> Result<(), SessionError> {
        let Some(store) = self.snapshots.as_mut() else {
            return Ok(());
        };
        store.import(raw)?;
        if let Some(snapshot) = store.load()? {
            self.seed(snapshot);
        }
        Ok(())
    }

    pub fn clear_stored_data(&mut self) -> Result<(), SessionError> {
        if let Some(store) = self.snapshots.as_mut() {
            store.clear()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingConnection(connection) => {
                debug!(peer = %connection.peer(), "Incoming link");
                self.registry.record_dial(connection);
            }
            TransportEvent::ConnectionOpen { peer } => self.on_connection_open(peer),
            TransportEvent::Data { peer, data } => self.on_data(&peer, &data),
            TransportEvent::ConnectionClosed { peer } => self.on_peer_gone(&peer),
            TransportEvent::ConnectionError { peer, reason } => {
                warn!(peer = %peer, reason = %reason, "Peer connection error");
                if let Some(connection) = self.registry.tracked(&peer) {
                    connection.close();
                }
                self.sink.notice(
                    NoticeLevel::Warning,
                    format!("Connection to {peer} failed: {reason}"),
                );
                self.on_peer_gone(&peer);
            }
            TransportEvent::Disconnected => {
                warn!("Lost rendezvous registration");
                self.set_status(ConnectionStatus::Disconnected);
                self.sink.notice(
                    NoticeLevel::Error,
                    "Disconnected from the rendezvous service",
                );
            }
            TransportEvent::Fatal(e) => {
                error!(error = %e, "Transport failed");
                self.sink
                    .notice(NoticeLevel::Error, format!("Network failure: {e}"));
                self.teardown();
            }
        }
    }

    fn on_connection_open(&mut self, peer: PeerIdentity) {
        let Some(connection) = self.registry.tracked(&peer).cloned() else {
            warn!(peer = %peer, "Open event for an untracked link");
            return;
        };
        let (_, fresh) = self.registry.record_connection_open(connection);
        if !fresh {
            return;
        }
        self.sink.emit(SessionEvent::PeerConnected(peer.clone()));

        let me = self
            .state
            .user(&self.local_id)
            .cloned()
            .unwrap_or_else(|| User::online(self.local_id.clone(), self.display_name.clone()));
        let mut greeting = vec![Envelope::IdentityAnnounce(me)];
        let shared = self.state.shared_channels();
        if !shared.is_empty() {
            greeting.push(Envelope::ChannelAnnounce(shared));
        }
        if !self.state.servers().is_empty() {
            greeting.push(Envelope::RosterAnnounce(self.state.servers().to_vec()));
        }
        for envelope in &greeting {
            if let Err(e) = self.registry.send_to(&peer, envelope) {
                warn!(peer = %peer, kind = envelope.kind(), error = %e, "Failed to greet peer");
                break;
            }
        }

        let outbound = self.media.offer_to(&peer);
        self.send_outbound(outbound);
        self.forward_media_events();
    }

    fn on_data(&mut self, peer: &PeerIdentity, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(Decoded::Envelope(envelope)) => envelope,
            Ok(Decoded::Unknown(kind)) => {
                debug!(peer = %peer, kind = %kind, "Dropping unknown envelope kind");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping malformed envelope");
                return;
            }
        };
        debug!(peer = %peer, kind = envelope.kind(), "Received envelope");

        match envelope {
            Envelope::MediaOffer(_) | Envelope::MediaAnswer(_) | Envelope::MediaEnd(_) => {
                let outbound = self.media.handle_signal(peer, &envelope);
                self.send_outbound(outbound);
                self.forward_media_events();
            }
            other => {
                let plan = plan_remote(&self.state, peer, other);
                if plan.changes.is_empty() {
                    return;
                }
                let received: Vec<Message> = plan
                    .changes
                    .iter()
                    .filter_map(|change| match change {
                        Change::AppendMessage(message) => Some(message.clone()),
                        _ => None,
                    })
                    .collect();
                self.state.apply(plan.changes);
                for message in received {
                    self.sink.emit(SessionEvent::MessageReceived(message));
                }
                self.state_changed();
            }
        }
    }

    fn on_peer_gone(&mut self, peer: &PeerIdentity) {
        let was_tracked = self.registry.record_connection_closed(peer);
        self.media.peer_disconnected(peer);
        self.forward_media_events();
        if self.state.user(peer).is_some() {
            self.state.apply(vec![Change::MarkOffline(peer.clone())]);
            self.state_changed();
        }
        if was_tracked {
            self.sink.emit(SessionEvent::PeerDisconnected(peer.clone()));
        }
    }

    fn transport_stopped(&mut self) {
        warn!("Transport event stream ended");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.registry.close_all();
        self.transport.shutdown();
        self.events = None;

        let gone: Vec<Change> = self
            .state
            .users()
            .filter(|u| u.id != self.local_id && u.status != PresenceStatus::Offline)
            .map(|u| Change::MarkOffline(u.id.clone()))
            .collect();
        if !gone.is_empty() {
            self.state.apply(gone);
            self.state_changed();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn expire_typing(&mut self) {
        if let Some(state) = self.typing.poll_expired(Instant::now()) {
            self.broadcast_typing(state);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn act(&mut self, action: LocalAction) -> Result<Outcome, SessionError> {
        let now = self.clock.now();
        let plan = plan_local(&self.state, &self.local_id, now, action)?;
        Ok(self.commit(plan))
    }

    fn commit(&mut self, plan: LocalPlan) -> Outcome {
        let touched = !plan.changes.is_empty();
        self.state.apply(plan.changes);
        self.dispatch(plan.fanout);
        if touched {
            self.state_changed();
        }
        plan.outcome
    }

    fn dispatch(&self, fanout: Fanout) {
        match fanout {
            Fanout::None => {}
            Fanout::Broadcast(envelope) => {
                if let Err(e) = self.registry.broadcast(&envelope) {
                    warn!(kind = envelope.kind(), error = %e, "Broadcast failed");
                }
            }
            Fanout::Unicast(peer, envelope) => {
                if let Err(e) = self.registry.send_to(&peer, &envelope) {
                    debug!(peer = %peer, kind = envelope.kind(), error = %e, "Unicast skipped");
                }
            }
        }
    }

    fn send_outbound(&self, outbound: Outbound) {
        for (peer, envelope) in outbound {
            self.dispatch(Fanout::Unicast(peer, envelope));
        }
    }

    fn broadcast_typing(&self, is_typing: bool) {
        self.dispatch(Fanout::Broadcast(Envelope::TypingState(TypingState {
            peer_id: self.local_id.clone(),
            is_typing,
        })));
    }

    fn forward_media_events(&mut self) {
        for event in self.media.drain_events() {
            self.sink.emit(SessionEvent::Media(event));
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.registry.status() != status {
            self.registry.set_status(status);
            self.sink.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn state_changed(&mut self) {
        if let Some(store) = self.snapshots.as_mut() {
            if let Err(e) = store.save(&self.state.snapshot()) {
                warn!(error = %e, "Failed to persist chat snapshot");
            }
        }
        self.sink.emit(SessionEvent::StateChanged);
    }
}

impl<T: Transport, D: CaptureDevices> Drop for Session<T, D> {
    fn drop(&mut self) {
        if self.events.is_some() {
            self.registry.close_all();
            self.transport.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshchat_media::ScriptedDevices;
    use meshchat_net::{MemoryNetwork, MemoryTransport};
    use meshchat_store::MemoryStore;

    type TestSession = Session<MemoryTransport, ScriptedDevices>;

    fn session(net: &MemoryNetwork, id: &str, name: &str) -> (TestSession, SessionEvents) {
        Session::new(
            SessionConfig::default(),
            PeerIdentity::new(id),
            name,
            net.transport(),
            ScriptedDevices::new(),
        )
    }

    fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_open_announces_self_and_connects() {
        let net = MemoryNetwork::new();
        let (mut alice, mut events) = session(&net, "user-alice", "Alice");

        alice.open().await.unwrap();

        assert_eq!(alice.status(), ConnectionStatus::Connected);
        assert_eq!(alice.state().user(alice.local_id()).unwrap().name, "Alice");
        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::StatusChanged(ConnectionStatus::Connecting)));
        assert!(events.contains(&SessionEvent::StatusChanged(ConnectionStatus::Connected)));
    }

    #[tokio::test]
    async fn test_operations_before_open() {
        let net = MemoryNetwork::new();
        let (mut alice, _events) = session(&net, "user-alice", "Alice");

        assert!(matches!(alice.step().await, Err(SessionError::NotOpen)));
        assert!(matches!(
            alice.connect_to_peer(&PeerIdentity::new("user-bob")),
            Err(SessionError::NotOpen)
        ));
        // Local sends work offline.
        let message = alice.send("draft", None).unwrap();
        assert_eq!(alice.state().messages(), &[message]);
    }

    #[tokio::test]
    async fn test_blank_name_cannot_open() {
        let net = MemoryNetwork::new();
        let (mut alice, _events) = session(&net, "user-alice", "  ");
        assert!(matches!(alice.open().await, Err(SessionError::EmptyName)));
        assert!(!net.is_registered(&PeerIdentity::new("user-alice")));
    }

    #[tokio::test]
    async fn test_regenerate_only_while_closed() {
        let net = MemoryNetwork::new();
        let (mut alice, _events) = session(&net, "user-alice", "Alice");
        let fresh = alice.regenerate_identity().unwrap();
        assert_ne!(fresh.as_str(), "user-alice");
        assert_eq!(alice.local_id(), &fresh);

        alice.open().await.unwrap();
        assert!(matches!(
            alice.regenerate_identity(),
            Err(SessionError::AlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn test_typing_transitions() {
        let net = MemoryNetwork::new();
        let (mut alice, _events) = session(&net, "user-alice", "Alice");
        alice.open().await.unwrap();

        alice.update_typing(true);
        assert!(alice.is_typing());
        alice.send("done", None).unwrap();
        assert!(!alice.is_typing());
    }

    #[tokio::test]
    async fn test_snapshots_saved_after_mutation() {
        let net = MemoryNetwork::new();
        let mut store = SnapshotStore::new(Box::new(MemoryStore::new()));
        store.set_enabled(true).unwrap();
        let (alice, _events) = session(&net, "user-alice", "Alice");
        let mut alice = alice.with_snapshots(store).unwrap();

        alice
            .create_channel("general", ChannelKind::Text, Visibility::Private, None)
            .unwrap();
        alice.send("hello", None).unwrap();

        let exported = alice.export_data().unwrap().unwrap();
        assert!(exported.contains("general"));
        assert!(exported.contains("hello"));
    }

    #[tokio::test]
    async fn test_image_is_sent_as_data_url() {
        let net = MemoryNetwork::new();
        let (mut alice, _events) = session(&net, "user-alice", "Alice");

        let message = alice
            .send_attachment(MessageKind::Image, "image/png", &[0x89, 0x50, 0x4e, 0x47], None)
            .unwrap();

        assert_eq!(message.kind, MessageKind::Image);
        assert_eq!(message.content, "data:image/png;base64,iVBORw==");
        assert!(matches!(
            alice.send_attachment(MessageKind::Image, "image/png", &[], None),
            Err(SessionError::EmptyContent)
        ));
    }
}
