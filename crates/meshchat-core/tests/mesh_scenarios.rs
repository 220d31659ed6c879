//! End-to-end behaviour of sessions talking over an in-process mesh.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::timeout;

use meshchat_core::{
    BotProvider, ChatTurn, Completion, CompletionError, CompletionService, NoticeLevel, Session,
    SessionConfig, SessionError, SessionEvent, SessionEvents,
};
use meshchat_media::{CaptureState, MediaEvent, ScriptedDevices, TrackKind};
use meshchat_net::{MemoryNetwork, MemoryTransport, Transport, TransportError, TransportEvent};
use meshchat_shared::{
    ChannelKind, CodecError, ConnectionStatus, Envelope, Message, MessageId, MessageKind,
    PeerIdentity, PresenceStatus, Visibility,
};
use meshchat_store::{FileStore, SnapshotStore};

type TestSession = Session<MemoryTransport, ScriptedDevices>;

fn id(s: &str) -> PeerIdentity {
    PeerIdentity::new(s)
}

async fn open_node(net: &MemoryNetwork, peer: &str, name: &str) -> (TestSession, SessionEvents, ScriptedDevices) {
    let devices = ScriptedDevices::new();
    let (mut session, events) = Session::new(
        SessionConfig::default(),
        id(peer),
        name,
        net.transport(),
        devices.clone(),
    );
    session.open().await.unwrap();
    (session, events, devices)
}

/// Pump every session until no node has queued events left.
fn settle(nodes: &mut [&mut TestSession]) {
    loop {
        let handled: usize = nodes.iter_mut().map(|node| node.process_pending()).sum();
        if handled == 0 {
            break;
        }
    }
}

fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn notices(events: &[SessionEvent], level: NoticeLevel) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Notice { level: l, text } if *l == level => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Two nodes linked by `x` dialing `y`.
async fn linked_pair(net: &MemoryNetwork) -> (TestSession, SessionEvents, ScriptedDevices, TestSession, SessionEvents) {
    let (mut x, x_events, x_devices) = open_node(net, "user-x", "Xavier").await;
    let (mut y, y_events, _) = open_node(net, "user-y", "Yvonne").await;
    x.connect_to_peer(&id("user-y")).unwrap();
    settle(&mut [&mut x, &mut y]);
    (x, x_events, x_devices, y, y_events)
}

#[tokio::test]
async fn test_private_channel_send_stays_local() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd, mut y, _ye) = linked_pair(&net).await;

    let channel = x
        .create_channel("general", ChannelKind::Text, Visibility::Private, None)
        .unwrap()
        .unwrap();
    x.send("hi", Some(channel.id.clone())).unwrap();

    assert_eq!(y.process_pending(), 0, "nothing may reach the wire");
    assert_eq!(x.state().channel(&channel.id).unwrap().messages.len(), 1);
    assert!(y.state().channel(&channel.id).is_none());
    assert!(y.state().messages().is_empty());
}

#[tokio::test]
async fn test_local_sends_keep_call_order() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd, mut y, _ye) = linked_pair(&net).await;

    let sent: Vec<Message> = (0..200)
        .map(|n| x.send(format!("m{n}"), None).unwrap())
        .collect();
    settle(&mut [&mut x, &mut y]);

    let log = x.state().messages();
    assert_eq!(log, sent.as_slice());
    assert!(log.iter().enumerate().all(|(n, m)| m.content == format!("m{n}")));
    assert!(log.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    let ids: HashSet<&MessageId> = log.iter().map(|m| &m.id).collect();
    assert_eq!(ids.len(), sent.len());

    let received: Vec<&str> = y.state().messages().iter().map(|m| m.content.as_str()).collect();
    let expected: Vec<String> = (0..200).map(|n| format!("m{n}")).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_oversized_attachment_is_rejected_whole() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd, mut y, _ye) = linked_pair(&net).await;

    let err = x
        .send_attachment(MessageKind::Image, "image/png", &[7; 3_500_000], None)
        .unwrap_err();
    settle(&mut [&mut x, &mut y]);

    assert!(matches!(err, SessionError::Codec(CodecError::TooLarge { .. })));
    assert!(x.state().messages().is_empty());
    assert!(y.state().messages().is_empty());

    let small = x
        .send_attachment(MessageKind::Image, "image/png", &[7; 1024], None)
        .unwrap();
    settle(&mut [&mut x, &mut y]);
    assert_eq!(y.state().messages().len(), 1);
    assert_eq!(y.state().messages()[0].id, small.id);
}

#[tokio::test]
async fn test_invite_shares_channel_and_delivers_message() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd) = open_node(&net, "user-x", "Xavier").await;
    let (mut y, mut y_events, _yd) = open_node(&net, "user-y", "Yvonne").await;

    let channel = x
        .create_channel("general", ChannelKind::Text, Visibility::Private, None)
        .unwrap()
        .unwrap();
    x.invite(id("user-y")).unwrap();

    let shared = x.state().channel(&channel.id).unwrap();
    assert!(shared.is_shared());
    assert!(shared.members.contains(&id("user-y")));

    settle(&mut [&mut x, &mut y]);
    x.send("hello", Some(channel.id.clone())).unwrap();
    settle(&mut [&mut x, &mut y]);

    let theirs = y.state().channel(&channel.id).expect("channel adopted");
    assert_eq!(theirs.messages.len(), 1);
    assert_eq!(theirs.messages[0].content, "hello");
    assert_eq!(y.state().user(&id("user-x")).unwrap().name, "Xavier");

    let events = drain(&mut y_events);
    assert!(events.contains(&SessionEvent::PeerConnected(id("user-x"))));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::MessageReceived(m) if m.content == "hello")));
}

#[tokio::test]
async fn test_video_toggle_places_and_ends_calls() {
    let net = MemoryNetwork::new();
    let (mut x, mut x_events, x_devices, mut y, _ye) = linked_pair(&net).await;
    drain(&mut x_events);

    x.toggle_video().await.unwrap();

    let transitions: Vec<CaptureState> = drain(&mut x_events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Media(MediaEvent::CaptureStateChanged {
                kind: TrackKind::Video,
                state,
            }) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(transitions, vec![CaptureState::Acquiring, CaptureState::Enabled]);
    assert_eq!(x_devices.live_tracks().len(), 1);

    settle(&mut [&mut x, &mut y]);
    assert!(y.media_state().remote_streams.contains_key(&id("user-x")));

    x.toggle_video().await.unwrap();
    assert_eq!(x.capture_state(TrackKind::Video), CaptureState::Disabled);
    assert!(x_devices.live_tracks().is_empty());

    settle(&mut [&mut x, &mut y]);
    assert!(y.media_state().remote_streams.is_empty());
    assert!(x.connected_peers().contains(&id("user-y")));
    assert!(y.connected_peers().contains(&id("user-x")));
}

#[tokio::test]
async fn test_denied_capture_is_recoverable() {
    let net = MemoryNetwork::new();
    let (mut x, mut x_events, x_devices, _y, _ye) = linked_pair(&net).await;
    x_devices.deny(TrackKind::Audio);
    drain(&mut x_events);

    let err = x.toggle_audio().await.unwrap_err();

    assert!(matches!(err, SessionError::Media(_)));
    assert_eq!(x.capture_state(TrackKind::Audio), CaptureState::Disabled);
    assert_eq!(notices(&drain(&mut x_events), NoticeLevel::Error).len(), 1);

    x_devices.allow(TrackKind::Audio);
    x.toggle_audio().await.unwrap();
    assert!(x.media_state().audio_enabled);
}

#[tokio::test]
async fn test_hung_capture_prompt_does_not_block_chat() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, x_devices, mut y, _ye) = linked_pair(&net).await;
    x_devices.hang(TrackKind::Video);

    let request = x.begin_toggle(TrackKind::Video).expect("capture requested");
    assert_eq!(x.capture_state(TrackKind::Video), CaptureState::Acquiring);

    x.send("still talking", None).unwrap();
    settle(&mut [&mut x, &mut y]);
    assert_eq!(y.state().messages().len(), 1);

    assert!(timeout(Duration::from_millis(20), request).await.is_err());
    assert_eq!(x.capture_state(TrackKind::Video), CaptureState::Disabled);

    x_devices.resume(TrackKind::Video);
    x.toggle_video().await.unwrap();
    assert!(x.media_state().video_enabled);
}

#[tokio::test]
async fn test_abandoned_toggle_can_be_retried() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, x_devices, _y, _ye) = linked_pair(&net).await;
    x_devices.hang(TrackKind::Audio);

    assert!(timeout(Duration::from_millis(20), x.toggle_audio()).await.is_err());
    assert_eq!(x.capture_state(TrackKind::Audio), CaptureState::Disabled);

    x_devices.resume(TrackKind::Audio);
    x.toggle_audio().await.unwrap();
    assert!(x.media_state().audio_enabled);
    assert_eq!(x_devices.acquisitions(), 2);
}

#[tokio::test]
async fn test_closed_connection_marks_peer_offline() {
    let net = MemoryNetwork::new();
    let (mut x, mut x_events, _xd, mut y, _ye) = linked_pair(&net).await;

    let channel = x
        .create_channel("lobby", ChannelKind::Text, Visibility::Shared, None)
        .unwrap()
        .unwrap();
    x.invite(id("user-y")).unwrap();
    settle(&mut [&mut x, &mut y]);
    y.send("from y", Some(channel.id.clone())).unwrap();
    y.update_typing(true);
    settle(&mut [&mut x, &mut y]);
    assert!(x.state().user(&id("user-y")).unwrap().is_typing);
    drain(&mut x_events);

    net.sever(&id("user-x"), &id("user-y"));
    settle(&mut [&mut x, &mut y]);

    let user = x.state().user(&id("user-y")).unwrap();
    assert_eq!(user.status, PresenceStatus::Offline);
    assert!(!user.is_typing);
    assert!(!x.connected_peers().contains(&id("user-y")));
    let lobby = x.state().channel(&channel.id).unwrap();
    assert!(lobby.members.contains(&id("user-y")));
    assert_eq!(lobby.messages.len(), 1);
    assert!(drain(&mut x_events).contains(&SessionEvent::PeerDisconnected(id("user-y"))));
}

#[tokio::test]
async fn test_identity_collision_then_regenerate() {
    let net = MemoryNetwork::new();
    let (_first, _fe, _fd) = open_node(&net, "user-dup", "First").await;
    let (mut second, mut events) = Session::new(
        SessionConfig::default(),
        id("user-dup"),
        "Second",
        net.transport(),
        ScriptedDevices::new(),
    );

    let err = second.open().await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::Transport(TransportError::IdCollision(_))
    ));
    assert_eq!(second.status(), ConnectionStatus::Disconnected);
    assert_eq!(notices(&drain(&mut events), NoticeLevel::Error).len(), 1);

    let fresh = second.regenerate_identity().unwrap();
    second.open().await.unwrap();
    assert!(net.is_registered(&fresh));
    assert_eq!(second.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_are_dropped() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd) = open_node(&net, "user-x", "Xavier").await;
    let mut newer = net.transport();
    let mut newer_events = newer.open(&id("user-newer")).await.unwrap();

    x.connect_to_peer(&id("user-newer")).unwrap();
    let link = match newer_events.recv().await {
        Some(TransportEvent::IncomingConnection(connection)) => connection,
        other => panic!("expected incoming connection, got {other:?}"),
    };

    link.send(br#"{"kind":"file-offer","payload":{"size":12}}"#.to_vec()).unwrap();
    link.send(b"garbage".to_vec()).unwrap();
    link.send_envelope(&Envelope::Message(meshchat_shared::Message::new(
        id("user-newer"),
        42,
        "still here",
        MessageKind::Text,
        None,
    )))
    .unwrap();
    x.process_pending();

    assert_eq!(x.state().messages().len(), 1);
    assert_eq!(x.state().messages()[0].content, "still here");
    assert!(x.connected_peers().contains(&id("user-newer")));
}

#[tokio::test]
async fn test_unreachable_peer_and_lost_rendezvous() {
    let net = MemoryNetwork::new();
    let (mut x, mut x_events, _xd) = open_node(&net, "user-x", "Xavier").await;
    drain(&mut x_events);

    x.connect_to_peer(&id("user-ghost")).unwrap();
    x.process_pending();
    assert!(x.connected_peers().is_empty());
    assert_eq!(notices(&drain(&mut x_events), NoticeLevel::Warning).len(), 1);

    net.drop_rendezvous();
    x.process_pending();
    assert_eq!(x.status(), ConnectionStatus::Disconnected);
    assert_eq!(notices(&drain(&mut x_events), NoticeLevel::Error).len(), 1);
}

#[tokio::test]
async fn test_disconnect_ends_calls_and_links() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, x_devices, mut y, _ye) = linked_pair(&net).await;
    x.toggle_audio().await.unwrap();
    settle(&mut [&mut x, &mut y]);

    x.disconnect();
    y.process_pending();

    assert!(x_devices.live_tracks().is_empty());
    assert_eq!(x.status(), ConnectionStatus::Disconnected);
    assert!(!net.is_registered(&id("user-x")));
    assert!(y.connected_peers().is_empty());
    assert!(y.media_state().remote_streams.is_empty());
    assert_eq!(
        y.state().user(&id("user-x")).unwrap().status,
        PresenceStatus::Offline
    );
}

#[tokio::test]
async fn test_typing_flags_reach_peers_once() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd, mut y, _ye) = linked_pair(&net).await;

    x.update_typing(true);
    x.update_typing(true);
    assert_eq!(y.process_pending(), 1);
    assert!(y.state().user(&id("user-x")).unwrap().is_typing);

    x.update_typing(false);
    settle(&mut [&mut x, &mut y]);
    assert!(!y.state().user(&id("user-x")).unwrap().is_typing);
}

#[tokio::test]
async fn test_typing_expires_after_quiet_period() {
    let net = MemoryNetwork::new();
    let (mut y, _ye, _yd) = open_node(&net, "user-y", "Yvonne").await;
    let config = SessionConfig {
        typing_timeout: Duration::from_millis(30),
        ..SessionConfig::default()
    };
    let (mut x, _xe) = Session::new(config, id("user-x"), "Xavier", net.transport(), ScriptedDevices::new());
    x.open().await.unwrap();
    x.connect_to_peer(&id("user-y")).unwrap();
    settle(&mut [&mut x, &mut y]);

    x.update_typing(true);
    y.process_pending();
    assert!(y.state().user(&id("user-x")).unwrap().is_typing);

    // Nothing queued, so the step wakes on the typing deadline.
    assert!(x.step().await.unwrap());
    assert!(!x.is_typing());
    y.process_pending();
    assert!(!y.state().user(&id("user-x")).unwrap().is_typing);
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let config = SessionConfig {
        persist: true,
        ..SessionConfig::default()
    };
    let net = MemoryNetwork::new();

    let channel_id = {
        let store = SnapshotStore::new(Box::new(FileStore::open_at(&path).unwrap()));
        let (session, _events) = Session::new(
            config.clone(),
            id("user-x"),
            "Xavier",
            net.transport(),
            ScriptedDevices::new(),
        );
        let mut session = session.with_snapshots(store).unwrap();
        session.open().await.unwrap();
        let channel = session
            .create_channel("notes", ChannelKind::Text, Visibility::Private, None)
            .unwrap()
            .unwrap();
        session.send("remember me", Some(channel.id.clone())).unwrap();
        session.disconnect();
        channel.id
    };

    let store = SnapshotStore::new(Box::new(FileStore::open_at(&path).unwrap()));
    let (restored, _events) = Session::new(
        config,
        id("user-x"),
        "Xavier",
        net.transport(),
        ScriptedDevices::new(),
    );
    let restored = restored.with_snapshots(store).unwrap();

    let channel = restored.state().channel(&channel_id).unwrap();
    assert_eq!(channel.messages[0].content, "remember me");
    assert!(restored
        .state()
        .users()
        .all(|u| u.status == PresenceStatus::Offline));
}

// ---------------------------------------------------------------------------
// Completion service
// ---------------------------------------------------------------------------

enum Reply {
    Text(&'static str),
    Chunks(Vec<Result<&'static str, CompletionError>>),
}

struct ScriptedBot {
    reply: Reply,
}

#[async_trait]
impl CompletionService for ScriptedBot {
    fn provider(&self) -> BotProvider {
        BotProvider::Claude
    }

    async fn complete(&self, _prompt: &str, _history: &[ChatTurn]) -> Result<Completion, CompletionError> {
        Ok(match &self.reply {
            Reply::Text(text) => Completion::Text(text.to_string()),
            Reply::Chunks(chunks) => Completion::Stream(
                stream::iter(
                    chunks
                        .iter()
                        .map(|c| c.clone().map(str::to_string))
                        .collect::<Vec<_>>(),
                )
                .boxed(),
            ),
        })
    }
}

#[tokio::test]
async fn test_bot_reply_is_broadcast() {
    let net = MemoryNetwork::new();
    let (mut x, _xe, _xd, mut y, _ye) = linked_pair(&net).await;
    let bot = ScriptedBot {
        reply: Reply::Chunks(vec![Ok("Hello "), Ok("there")]),
    };

    let trigger = x.send("@bot say hello", None).unwrap();
    let reply = x.invoke_bot(&bot, &trigger).await.unwrap().unwrap();
    settle(&mut [&mut x, &mut y]);

    assert_eq!(reply.sender_id.as_str(), "bot-claude");
    assert_eq!(reply.content, "Hello there");
    let seen: Vec<&str> = y.state().messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(seen, vec!["@bot say hello", "Hello there"]);
}

#[tokio::test]
async fn test_bot_stream_failure_injects_nothing() {
    let net = MemoryNetwork::new();
    let (mut x, mut x_events, _xd) = open_node(&net, "user-x", "Xavier").await;
    let bot = ScriptedBot {
        reply: Reply::Chunks(vec![Ok("partial"), Err(CompletionError::Stream("bad chunk".into()))]),
    };

    let trigger = x.send("@bot explain", None).unwrap();
    drain(&mut x_events);
    assert!(x.invoke_bot(&bot, &trigger).await.unwrap().is_none());

    assert_eq!(x.state().messages().len(), 1);
    assert_eq!(notices(&drain(&mut x_events), NoticeLevel::Error).len(), 1);
}

#[tokio::test]
async fn test_bot_empty_reply_and_plain_messages() {
    let net = MemoryNetwork::new();
    let (mut x, mut x_events, _xd) = open_node(&net, "user-x", "Xavier").await;
    let bot = ScriptedBot {
        reply: Reply::Text("   "),
    };

    let plain = x.send("no trigger here", None).unwrap();
    assert!(x.invoke_bot(&bot, &plain).await.unwrap().is_none());
    assert!(notices(&drain(&mut x_events), NoticeLevel::Info).is_empty());

    let trigger = x.send("@bot anything?", None).unwrap();
    assert!(x.invoke_bot(&bot, &trigger).await.unwrap().is_none());
    assert_eq!(notices(&drain(&mut x_events), NoticeLevel::Info).len(), 1);
    assert_eq!(x.state().messages().len(), 2);
}
