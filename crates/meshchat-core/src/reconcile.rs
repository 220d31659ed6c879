//! Planning functions for every chat mutation.
//!
//! Both entry points read an immutable [`ChatState`] and return the list of
//! [`Change`]s to apply. Local actions additionally return what must go on
//! the wire. Received envelopes produce a [`RemotePlan`], which has no
//! outbound part: a received event cannot be re-broadcast.

use tracing::{debug, warn};

use meshchat_shared::protocol::{ReactionAction, ReactionUpdate, ReadReceipt};
use meshchat_shared::{
    Channel, ChannelId, ChannelKind, Envelope, Message, MessageId, MessageKind, PeerIdentity,
    PresenceStatus, Server, ServerId, User, Visibility,
};

use crate::error::SessionError;
use crate::state::{Change, ChatState};

/// A mutation requested by the local user.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAction {
    Send {
        content: String,
        kind: MessageKind,
        channel: Option<ChannelId>,
    },
    CreateChannel {
        name: String,
        kind: ChannelKind,
        visibility: Visibility,
        description: Option<String>,
    },
    SelectChannel(ChannelId),
    SetVisibility {
        channel: ChannelId,
        visibility: Visibility,
    },
    Invite {
        channel: ChannelId,
        peer: PeerIdentity,
    },
    MarkRead(MessageId),
    React {
        message: MessageId,
        emoji: String,
        add: bool,
    },
    CreateServer {
        name: String,
        channels: Vec<ChannelId>,
    },
    AnnounceSelf {
        name: String,
    },
}

/// Where the envelope produced by a local action goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Fanout {
    None,
    Broadcast(Envelope),
    Unicast(PeerIdentity, Envelope),
}

/// What a local action created, handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    None,
    Message(Message),
    Channel(Channel),
    Server(Server),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalPlan {
    pub changes: Vec<Change>,
    pub fanout: Fanout,
    pub outcome: Outcome,
}

impl LocalPlan {
    fn noop() -> Self {
        Self {
            changes: Vec::new(),
            fanout: Fanout::None,
            outcome: Outcome::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemotePlan {
    pub changes: Vec<Change>,
}

/// Plan a local action taken at `now` (monotonic ms) by `self_id`.
pub fn plan_local(
    state: &ChatState,
    self_id: &PeerIdentity,
    now: i64,
    action: LocalAction,
) -> Result<LocalPlan, SessionError> {
    match action {
        LocalAction::Send {
            content,
            kind,
            channel,
        } => plan_send(state, self_id, now, content, kind, channel).map(|(plan, _)| plan),

        LocalAction::CreateChannel {
            name,
            kind,
            visibility,
            description,
        } => {
            let name = name.trim();
            if name.is_empty() {
                return Ok(LocalPlan::noop());
            }
            let mut channel = Channel::new(unused_channel_id(state, now), name, kind);
            channel.visibility = visibility;
            channel.description = description.filter(|d| !d.trim().is_empty());
            channel.members.insert(self_id.clone());

            let fanout = if channel.is_shared() {
                Fanout::Broadcast(Envelope::ChannelAnnounce(vec![channel.clone()]))
            } else {
                Fanout::None
            };
            Ok(LocalPlan {
                changes: vec![
                    Change::AddChannel(channel.clone()),
                    Change::SelectChannel(channel.id.clone()),
                ],
                fanout,
                outcome: Outcome::Channel(channel),
            })
        }

        LocalAction::SelectChannel(id) => {
            known_channel(state, &id)?;
            Ok(LocalPlan {
                changes: vec![Change::SelectChannel(id)],
                ..LocalPlan::noop()
            })
        }

        LocalAction::SetVisibility {
            channel,
            visibility,
        } => {
            let current = known_channel(state, &channel)?;
            if current.visibility == visibility {
                return Ok(LocalPlan::noop());
            }
            let mut updated = current.clone();
            updated.visibility = visibility;
            Ok(LocalPlan {
                changes: vec![Change::SetVisibility {
                    channel,
                    visibility,
                }],
                fanout: announce_if_shared(&updated),
                outcome: Outcome::Channel(updated),
            })
        }

        LocalAction::Invite { channel, peer } => {
            if &peer == self_id {
                return Err(SessionError::SelfInvite);
            }
            let current = known_channel(state, &channel)?;
            let mut updated = current.clone();
            let mut changes = Vec::new();
            if !current.is_shared() {
                updated.visibility = Visibility::Shared;
                changes.push(Change::SetVisibility {
                    channel: channel.clone(),
                    visibility: Visibility::Shared,
                });
            }
            if updated.members.insert(peer.clone()) {
                changes.push(Change::AddMember { channel, peer });
            }
            let fanout = if current.is_shared() {
                Fanout::None
            } else {
                announce_if_shared(&updated)
            };
            Ok(LocalPlan {
                changes,
                fanout,
                outcome: Outcome::Channel(updated),
            })
        }

        LocalAction::MarkRead(id) => {
            let message = state
                .message(&id)
                .ok_or_else(|| SessionError::UnknownMessage(id.clone()))?;
            if message.read {
                return Ok(LocalPlan::noop());
            }
            let fanout = if &message.sender_id == self_id {
                Fanout::None
            } else {
                Fanout::Unicast(
                    message.sender_id.clone(),
                    Envelope::ReadReceipt(ReadReceipt { message_id: id.clone() }),
                )
            };
            Ok(LocalPlan {
                changes: vec![Change::MarkRead(id)],
                fanout,
                outcome: Outcome::None,
            })
        }

        LocalAction::React {
            message,
            emoji,
            add,
        } => {
            let target = state
                .message(&message)
                .ok_or_else(|| SessionError::UnknownMessage(message.clone()))?;
            let private = target
                .channel_id
                .as_ref()
                .and_then(|id| state.channel(id))
                .is_some_and(|c| !c.is_shared());
            let update = ReactionUpdate {
                message_id: message.clone(),
                emoji: emoji.clone(),
                user_id: self_id.clone(),
                action: if add {
                    ReactionAction::Add
                } else {
                    ReactionAction::Remove
                },
            };
            Ok(LocalPlan {
                changes: vec![Change::React {
                    message,
                    emoji,
                    user: self_id.clone(),
                    add,
                }],
                fanout: if private {
                    Fanout::None
                } else {
                    Fanout::Broadcast(Envelope::Reaction(update))
                },
                outcome: Outcome::None,
            })
        }

        LocalAction::CreateServer { name, channels } => {
            let name = name.trim();
            if name.is_empty() {
                return Ok(LocalPlan::noop());
            }
            for id in &channels {
                known_channel(state, id)?;
            }
            let server = Server {
                id: unused_server_id(state, now),
                name: name.to_string(),
                icon: None,
                channel_ids: channels,
                members: [self_id.clone()].into_iter().collect(),
            };
            Ok(LocalPlan {
                changes: vec![Change::AddServer(server.clone())],
                fanout: Fanout::Broadcast(Envelope::RosterAnnounce(vec![server.clone()])),
                outcome: Outcome::Server(server),
            })
        }

        LocalAction::AnnounceSelf { name } => {
            let name = name.trim();
            if name.is_empty() {
                return Err(SessionError::EmptyName);
            }
            let mut user = state
                .user(self_id)
                .cloned()
                .unwrap_or_else(|| User::online(self_id.clone(), name));
            user.name = name.to_string();
            user.status = PresenceStatus::Online;
            user.is_typing = false;
            Ok(LocalPlan {
                changes: vec![Change::UpsertUser(user.clone())],
                fanout: Fanout::Broadcast(Envelope::IdentityAnnounce(user)),
                outcome: Outcome::None,
            })
        }
    }
}

/// Plan a message send and hand back the message itself. The encoded
/// envelope must fit in one frame, even when the message stays local.
pub fn plan_send(
    state: &ChatState,
    self_id: &PeerIdentity,
    now: i64,
    content: String,
    kind: MessageKind,
    channel: Option<ChannelId>,
) -> Result<(LocalPlan, Message), SessionError> {
    if content.trim().is_empty() {
        return Err(SessionError::EmptyContent);
    }
    let broadcast = match &channel {
        Some(id) => known_channel(state, id)?.is_shared(),
        None => true,
    };
    let message = Message::new(self_id.clone(), now, content, kind, channel);
    let envelope = Envelope::Message(message.clone());
    envelope.to_bytes()?;
    let plan = LocalPlan {
        changes: vec![Change::AppendMessage(message.clone())],
        fanout: if broadcast {
            Fanout::Broadcast(envelope)
        } else {
            Fanout::None
        },
        outcome: Outcome::Message(message.clone()),
    };
    Ok((plan, message))
}

/// Plan the effect of an envelope received from `from`.
pub fn plan_remote(state: &ChatState, from: &PeerIdentity, envelope: Envelope) -> RemotePlan {
    let changes = match envelope {
        Envelope::IdentityAnnounce(user) => {
            if &user.id != from {
                warn!(peer = %from, claimed = %user.id, "Identity announce for another peer, dropping");
                Vec::new()
            } else {
                vec![Change::UpsertUser(user)]
            }
        }

        Envelope::Message(message) => vec![Change::AppendMessage(message)],

        Envelope::TypingState(typing) => {
            if state.user(&typing.peer_id).is_none() {
                debug!(peer = %typing.peer_id, "Typing state for unknown user, ignoring");
                Vec::new()
            } else {
                vec![Change::SetTyping {
                    user: typing.peer_id,
                    is_typing: typing.is_typing,
                }]
            }
        }

        Envelope::ReadReceipt(receipt) => match state.message(&receipt.message_id) {
            Some(_) => vec![Change::MarkRead(receipt.message_id)],
            None => Vec::new(),
        },

        Envelope::ChannelAnnounce(channels) => {
            let mut adopted: Vec<ChannelId> = Vec::new();
            let mut changes = Vec::new();
            for channel in channels {
                if state.channel(&channel.id).is_some() || adopted.contains(&channel.id) {
                    continue;
                }
                debug!(channel = %channel.id, peer = %from, "Adopting announced channel");
                adopted.push(channel.id.clone());
                changes.push(Change::AddChannel(channel));
            }
            changes
        }

        Envelope::RosterAnnounce(servers) => {
            let mut adopted: Vec<ServerId> = Vec::new();
            let mut changes = Vec::new();
            for server in servers {
                if state.server(&server.id).is_some() || adopted.contains(&server.id) {
                    continue;
                }
                adopted.push(server.id.clone());
                changes.push(Change::AddServer(server));
            }
            changes
        }

        Envelope::Reaction(update) => match state.message(&update.message_id) {
            Some(_) => vec![Change::React {
                message: update.message_id,
                emoji: update.emoji,
                user: update.user_id,
                add: update.action == ReactionAction::Add,
            }],
            None => Vec::new(),
        },

        // Call control belongs to the media layer.
        Envelope::MediaOffer(_) | Envelope::MediaAnswer(_) | Envelope::MediaEnd(_) => Vec::new(),
    };

    RemotePlan { changes }
}

/// `channel-<now>`, or `channel-<now>-<n>` when a peer already took it.
fn unused_channel_id(state: &ChatState, now: i64) -> ChannelId {
    let base = ChannelId::from_timestamp(now);
    if state.channel(&base).is_none() {
        return base;
    }
    (1..)
        .map(|n| ChannelId(format!("{base}-{n}")))
        .find(|id| state.channel(id).is_none())
        .unwrap_or(base)
}

fn unused_server_id(state: &ChatState, now: i64) -> ServerId {
    let base = ServerId(format!("server-{now}"));
    if state.server(&base).is_none() {
        return base;
    }
    (1..)
        .map(|n| ServerId(format!("{base}-{n}")))
        .find(|id| state.server(id).is_none())
        .unwrap_or(base)
}

fn known_channel<'a>(state: &'a ChatState, id: &ChannelId) -> Result<&'a Channel, SessionError> {
    state
        .channel(id)
        .ok_or_else(|| SessionError::UnknownChannel(id.clone()))
}

fn announce_if_shared(channel: &Channel) -> Fanout {
    if channel.is_shared() {
        Fanout::Broadcast(Envelope::ChannelAnnounce(vec![channel.clone()]))
    } else {
        Fanout::None
    }
}
