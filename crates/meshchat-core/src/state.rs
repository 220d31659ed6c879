//! The session's view of the chat: users, the flat message log, channels
//! and servers.
//!
//! State is only mutated through [`ChatState::apply`], which takes the
//! change list produced by the planning functions in [`crate::reconcile`].
//! Applying never fails; anything that could be rejected was rejected
//! while planning.

use std::collections::BTreeMap;

use meshchat_shared::{
    Channel, ChannelId, ChatSnapshot, Message, MessageId, PeerIdentity, PresenceStatus, Server,
    ServerId, User, Visibility,
};

/// One atomic edit of [`ChatState`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert or refresh a user. The typing flag of a known user is kept.
    UpsertUser(User),
    SetTyping {
        user: PeerIdentity,
        is_typing: bool,
    },
    /// Connection gone: offline and no longer typing.
    MarkOffline(PeerIdentity),
    /// Append to the log and, when the channel is known, to the channel.
    AppendMessage(Message),
    MarkRead(MessageId),
    React {
        message: MessageId,
        emoji: String,
        user: PeerIdentity,
        add: bool,
    },
    /// Ignored when the id is already known.
    AddChannel(Channel),
    SelectChannel(ChannelId),
    SetVisibility {
        channel: ChannelId,
        visibility: Visibility,
    },
    AddMember {
        channel: ChannelId,
        peer: PeerIdentity,
    },
    /// Ignored when the id is already known.
    AddServer(Server),
}

#[derive(Debug, Clone, Default)]
pub struct ChatState {
    users: BTreeMap<PeerIdentity, User>,
    messages: Vec<Message>,
    channels: Vec<Channel>,
    servers: Vec<Server>,
    current_channel: Option<ChannelId>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot. Nobody is connected yet, so every
    /// user starts offline and not typing.
    pub fn from_snapshot(snapshot: ChatSnapshot) -> Self {
        let users = snapshot
            .users
            .into_iter()
            .map(|mut user| {
                user.status = PresenceStatus::Offline;
                user.is_typing = false;
                (user.id.clone(), user)
            })
            .collect();

        let channels = snapshot.channels.into_iter().map(sorted).collect();

        Self {
            users,
            messages: snapshot.messages,
            channels,
            servers: snapshot.servers,
            current_channel: None,
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            users: self.users.values().cloned().collect(),
            messages: self.messages.clone(),
            channels: self.channels.clone(),
            servers: self.servers.clone(),
        }
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user(&self, id: &PeerIdentity) -> Option<&User> {
        self.users.get(id)
    }

    /// Flat log in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// A message from the log, or from a channel copy when the log does not
    /// hold it (seeded channels may carry history the log lost).
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id).or_else(|| {
            self.channels
                .iter()
                .flat_map(|c| c.messages.iter())
                .find(|m| &m.id == id)
        })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.id == id)
    }

    pub fn shared_channels(&self) -> Vec<Channel> {
        self.channels.iter().filter(|c| c.is_shared()).cloned().collect()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, id: &ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| &s.id == id)
    }

    pub fn current_channel(&self) -> Option<&ChannelId> {
        self.current_channel.as_ref()
    }

    pub fn apply(&mut self, changes: Vec<Change>) {
        for change in changes {
            self.apply_one(change);
        }
    }

    fn apply_one(&mut self, change: Change) {
        match change {
            Change::UpsertUser(user) => match self.users.get_mut(&user.id) {
                Some(existing) => {
                    existing.name = user.name;
                    existing.avatar = user.avatar;
                    existing.status = user.status;
                }
                None => {
                    let user = User {
                        is_typing: false,
                        ..user
                    };
                    self.users.insert(user.id.clone(), user);
                }
            },
            Change::SetTyping { user, is_typing } => {
                if let Some(existing) = self.users.get_mut(&user) {
                    existing.is_typing = is_typing;
                }
            }
            Change::MarkOffline(peer) => {
                if let Some(existing) = self.users.get_mut(&peer) {
                    existing.status = PresenceStatus::Offline;
                    existing.is_typing = false;
                }
            }
            Change::AppendMessage(message) => {
                if let Some(channel) = message
                    .channel_id
                    .as_ref()
                    .and_then(|id| self.channels.iter_mut().find(|c| &c.id == id))
                {
                    channel.insert_message(message.clone());
                }
                self.messages.push(message);
            }
            Change::MarkRead(id) => self.for_each_copy(&id, |m| m.read = true),
            Change::React {
                message,
                emoji,
                user,
                add,
            } => self.for_each_copy(&message, |m| m.set_reaction(&emoji, &user, add)),
            Change::AddChannel(channel) => {
                if self.channel(&channel.id).is_none() {
                    self.channels.push(sorted(channel));
                }
            }
            Change::SelectChannel(id) => {
                if self.channel(&id).is_some() {
                    self.current_channel = Some(id);
                }
            }
            Change::SetVisibility {
                channel,
                visibility,
            } => {
                if let Some(c) = self.channels.iter_mut().find(|c| c.id == channel) {
                    c.visibility = visibility;
                }
            }
            Change::AddMember { channel, peer } => {
                if let Some(c) = self.channels.iter_mut().find(|c| c.id == channel) {
                    c.members.insert(peer);
                }
            }
            Change::AddServer(server) => {
                if self.server(&server.id).is_none() {
                    self.servers.push(server);
                }
            }
        }
    }

    /// Run `edit` on the log entry and on every channel copy of a message.
    fn for_each_copy(&mut self, id: &MessageId, mut edit: impl FnMut(&mut Message)) {
        for message in self.messages.iter_mut().filter(|m| &m.id == id) {
            edit(message);
        }
        for channel in &mut self.channels {
            if let Some(message) = channel.message_mut(id) {
                edit(message);
            }
        }
    }
}

fn sorted(mut channel: Channel) -> Channel {
    channel
        .messages
        .sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    channel
}
