use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constants::BOT_SENDER_PREFIX;
use crate::error::IdentityError;

// Peer identity = printable ASCII token registered with the rendezvous facility
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap an identifier that is already known to be valid (generated
    /// locally or received from the transport).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validate user input: non-empty, printable ASCII, no whitespace.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        if !trimmed.chars().all(|c| c.is_ascii_graphic()) {
            return Err(IdentityError::NotPrintable(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }

    /// Whether this identity belongs to a completion-service bot.
    pub fn is_bot(&self) -> bool {
        self.0.starts_with(BOT_SENDER_PREFIX)
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// `<sender>-<timestamp>`; unique as long as the sender's clock is
    /// strictly increasing.
    pub fn compose(sender: &PeerIdentity, timestamp: i64) -> Self {
        Self(format!("{sender}-{timestamp}"))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn from_timestamp(timestamp: i64) -> Self {
        Self(format!("channel-{timestamp}"))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Offline,
    Away,
    Dnd,
}

/// A participant as seen by the local node. Never deleted; a closed
/// connection only flips it to `Offline`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: PeerIdentity,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(default)]
    pub is_typing: bool,
}

impl User {
    pub fn online(id: PeerIdentity, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar: None,
            status: PresenceStatus::Online,
            is_typing: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
}

/// Emoji -> users who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<PeerIdentity>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Text, or an opaque payload reference (data URL) for media kinds.
    pub content: String,
    pub sender_id: PeerIdentity,
    /// Sender's wall clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: Reactions,
}

impl Message {
    pub fn new(
        sender_id: PeerIdentity,
        timestamp: i64,
        content: impl Into<String>,
        kind: MessageKind,
        channel_id: Option<ChannelId>,
    ) -> Self {
        Self {
            id: MessageId::compose(&sender_id, timestamp),
            content: content.into(),
            sender_id,
            timestamp,
            kind,
            read: false,
            channel_id,
            reactions: Reactions::new(),
        }
    }

    /// Add `user` to the emoji's reactor set, or remove it when `add` is false.
    /// Empty sets are dropped so the map stays canonical.
    pub fn set_reaction(&mut self, emoji: &str, user: &PeerIdentity, add: bool) {
        if add {
            self.reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(user.clone());
        } else if let Some(users) = self.reactions.get_mut(emoji) {
            users.remove(user);
            if users.is_empty() {
                self.reactions.remove(emoji);
            }
        }
    }

    fn order_key(&self) -> (i64, &MessageId) {
        (self.timestamp, &self.id)
    }
}

// ---------------------------------------------------------------------------
// Channels and servers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Only visible locally until a peer is invited.
    #[default]
    Private,
    /// Broadcast to every mesh member.
    Shared,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Text,
    Voice,
    Announcement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub members: BTreeSet<PeerIdentity>,
    /// Ordered by `(timestamp, id)`, never by arrival.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            visibility: Visibility::Private,
            kind,
            members: BTreeSet::new(),
            messages: Vec::new(),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.visibility == Visibility::Shared
    }

    /// Insert keeping timestamp order. Ties are broken by message id so the
    /// result does not depend on arrival order.
    pub fn insert_message(&mut self, message: Message) {
        let pos = self
            .messages
            .partition_point(|m| m.order_key() <= message.order_key());
        self.messages.insert(pos, message);
    }

    pub fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }
}

/// A community grouping of channels, advertised with `roster-announce`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub channel_ids: Vec<ChannelId>,
    #[serde(default)]
    pub members: BTreeSet<PeerIdentity>,
}

/// Full exported view of the chat state, handed to persistence and UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

/// Attachment of the local node to the rendezvous facility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}
