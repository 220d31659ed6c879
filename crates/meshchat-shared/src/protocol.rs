//! Envelope codec for everything exchanged over a peer connection.
//!
//! On the wire an envelope is a JSON object `{"kind": "...", "payload": {...}}`.
//! Decoding is forward compatible: a kind this build does not know is
//! reported as [`Decoded::Unknown`] and dropped by the caller, never treated
//! as a fatal error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::CodecError;
use crate::types::{Channel, Message, MessageId, PeerIdentity, Server, User};

/// Wire names of every envelope kind.
pub mod kind {
    pub const IDENTITY_ANNOUNCE: &str = "identity-announce";
    pub const MESSAGE: &str = "message";
    pub const TYPING_STATE: &str = "typing-state";
    pub const READ_RECEIPT: &str = "read-receipt";
    pub const CHANNEL_ANNOUNCE: &str = "channel-announce";
    pub const ROSTER_ANNOUNCE: &str = "roster-announce";
    pub const REACTION: &str = "reaction";
    pub const MEDIA_OFFER: &str = "media-offer";
    pub const MEDIA_ANSWER: &str = "media-answer";
    pub const MEDIA_END: &str = "media-end";
}

/// All protocol messages exchanged between peers
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Sender's user record (name, presence)
    IdentityAnnounce(User),

    /// Chat message, optionally bound to a channel
    Message(Message),

    /// Typing indicator update
    TypingState(TypingState),

    /// Message was read by the recipient
    ReadReceipt(ReadReceipt),

    /// Channels the sender shares with the mesh
    ChannelAnnounce(Vec<Channel>),

    /// Server groupings the sender knows about
    RosterAnnounce(Vec<Server>),

    /// Emoji reaction added or removed
    Reaction(ReactionUpdate),

    /// Call control, opaque here and interpreted by the media layer
    MediaOffer(MediaSignal),
    MediaAnswer(MediaSignal),
    MediaEnd(MediaSignal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub peer_id: PeerIdentity,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: PeerIdentity,
    pub action: ReactionAction,
}

/// Call-control payload. `body` belongs to the media layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSignal {
    pub call_id: String,
    #[serde(default)]
    pub body: Value,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Envelope(Envelope),
    /// A kind this node does not understand (newer peer); safe to ignore.
    Unknown(String),
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::IdentityAnnounce(_) => kind::IDENTITY_ANNOUNCE,
            Envelope::Message(_) => kind::MESSAGE,
            Envelope::TypingState(_) => kind::TYPING_STATE,
            Envelope::ReadReceipt(_) => kind::READ_RECEIPT,
            Envelope::ChannelAnnounce(_) => kind::CHANNEL_ANNOUNCE,
            Envelope::RosterAnnounce(_) => kind::ROSTER_ANNOUNCE,
            Envelope::Reaction(_) => kind::REACTION,
            Envelope::MediaOffer(_) => kind::MEDIA_OFFER,
            Envelope::MediaAnswer(_) => kind::MEDIA_ANSWER,
            Envelope::MediaEnd(_) => kind::MEDIA_END,
        }
    }

    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            Envelope::IdentityAnnounce(user) => serde_json::to_value(user)?,
            Envelope::Message(message) => serde_json::to_value(message)?,
            Envelope::TypingState(typing) => serde_json::to_value(typing)?,
            Envelope::ReadReceipt(receipt) => serde_json::to_value(receipt)?,
            Envelope::ChannelAnnounce(channels) => serde_json::to_value(channels)?,
            Envelope::RosterAnnounce(servers) => serde_json::to_value(servers)?,
            Envelope::Reaction(reaction) => serde_json::to_value(reaction)?,
            Envelope::MediaOffer(signal)
            | Envelope::MediaAnswer(signal)
            | Envelope::MediaEnd(signal) => serde_json::to_value(signal)?,
        };

        let bytes = serde_json::to_vec(&RawEnvelope {
            kind: self.kind().to_string(),
            payload,
        })?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize from the JSON wire format
    pub fn decode(data: &[u8]) -> Result<Decoded, CodecError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let RawEnvelope {
            kind: name,
            payload,
        } = serde_json::from_slice(data)?;

        let envelope = match name.as_str() {
            kind::IDENTITY_ANNOUNCE => Envelope::IdentityAnnounce(parse(&name, payload)?),
            kind::MESSAGE => Envelope::Message(parse(&name, payload)?),
            kind::TYPING_STATE => Envelope::TypingState(parse(&name, payload)?),
            kind::READ_RECEIPT => Envelope::ReadReceipt(parse(&name, payload)?),
            kind::CHANNEL_ANNOUNCE => Envelope::ChannelAnnounce(parse(&name, payload)?),
            kind::ROSTER_ANNOUNCE => Envelope::RosterAnnounce(parse(&name, payload)?),
            kind::REACTION => Envelope::Reaction(parse(&name, payload)?),
            kind::MEDIA_OFFER => Envelope::MediaOffer(parse(&name, payload)?),
            kind::MEDIA_ANSWER => Envelope::MediaAnswer(parse(&name, payload)?),
            kind::MEDIA_END => Envelope::MediaEnd(parse(&name, payload)?),
            _ => {
                debug!(kind = %name, "Unknown envelope kind");
                return Ok(Decoded::Unknown(name));
            }
        };

        Ok(Decoded::Envelope(envelope))
    }
}

fn parse<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, CodecError> {
    serde_json::from_value(payload).map_err(|source| CodecError::Payload {
        kind: kind.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, MessageKind};

    fn sample_message() -> Message {
        let mut message = Message::new(
            PeerIdentity::new("user-abc"),
            1_700_000_000_123,
            "hello",
            MessageKind::Text,
            Some(ChannelId("channel-1".into())),
        );
        message.set_reaction("🎉", &PeerIdentity::new("user-def"), true);
        message
    }

    #[test]
    fn test_message_roundtrip() {
        let message = sample_message();
        let bytes = Envelope::Message(message.clone()).to_bytes().unwrap();

        match Envelope::decode(&bytes).unwrap() {
            Decoded::Envelope(Envelope::Message(restored)) => assert_eq!(restored, message),
            other => panic!("Envelope type mismatch: {other:?}"),
        }
    }

    #[test]
    fn test_read_flag_defaults_to_false() {
        let raw = br#"{"kind":"message","payload":{"id":"u-1","content":"hi","senderId":"u","timestamp":1}}"#;
        match Envelope::decode(raw).unwrap() {
            Decoded::Envelope(Envelope::Message(m)) => {
                assert!(!m.read);
                assert_eq!(m.kind, MessageKind::Text);
                assert!(m.channel_id.is_none());
            }
            other => panic!("Envelope type mismatch: {other:?}"),
        }
    }

    #[test]
    fn test_wire_shape() {
        let envelope = Envelope::TypingState(TypingState {
            peer_id: PeerIdentity::new("user-abc"),
            is_typing: true,
        });
        let json: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "typing-state");
        assert_eq!(json["payload"]["peerId"], "user-abc");
        assert_eq!(json["payload"]["isTyping"], true);
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        let raw = br#"{"kind":"file-offer","payload":{"size":12}}"#;
        assert_eq!(
            Envelope::decode(raw).unwrap(),
            Decoded::Unknown("file-offer".to_string())
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"kind":"read-receipt","payload":{"wrong":1}}"#),
            Err(CodecError::Payload { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Envelope::decode(&big),
            Err(CodecError::TooLarge { .. })
        ));
    }
}
