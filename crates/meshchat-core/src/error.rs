use thiserror::Error;

use meshchat_media::MediaError;
use meshchat_net::TransportError;
use meshchat_shared::{ChannelId, CodecError, IdentityError, MessageId};
use meshchat_store::StoreError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Name is empty")]
    EmptyName,

    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("No channel selected")]
    NoChannelSelected,

    #[error("Cannot invite ourselves")]
    SelfInvite,

    #[error("Session is not open")]
    NotOpen,

    #[error("Session is already open")]
    AlreadyOpen,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Request(String),

    #[error("Malformed stream chunk: {0}")]
    Stream(String),
}
