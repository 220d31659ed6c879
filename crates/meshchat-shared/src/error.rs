use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Peer identity is empty")]
    Empty,

    #[error("Peer identity must be printable ASCII without spaces: {0:?}")]
    NotPrintable(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid payload for kind {kind}: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
