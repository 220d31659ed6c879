//! # meshchat-shared
//!
//! Data model, envelope codec and identity helpers shared by every
//! meshchat crate.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CodecError, IdentityError};
pub use protocol::{Decoded, Envelope};
pub use types::*;
