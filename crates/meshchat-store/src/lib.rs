//! # meshchat-store
//!
//! Local persistence for a meshchat session: a string key-value boundary
//! (in memory or a JSON file in the platform data directory), the chat
//! snapshot saved after every mutation batch, and the local identity.

pub mod identity;
pub mod kv;
pub mod snapshot;

mod error;

pub use error::StoreError;
pub use identity::IdentityStore;
pub use kv::{FileStore, KeyValueStore, MemoryStore};
pub use snapshot::{ExportBundle, SnapshotStore};
