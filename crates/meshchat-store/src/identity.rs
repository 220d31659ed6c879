//! Persisted local identity (`userId` / `username`).

use tracing::{info, warn};

use meshchat_shared::identity::generate_peer_identity;
use meshchat_shared::PeerIdentity;

use crate::error::Result;
use crate::kv::KeyValueStore;

pub const USER_ID_KEY: &str = "userId";
pub const USERNAME_KEY: &str = "username";

pub struct IdentityStore {
    backend: Box<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(backend: Box<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// The stored identity, or a freshly generated (and stored) one when
    /// none is persisted or the stored value is unusable.
    pub fn load_or_generate(&mut self) -> Result<PeerIdentity> {
        if let Some(raw) = self.backend.get(USER_ID_KEY)? {
            match PeerIdentity::parse(&raw) {
                Ok(id) => return Ok(id),
                Err(e) => warn!(error = %e, "Discarding stored identity"),
            }
        }
        let id = generate_peer_identity();
        info!(peer = %id, "Generated new identity");
        self.save_identity(&id)?;
        Ok(id)
    }

    pub fn save_identity(&mut self, id: &PeerIdentity) -> Result<()> {
        self.backend.set(USER_ID_KEY, id.as_str().to_string())
    }

    pub fn username(&self) -> Result<Option<String>> {
        self.backend.get(USERNAME_KEY)
    }

    pub fn save_username(&mut self, name: &str) -> Result<()> {
        self.backend.set(USERNAME_KEY, name.to_string())
    }
}
