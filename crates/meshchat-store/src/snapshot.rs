//! Chat snapshot persistence.
//!
//! The snapshot is stored under `chatData`, and only while the
//! `useLocalStorage` flag is on. Export and import move the snapshot plus
//! the completion-service settings as one JSON document.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use meshchat_shared::ChatSnapshot;

use crate::error::{Result, StoreError};
use crate::kv::KeyValueStore;

pub const CHAT_DATA_KEY: &str = "chatData";
pub const PERSIST_FLAG_KEY: &str = "useLocalStorage";
pub const BOT_SETTINGS_KEY: &str = "botSettings";

/// Portable backup document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_settings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_data: Option<String>,
}

pub struct SnapshotStore {
    backend: Box<dyn KeyValueStore>,
}

impl SnapshotStore {
    pub fn new(backend: Box<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.backend.get(PERSIST_FLAG_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        info!(enabled, "Snapshot persistence toggled");
        self.backend.set(PERSIST_FLAG_KEY, enabled.to_string())
    }

    /// Save `snapshot` if persistence is enabled. Returns whether it was written.
    pub fn save(&mut self, snapshot: &ChatSnapshot) -> Result<bool> {
        if !self.is_enabled()? {
            return Ok(false);
        }
        self.backend.set(CHAT_DATA_KEY, serde_json::to_string(snapshot)?)?;
        debug!(
            users = snapshot.users.len(),
            messages = snapshot.messages.len(),
            channels = snapshot.channels.len(),
            "Snapshot saved"
        );
        Ok(true)
    }

    pub fn load(&self) -> Result<Option<ChatSnapshot>> {
        let Some(raw) = self.backend.get(CHAT_DATA_KEY)? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            key: CHAT_DATA_KEY.to_string(),
            source,
        })?;
        Ok(Some(snapshot))
    }

    /// Remove the saved snapshot and completion-service settings.
    pub fn clear(&mut self) -> Result<()> {
        warn!("Clearing stored chat data");
        self.backend.remove(BOT_SETTINGS_KEY)?;
        self.backend.remove(CHAT_DATA_KEY)
    }

    pub fn export(&self) -> Result<String> {
        let bundle = ExportBundle {
            bot_settings: self.backend.get(BOT_SETTINGS_KEY)?,
            chat_data: self.backend.get(CHAT_DATA_KEY)?,
        };
        Ok(serde_json::to_string_pretty(&bundle)?)
    }

    /// Restore a document produced by [`SnapshotStore::export`]. The chat
    /// data is validated before anything is written.
    pub fn import(&mut self, raw: &str) -> Result<()> {
        let bundle: ExportBundle = serde_json::from_str(raw)?;
        if let Some(ref chat_data) = bundle.chat_data {
            serde_json::from_str::<ChatSnapshot>(chat_data).map_err(|source| StoreError::Corrupt {
                key: CHAT_DATA_KEY.to_string(),
                source,
            })?;
        }

        if let Some(bot_settings) = bundle.bot_settings {
            self.backend.set(BOT_SETTINGS_KEY, bot_settings)?;
        }
        if let Some(chat_data) = bundle.chat_data {
            self.backend.set(CHAT_DATA_KEY, chat_data)?;
        }
        info!("Imported chat data");
        Ok(())
    }
}
