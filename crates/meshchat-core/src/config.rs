//! Session configuration loaded from environment variables.
//!
//! All settings have defaults so a session can start with zero
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use meshchat_net::SwarmConfig;
use meshchat_shared::constants::{DEFAULT_BOT_HISTORY, DEFAULT_QUIC_PORT, TYPING_TIMEOUT_MS};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// File listing rendezvous multiaddrs.
    /// Env: `MESHCHAT_BOOTSTRAP_PEERS`
    /// Default: none (identity is not discoverable)
    pub bootstrap_peers_path: Option<PathBuf>,

    /// QUIC listen port.
    /// Env: `MESHCHAT_LISTEN_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// Quiet interval after which the local typing indicator expires.
    /// Env: `MESHCHAT_TYPING_TIMEOUT_MS`
    /// Default: `3000`
    pub typing_timeout: Duration,

    /// Messages of history handed to the completion service.
    /// Env: `MESHCHAT_BOT_HISTORY`
    /// Default: `10`
    pub bot_history: usize,

    /// Save a snapshot after every mutation batch.
    /// Env: `MESHCHAT_PERSIST` (true/false)
    /// Default: `false`
    pub persist: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            listen_port: DEFAULT_QUIC_PORT,
            typing_timeout: Duration::from_millis(TYPING_TIMEOUT_MS),
            bot_history: DEFAULT_BOT_HISTORY,
            persist: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("MESHCHAT_BOOTSTRAP_PEERS") {
            if !path.is_empty() {
                config.bootstrap_peers_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("MESHCHAT_LISTEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid MESHCHAT_LISTEN_PORT, using default"),
            }
        }

        if let Some(val) = lookup("MESHCHAT_TYPING_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.typing_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid MESHCHAT_TYPING_TIMEOUT_MS, using default"),
            }
        }

        if let Some(val) = lookup("MESHCHAT_BOT_HISTORY") {
            if let Ok(n) = val.parse::<usize>() {
                config.bot_history = n;
            }
        }

        if let Some(val) = lookup("MESHCHAT_PERSIST") {
            config.persist = val == "true" || val == "1";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Settings for [`meshchat_net::SwarmTransport`].
    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            bootstrap_peers_path: self.bootstrap_peers_path.clone(),
            bootstrap_peers: Vec::new(),
            listen_port: self.listen_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::from_lookup(lookup(&[]));
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.typing_timeout, Duration::from_millis(3000));
        assert_eq!(config.bot_history, 10);
        assert!(!config.persist);
        assert!(config.bootstrap_peers_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("MESHCHAT_BOOTSTRAP_PEERS", "/etc/meshchat/peers.txt"),
            ("MESHCHAT_LISTEN_PORT", "5001"),
            ("MESHCHAT_TYPING_TIMEOUT_MS", "1500"),
            ("MESHCHAT_BOT_HISTORY", "4"),
            ("MESHCHAT_PERSIST", "true"),
        ]));
        assert_eq!(config.listen_port, 5001);
        assert_eq!(config.typing_timeout, Duration::from_millis(1500));
        assert_eq!(config.bot_history, 4);
        assert!(config.persist);
        assert_eq!(
            config.swarm_config().bootstrap_peers_path,
            Some(PathBuf::from("/etc/meshchat/peers.txt"))
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("MESHCHAT_LISTEN_PORT", "not-a-port"),
            ("MESHCHAT_TYPING_TIMEOUT_MS", "0"),
        ]));
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.typing_timeout, Duration::from_millis(3000));
    }
}
