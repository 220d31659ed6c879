/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/meshchat/1.0.0";

/// Kademlia protocol name used by the rendezvous DHT
pub const KAD_PROTOCOL: &str = "/meshchat/kad/1.0.0";

/// Application name
pub const APP_NAME: &str = "meshchat";

/// Literal prefix of locally generated peer identities
pub const PEER_ID_PREFIX: &str = "user-";

/// Length of the random code appended to the prefix (before stripping)
pub const PEER_ID_CODE_LEN: usize = 8;

/// Reserved sender prefix for completion-service bots
pub const BOT_SENDER_PREFIX: &str = "bot-";

/// Trigger token that routes a message to the completion service
pub const BOT_TRIGGER: &str = "@bot";

/// Number of past messages handed to the completion service
pub const DEFAULT_BOT_HISTORY: usize = 10;

/// Quiet interval after which a typing indicator expires
pub const TYPING_TIMEOUT_MS: u64 = 3000;

/// Maximum envelope size in bytes (4 MiB, image payloads travel inline)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Prefix of the per-identity GossipSub inbox topic
pub const INBOX_TOPIC_PREFIX: &str = "meshchat/inbox/";

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Rendezvous provider records expire after this many seconds
pub const RENDEZVOUS_RECORD_TTL_SECS: u64 = 300;

/// Time allowed for the rendezvous registration to complete
pub const OPEN_TIMEOUT_SECS: u64 = 15;
