//! Rendezvous node addresses and identity keys.
//!
//! Bootstrap nodes are listed one multiaddr per line; they double as the
//! DHT entry points and the relays peers reserve circuits on.

use std::fs;
use std::path::Path;

use libp2p::kad::RecordKey;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, info, warn};

use meshchat_shared::constants::INBOX_TOPIC_PREFIX;
use meshchat_shared::PeerIdentity;

/// Load rendezvous multiaddrs from `path`. Blank lines and `#` comments
/// are ignored, malformed lines are logged and skipped, and a missing
/// file yields an empty list.
///
/// ```text
/// # meshchat rendezvous nodes
/// /ip4/198.51.100.10/udp/4001/quic-v1/p2p/12D3KooW...
/// ```
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read bootstrap peers file");
            return Vec::new();
        }
    };

    let addrs = parse_multiaddrs(content.lines());
    info!(count = addrs.len(), path = %path.display(), "Loaded bootstrap peers");
    addrs
}

pub fn parse_multiaddrs<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Multiaddr> {
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Loaded bootstrap peer");
                Some(addr)
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

/// Extract the trailing `PeerId` of a multiaddr, if one is present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// `<relay>/p2p-circuit/p2p/<target>`: dial `target` through a relay.
/// `relay` must already end in `/p2p/<relay-id>`.
pub fn relayed_addr(relay: &Multiaddr, target: PeerId) -> Multiaddr {
    relay
        .clone()
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(target))
}

/// `<relay>/p2p-circuit`: listen address that requests a reservation.
pub fn circuit_listen_addr(relay: &Multiaddr) -> Multiaddr {
    relay.clone().with(Protocol::P2pCircuit)
}

/// DHT key under which `id` is registered.
pub fn rendezvous_key(id: &PeerIdentity) -> RecordKey {
    RecordKey::new(&format!("meshchat/id/{id}"))
}

/// GossipSub topic every node subscribes to for its own inbound frames.
pub fn inbox_topic(id: &PeerIdentity) -> String {
    format!("{INBOX_TOPIC_PREFIX}{id}")
}

/// Inverse of [`inbox_topic`].
pub fn identity_from_topic(topic: &str) -> Option<PeerIdentity> {
    topic
        .strip_prefix(INBOX_TOPIC_PREFIX)
        .and_then(|raw| PeerIdentity::parse(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_nonexistent_file() {
        let peers = load_bootstrap_peers(Path::new("/nonexistent/bootstrap.txt"));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("peers.txt");

        let mut f = fs::File::create(&file_path).unwrap();
        writeln!(f, "# rendezvous nodes").unwrap();
        writeln!(f, "/ip4/127.0.0.1/udp/4001/quic-v1").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "invalid-addr").unwrap();
        writeln!(f, "/ip4/127.0.0.2/udp/4001/quic-v1").unwrap();
        drop(f);

        assert_eq!(load_bootstrap_peers(&file_path).len(), 2);
    }

    #[test]
    fn test_extract_peer_id() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/udp/4001/quic-v1/p2p/{peer}")
            .parse()
            .unwrap();
        assert_eq!(extract_peer_id(&addr), Some(peer));

        let bare: Multiaddr = "/ip4/10.0.0.1/udp/4001/quic-v1".parse().unwrap();
        assert_eq!(extract_peer_id(&bare), None);
    }

    #[test]
    fn test_relayed_addr_shape() {
        let relay_id = PeerId::random();
        let target = PeerId::random();
        let relay: Multiaddr = format!("/ip4/10.0.0.1/udp/4001/quic-v1/p2p/{relay_id}")
            .parse()
            .unwrap();

        let addr = relayed_addr(&relay, target);
        assert_eq!(extract_peer_id(&addr), Some(relay_id));
        assert!(addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)));
        assert!(matches!(addr.iter().last(), Some(Protocol::P2p(p)) if p == target));
    }

    #[test]
    fn test_inbox_topic_roundtrip() {
        let id = PeerIdentity::new("user-x1Y2");
        let topic = inbox_topic(&id);
        assert_eq!(topic, "meshchat/inbox/user-x1Y2");
        assert_eq!(identity_from_topic(&topic), Some(id));
        assert_eq!(identity_from_topic("other/topic"), None);
    }
}
