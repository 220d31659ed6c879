//! In-process rendezvous hub.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryNetwork`] can
//! dial every other one by identity. Frames are delivered synchronously
//! into the receiver's event queue, so per-link ordering holds trivially.
//! The hub also exposes fault injection (severed links, lost rendezvous)
//! for exercising the session's error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use meshchat_shared::PeerIdentity;

use crate::transport::{
    Connection, Link, Transport, TransportError, TransportEvent, TransportEvents,
    EVENT_QUEUE_DEPTH,
};

struct Node {
    events: mpsc::Sender<TransportEvent>,
    /// Dialable through the rendezvous. Cleared when the rendezvous drops.
    registered: bool,
}

struct LinkShared {
    a: PeerIdentity,
    b: PeerIdentity,
    open: AtomicBool,
}

impl LinkShared {
    fn joins(&self, x: &PeerIdentity, y: &PeerIdentity) -> bool {
        (&self.a == x && &self.b == y) || (&self.a == y && &self.b == x)
    }

    fn touches(&self, id: &PeerIdentity) -> bool {
        &self.a == id || &self.b == id
    }
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerIdentity, Node>,
    links: Vec<Arc<LinkShared>>,
    rendezvous_down: bool,
}

impl Hub {
    fn deliver(&self, to: &PeerIdentity, event: TransportEvent) -> bool {
        let Some(node) = self.nodes.get(to) else {
            return false;
        };
        match node.events.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %to, error = %e, "Dropping event for saturated node");
                false
            }
        }
    }

    fn close_link(&mut self, link: &Arc<LinkShared>) {
        if link.open.swap(false, Ordering::SeqCst) {
            self.links.retain(|l| !Arc::ptr_eq(l, link));
            self.deliver(&link.a, TransportEvent::ConnectionClosed { peer: link.b.clone() });
            self.deliver(&link.b, TransportEvent::ConnectionClosed { peer: link.a.clone() });
            debug!(a = %link.a, b = %link.b, "Memory link closed");
        }
    }
}

/// Shared rendezvous hub. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unopened transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(&self.hub),
            local: None,
        }
    }

    pub fn is_registered(&self, id: &PeerIdentity) -> bool {
        lock(&self.hub)
            .nodes
            .get(id)
            .is_some_and(|node| node.registered)
    }

    /// Number of currently open links.
    pub fn link_count(&self) -> usize {
        lock(&self.hub).links.len()
    }

    /// Simulate the rendezvous facility going away. Registered nodes get
    /// [`TransportEvent::Disconnected`] and new registrations fail until
    /// [`MemoryNetwork::restore_rendezvous`]. Existing links keep working.
    pub fn drop_rendezvous(&self) {
        let mut hub = lock(&self.hub);
        hub.rendezvous_down = true;
        let ids: Vec<PeerIdentity> = hub.nodes.keys().cloned().collect();
        for id in ids {
            if let Some(node) = hub.nodes.get_mut(&id) {
                node.registered = false;
            }
            hub.deliver(&id, TransportEvent::Disconnected);
        }
        info!("Memory rendezvous dropped");
    }

    pub fn restore_rendezvous(&self) {
        lock(&self.hub).rendezvous_down = false;
    }

    /// Close every link between `a` and `b`, notifying both ends.
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) {
        let mut hub = lock(&self.hub);
        let doomed: Vec<Arc<LinkShared>> = hub
            .links
            .iter()
            .filter(|link| link.joins(a, b))
            .cloned()
            .collect();
        for link in doomed {
            hub.close_link(&link);
        }
    }

    /// Report a link failure to `at`, as a backend would for a reset link.
    pub fn inject_error(&self, at: &PeerIdentity, peer: &PeerIdentity, reason: &str) {
        lock(&self.hub).deliver(
            at,
            TransportEvent::ConnectionError {
                peer: peer.clone(),
                reason: reason.to_string(),
            },
        );
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MemoryLink {
    hub: Arc<Mutex<Hub>>,
    shared: Arc<LinkShared>,
    local: PeerIdentity,
    remote: PeerIdentity,
}

impl Link for MemoryLink {
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let hub = lock(&self.hub);
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed(self.remote.clone()));
        }
        let delivered = hub.deliver(
            &self.remote,
            TransportEvent::Data {
                peer: self.local.clone(),
                data,
            },
        );
        if delivered {
            Ok(())
        } else {
            Err(TransportError::PeerUnavailable(self.remote.clone()))
        }
    }

    fn close(&self) {
        lock(&self.hub).close_link(&self.shared);
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
    local: Option<PeerIdentity>,
}

impl MemoryTransport {
    fn connection(&self, shared: &Arc<LinkShared>, local: &PeerIdentity, remote: &PeerIdentity) -> Connection {
        let link = MemoryLink {
            hub: Arc::clone(&self.hub),
            shared: Arc::clone(shared),
            local: local.clone(),
            remote: remote.clone(),
        };
        Connection::new(remote.clone(), Arc::new(link))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, local_id: &PeerIdentity) -> Result<TransportEvents, TransportError> {
        let mut hub = lock(&self.hub);
        if hub.rendezvous_down {
            return Err(TransportError::Network("rendezvous unreachable".into()));
        }
        if hub.nodes.get(local_id).is_some_and(|node| node.registered) {
            return Err(TransportError::IdCollision(local_id.clone()));
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        hub.nodes.insert(
            local_id.clone(),
            Node {
                events: tx,
                registered: true,
            },
        );
        drop(hub);

        self.local = Some(local_id.clone());
        info!(peer = %local_id, "Registered with memory rendezvous");
        Ok(rx)
    }

    fn connect(&mut self, remote: &PeerIdentity) -> Result<Connection, TransportError> {
        let local = self.local.clone().ok_or(TransportError::NotOpen)?;
        if &local == remote {
            return Err(TransportError::SelfDial);
        }

        let mut hub = lock(&self.hub);
        match hub.nodes.get(&local) {
            None => return Err(TransportError::NotOpen),
            Some(node) if !node.registered => {
                return Err(TransportError::Network("lost rendezvous registration".into()))
            }
            Some(_) => {}
        }

        let reachable = hub.nodes.get(remote).is_some_and(|node| node.registered);
        let shared = Arc::new(LinkShared {
            a: local.clone(),
            b: remote.clone(),
            open: AtomicBool::new(reachable),
        });

        if !reachable {
            debug!(peer = %remote, "Dial target not registered");
            hub.deliver(
                &local,
                TransportEvent::ConnectionError {
                    peer: remote.clone(),
                    reason: "peer unavailable".into(),
                },
            );
            return Ok(self.connection(&shared, &local, remote));
        }

        hub.links.push(Arc::clone(&shared));
        let theirs = self.connection(&shared, remote, &local);
        hub.deliver(remote, TransportEvent::IncomingConnection(theirs));
        hub.deliver(remote, TransportEvent::ConnectionOpen { peer: local.clone() });
        hub.deliver(&local, TransportEvent::ConnectionOpen { peer: remote.clone() });
        debug!(from = %local, to = %remote, "Memory link opened");

        Ok(self.connection(&shared, &local, remote))
    }

    fn shutdown(&mut self) {
        let Some(local) = self.local.take() else {
            return;
        };
        let mut hub = lock(&self.hub);
        hub.nodes.remove(&local);
        let doomed: Vec<Arc<LinkShared>> = hub
            .links
            .iter()
            .filter(|link| link.touches(&local))
            .cloned()
            .collect();
        for link in doomed {
            hub.close_link(&link);
        }
        info!(peer = %local, "Left memory rendezvous");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerIdentity {
        PeerIdentity::new(s)
    }

    #[tokio::test]
    async fn test_identity_collision() {
        let net = MemoryNetwork::new();
        let mut first = net.transport();
        let mut second = net.transport();

        first.open(&id("user-a")).await.unwrap();
        let err = second.open(&id("user-a")).await.unwrap_err();
        assert!(matches!(err, TransportError::IdCollision(_)));

        first.shutdown();
        assert!(second.open(&id("user-a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_opens_both_sides_and_preserves_order() {
        let net = MemoryNetwork::new();
        let mut a = net.transport();
        let mut b = net.transport();
        let mut a_rx = a.open(&id("user-a")).await.unwrap();
        let mut b_rx = b.open(&id("user-b")).await.unwrap();

        let conn = a.connect(&id("user-b")).unwrap();
        assert!(conn.is_open());

        let incoming = match b_rx.try_recv().unwrap() {
            TransportEvent::IncomingConnection(c) => c,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(incoming.peer(), &id("user-a"));
        assert!(matches!(
            b_rx.try_recv().unwrap(),
            TransportEvent::ConnectionOpen { peer } if peer == id("user-a")
        ));
        assert!(matches!(
            a_rx.try_recv().unwrap(),
            TransportEvent::ConnectionOpen { peer } if peer == id("user-b")
        ));

        for i in 0u8..5 {
            conn.send(vec![i]).unwrap();
        }
        for i in 0u8..5 {
            match b_rx.try_recv().unwrap() {
                TransportEvent::Data { peer, data } => {
                    assert_eq!(peer, id("user-a"));
                    assert_eq!(data, vec![i]);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        incoming.send(b"pong".to_vec()).unwrap();
        assert!(matches!(a_rx.try_recv().unwrap(), TransportEvent::Data { .. }));
    }

    #[tokio::test]
    async fn test_unknown_peer_reports_connection_error() {
        let net = MemoryNetwork::new();
        let mut a = net.transport();
        let mut a_rx = a.open(&id("user-a")).await.unwrap();

        let conn = a.connect(&id("user-ghost")).unwrap();
        assert!(!conn.is_open());
        assert!(conn.send(vec![1]).is_err());
        assert!(matches!(
            a_rx.try_recv().unwrap(),
            TransportEvent::ConnectionError { peer, .. } if peer == id("user-ghost")
        ));
    }

    #[tokio::test]
    async fn test_connect_before_open_fails() {
        let net = MemoryNetwork::new();
        let mut a = net.transport();
        assert!(matches!(
            a.connect(&id("user-b")),
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_sever_notifies_both_ends() {
        let net = MemoryNetwork::new();
        let mut a = net.transport();
        let mut b = net.transport();
        let mut a_rx = a.open(&id("user-a")).await.unwrap();
        let mut b_rx = b.open(&id("user-b")).await.unwrap();
        let conn = a.connect(&id("user-b")).unwrap();
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        net.sever(&id("user-a"), &id("user-b"));
        assert_eq!(net.link_count(), 0);
        assert!(matches!(
            a_rx.try_recv().unwrap(),
            TransportEvent::ConnectionClosed { peer } if peer == id("user-b")
        ));
        assert!(matches!(
            b_rx.try_recv().unwrap(),
            TransportEvent::ConnectionClosed { peer } if peer == id("user-a")
        ));
        assert!(matches!(
            conn.send(vec![1]),
            Err(TransportError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_rendezvous_loss() {
        let net = MemoryNetwork::new();
        let mut a = net.transport();
        let mut a_rx = a.open(&id("user-a")).await.unwrap();

        net.drop_rendezvous();
        assert!(matches!(a_rx.try_recv().unwrap(), TransportEvent::Disconnected));
        assert!(!net.is_registered(&id("user-a")));

        let mut b = net.transport();
        assert!(matches!(
            b.open(&id("user-b")).await,
            Err(TransportError::Network(_))
        ));

        net.restore_rendezvous();
        assert!(b.open(&id("user-b")).await.is_ok());
    }
}
