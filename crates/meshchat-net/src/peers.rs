//! Session registry.
//!
//! Tracks the local identity, the rendezvous status and one connection per
//! remote peer. A connection is `Dialing` from the moment it is created
//! (outbound dial or accepted incoming link) until the transport reports
//! it open.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use meshchat_shared::{ConnectionStatus, Envelope, PeerIdentity};

use crate::transport::{Connection, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: PeerIdentity,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Open,
}

/// Information about one remote peer link.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection: Connection,
    pub state: LinkState,
}

/// Tracks the local identity and every live peer connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    local: Option<LocalIdentity>,
    status: ConnectionStatus,
    peers: HashMap<PeerIdentity, ConnectionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_self(&mut self, id: PeerIdentity, display_name: impl Into<String>) {
        let display_name = display_name.into();
        info!(peer = %id, name = %display_name, "Registered local identity");
        self.local = Some(LocalIdentity { id, display_name });
    }

    pub fn local(&self) -> Option<&LocalIdentity> {
        self.local.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!(from = ?self.status, to = ?status, "Connection status changed");
            self.status = status;
        }
    }

    /// Track an in-flight link. Returns `false` (and keeps the existing
    /// entry) when the peer is already dialing or open.
    pub fn record_dial(&mut self, connection: Connection) -> bool {
        let peer = connection.peer().clone();
        if self.peers.contains_key(&peer) {
            debug!(peer = %peer, "Link already tracked, ignoring dial");
            return false;
        }
        debug!(peer = %peer, "Tracking pending link");
        self.peers.insert(
            peer,
            ConnectionInfo {
                connection,
                state: LinkState::Dialing,
            },
        );
        true
    }

    /// Mark the link to `connection.peer()` open. Idempotent: a peer that
    /// is already open keeps its existing connection, which is returned
    /// along with `false`. A pending entry is promoted in place.
    pub fn record_connection_open(&mut self, connection: Connection) -> (Connection, bool) {
        let peer = connection.peer().clone();
        match self.peers.get_mut(&peer) {
            Some(info) if info.state == LinkState::Open => (info.connection.clone(), false),
            Some(info) => {
                info.state = LinkState::Open;
                info!(peer = %peer, "Peer connection open");
                (info.connection.clone(), true)
            }
            None => {
                info!(peer = %peer, "Peer connection open");
                self.peers.insert(
                    peer,
                    ConnectionInfo {
                        connection: connection.clone(),
                        state: LinkState::Open,
                    },
                );
                (connection, true)
            }
        }
    }

    /// The tracked connection for `peer`, whatever its state.
    pub fn tracked(&self, peer: &PeerIdentity) -> Option<&Connection> {
        self.peers.get(peer).map(|info| &info.connection)
    }

    /// Forget the link to `peer`. Returns whether it was tracked.
    pub fn record_connection_closed(&mut self, peer: &PeerIdentity) -> bool {
        match self.peers.remove(peer) {
            Some(_) => {
                info!(peer = %peer, "Peer connection closed");
                true
            }
            None => false,
        }
    }

    /// The open connection to `peer`, if any.
    pub fn connection(&self, peer: &PeerIdentity) -> Option<&Connection> {
        self.peers
            .get(peer)
            .filter(|info| info.state == LinkState::Open)
            .map(|info| &info.connection)
    }

    pub fn is_connected(&self, peer: &PeerIdentity) -> bool {
        self.connection(peer).is_some()
    }

    pub fn is_tracked(&self, peer: &PeerIdentity) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn list_connected_peers(&self) -> BTreeSet<PeerIdentity> {
        self.peers
            .iter()
            .filter(|(_, info)| info.state == LinkState::Open)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|info| info.state == LinkState::Open)
            .count()
    }

    /// Send `envelope` to one open peer.
    pub fn send_to(&self, peer: &PeerIdentity, envelope: &Envelope) -> Result<(), TransportError> {
        let connection = self
            .connection(peer)
            .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;
        connection.send_envelope(envelope)
    }

    /// Send `envelope` to every open peer. Per-peer failures are logged and
    /// skipped. Returns the number of peers reached.
    pub fn broadcast(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let bytes = envelope.to_bytes()?;
        let mut reached = 0;
        for (peer, info) in &self.peers {
            if info.state != LinkState::Open {
                continue;
            }
            match info.connection.send(bytes.clone()) {
                Ok(()) => reached += 1,
                Err(e) => warn!(peer = %peer, kind = envelope.kind(), error = %e, "Broadcast send failed"),
            }
        }
        debug!(kind = envelope.kind(), reached, "Broadcast envelope");
        Ok(reached)
    }

    /// Close and forget every link.
    pub fn close_all(&mut self) {
        for (peer, info) in self.peers.drain() {
            debug!(peer = %peer, "Closing peer link");
            info.connection.close();
        }
    }
}
