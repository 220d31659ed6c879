//! Transport adapter contract.
//!
//! A transport registers the local identity with a rendezvous facility,
//! dials remote identities and reports everything that happens on its
//! links through a single event channel. The session never sees the
//! backend: it only holds [`Connection`] handles and drains
//! [`TransportEvent`]s.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use meshchat_shared::{CodecError, Envelope, PeerIdentity};

/// Capacity of the event channel handed out by [`Transport::open`].
pub const EVENT_QUEUE_DEPTH: usize = 1024;

pub type TransportEvents = mpsc::Receiver<TransportEvent>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Identity {0} is already registered")]
    IdCollision(PeerIdentity),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Peer {0} is unavailable")]
    PeerUnavailable(PeerIdentity),

    #[error("Connection to {0} is closed")]
    ConnectionClosed(PeerIdentity),

    #[error("Refusing to dial our own identity")]
    SelfDial,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Everything a transport reports after [`Transport::open`].
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote peer dialed us. `ConnectionOpen` follows once usable.
    IncomingConnection(Connection),
    /// A link (dialed or accepted) is ready for data.
    ConnectionOpen { peer: PeerIdentity },
    /// One frame received on the link to `peer`.
    Data { peer: PeerIdentity, data: Vec<u8> },
    ConnectionClosed { peer: PeerIdentity },
    /// The link to `peer` failed (unreachable, reset, refused).
    ConnectionError { peer: PeerIdentity, reason: String },
    /// Registration with the rendezvous facility was lost.
    Disconnected,
    /// Unrecoverable backend failure. No further events follow.
    Fatal(TransportError),
}

/// One side of a peer link, implemented per backend.
pub trait Link: Send + Sync {
    /// Queue one frame. Frames on a single link arrive in order.
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

/// Cloneable handle on a link to one remote peer.
#[derive(Clone)]
pub struct Connection {
    peer: PeerIdentity,
    link: Arc<dyn Link>,
}

impl Connection {
    pub fn new(peer: PeerIdentity, link: Arc<dyn Link>) -> Self {
        Self { peer, link }
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Send raw bytes. Data for a closed link is dropped with an error,
    /// never queued.
    pub fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::ConnectionClosed(self.peer.clone()));
        }
        self.link.send(data)
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send(envelope.to_bytes()?)
    }

    pub fn close(&self) {
        self.link.close();
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.link.is_open())
            .finish()
    }
}

/// Rendezvous registration plus outbound dialing.
#[async_trait]
pub trait Transport: Send {
    /// Register `local_id` and start reporting events. Fails with
    /// [`TransportError::IdCollision`] when the identity is taken.
    async fn open(&mut self, local_id: &PeerIdentity) -> Result<TransportEvents, TransportError>;

    /// Dial `remote`. The connection is usable once
    /// [`TransportEvent::ConnectionOpen`] arrives for it; an unreachable
    /// peer is reported as [`TransportEvent::ConnectionError`].
    fn connect(&mut self, remote: &PeerIdentity) -> Result<Connection, TransportError>;

    /// Leave the rendezvous facility and drop every link.
    fn shutdown(&mut self);
}
