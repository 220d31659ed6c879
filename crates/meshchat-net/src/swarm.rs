//! libp2p transport adapter.
//!
//! The swarm runs in a dedicated tokio task and is driven through a
//! command channel; everything it observes comes back as
//! [`TransportEvent`]s. Identities map onto libp2p peers as follows:
//!
//! - every node subscribes to its own inbox topic `meshchat/inbox/<id>`;
//!   a remote's inbox subscription binds its `PeerId` to the identity once
//!   we dialed that identity, or once the remote publishes into our inbox;
//! - frames for `<id>` are published on `<id>`'s inbox topic;
//! - registration is a Kademlia provider record under the identity key,
//!   and an existing foreign provider is an identity collision.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::kad::{self, GetProvidersOk, QueryId, QueryResult};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, identity::Keypair, relay, Multiaddr, PeerId, Swarm};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use meshchat_shared::constants::{DEFAULT_QUIC_PORT, OPEN_TIMEOUT_SECS};
use meshchat_shared::PeerIdentity;

use crate::behaviour::{build_swarm, MeshBehaviour, MeshBehaviourEvent};
use crate::discovery::{
    circuit_listen_addr, extract_peer_id, identity_from_topic, inbox_topic, load_bootstrap_peers,
    relayed_addr, rendezvous_key,
};
use crate::transport::{
    Connection, Link, Transport, TransportError, TransportEvent, TransportEvents,
    EVENT_QUEUE_DEPTH,
};

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Look `peer` up in the DHT and dial it.
    Connect {
        peer: PeerIdentity,
        open: Arc<AtomicBool>,
    },
    /// Publish one frame on `peer`'s inbox topic.
    Send { peer: PeerIdentity, data: Vec<u8> },
    /// Drop the link to `peer`.
    Close(PeerIdentity),
    /// Withdraw the registration and stop the task.
    Shutdown,
}

/// Configuration for the libp2p adapter.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// File listing rendezvous multiaddrs, one per line.
    pub bootstrap_peers_path: Option<PathBuf>,
    /// Rendezvous multiaddrs supplied directly.
    pub bootstrap_peers: Vec<Multiaddr>,
    pub listen_port: u16,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            bootstrap_peers: Vec::new(),
            listen_port: DEFAULT_QUIC_PORT,
        }
    }
}

impl SwarmConfig {
    fn rendezvous_addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.bootstrap_peers.clone();
        if let Some(ref path) = self.bootstrap_peers_path {
            addrs.extend(load_bootstrap_peers(path));
        }
        addrs
    }
}

fn network(e: impl Display) -> TransportError {
    TransportError::Network(e.to_string())
}

struct SwarmLink {
    peer: PeerIdentity,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    open: Arc<AtomicBool>,
}

impl Link for SwarmLink {
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.cmd_tx
            .try_send(SwarmCommand::Send {
                peer: self.peer.clone(),
                data,
            })
            .map_err(|e| network(format!("swarm command queue: {e}")))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.try_send(SwarmCommand::Close(self.peer.clone()));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// [`Transport`] backed by a libp2p swarm.
pub struct SwarmTransport {
    config: SwarmConfig,
    cmd_tx: Option<mpsc::Sender<SwarmCommand>>,
}

impl SwarmTransport {
    pub fn new(config: SwarmConfig) -> Self {
        Self {
            config,
            cmd_tx: None,
        }
    }
}

#[async_trait]
impl Transport for SwarmTransport {
    async fn open(&mut self, local_id: &PeerIdentity) -> Result<TransportEvents, TransportError> {
        if self.cmd_tx.is_some() {
            return Err(network("swarm transport already open"));
        }

        // A fresh libp2p key per session: the chat identity lives in the
        // DHT record, not in the PeerId.
        let mut swarm = build_swarm(Keypair::generate_ed25519()).map_err(network)?;
        let local_peer_id = *swarm.local_peer_id();

        let port = self.config.listen_port;
        for listen in [
            format!("/ip4/0.0.0.0/udp/{port}/quic-v1"),
            format!("/ip6/::/udp/{port}/quic-v1"),
        ] {
            let addr: Multiaddr = listen.parse().map_err(network)?;
            swarm.listen_on(addr).map_err(network)?;
        }
        info!(peer_id = %local_peer_id, port, "Swarm listening");

        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(inbox_topic(local_id)))
            .map_err(network)?;

        let rendezvous = self.config.rendezvous_addrs();
        let mut relays = Vec::new();
        for addr in &rendezvous {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "Failed to dial rendezvous node");
                continue;
            }
            if let Some(peer_id) = extract_peer_id(addr) {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                relays.push(addr.clone());
            }
            debug!(addr = %addr, "Dialing rendezvous node");
        }

        if rendezvous.is_empty() {
            warn!("No rendezvous nodes configured, identity is not discoverable");
        } else {
            register(&mut swarm, local_id).await?;
            for relay_addr in &relays {
                if let Err(e) = swarm.listen_on(circuit_listen_addr(relay_addr)) {
                    warn!(relay = %relay_addr, error = %e, "Relay reservation request failed");
                }
            }
        }
        info!(peer = %local_id, "Registered with rendezvous");

        let (cmd_tx, cmd_rx) = mpsc::channel::<SwarmCommand>(EVENT_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_QUEUE_DEPTH);

        let event_loop = EventLoop {
            swarm,
            local_id: local_id.clone(),
            local_peer_id,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            events: event_tx,
            relays,
            registered: !rendezvous.is_empty(),
            bindings: Bindings::default(),
            lookups: HashMap::new(),
        };
        tokio::spawn(event_loop.run());

        self.cmd_tx = Some(cmd_tx);
        Ok(event_rx)
    }

    fn connect(&mut self, remote: &PeerIdentity) -> Result<Connection, TransportError> {
        let cmd_tx = self.cmd_tx.clone().ok_or(TransportError::NotOpen)?;
        let open = Arc::new(AtomicBool::new(false));
        cmd_tx
            .try_send(SwarmCommand::Connect {
                peer: remote.clone(),
                open: Arc::clone(&open),
            })
            .map_err(|e| network(format!("swarm command queue: {e}")))?;

        let link = SwarmLink {
            peer: remote.clone(),
            cmd_tx,
            open,
        };
        Ok(Connection::new(remote.clone(), Arc::new(link)))
    }

    fn shutdown(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.try_send(SwarmCommand::Shutdown);
        }
    }
}

impl Drop for SwarmTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Look the identity up, fail on a foreign provider, then publish our own
/// provider record.
async fn register(swarm: &mut Swarm<MeshBehaviour>, local_id: &PeerIdentity) -> Result<(), TransportError> {
    let key = rendezvous_key(local_id);
    let local_peer_id = *swarm.local_peer_id();
    let mut lookup: Option<QueryId> = None;
    let mut publish: Option<QueryId> = None;

    let deadline = tokio::time::sleep(Duration::from_secs(OPEN_TIMEOUT_SECS));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(network("rendezvous registration timed out"));
            }
            event = swarm.select_next_some() => match event {
                SwarmEvent::ConnectionEstablished { peer_id, .. } if lookup.is_none() => {
                    debug!(peer = %peer_id, "Rendezvous reachable, checking identity");
                    lookup = Some(swarm.behaviour_mut().kademlia.get_providers(key.clone()));
                }
                SwarmEvent::Behaviour(MeshBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                    id, result, ..
                })) => match result {
                    QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. }))
                        if Some(id) == lookup =>
                    {
                        if providers.iter().any(|p| *p != local_peer_id) {
                            warn!(peer = %local_id, "Identity already registered by another node");
                            return Err(TransportError::IdCollision(local_id.clone()));
                        }
                    }
                    QueryResult::GetProviders(_) if Some(id) == lookup && publish.is_none() => {
                        let query = swarm
                            .behaviour_mut()
                            .kademlia
                            .start_providing(key.clone())
                            .map_err(network)?;
                        publish = Some(query);
                    }
                    QueryResult::StartProviding(result) if Some(id) == publish => {
                        return result.map(|_| ()).map_err(network);
                    }
                    _ => {}
                },
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    warn!(peer = ?peer_id, error = %error, "Rendezvous dial failed");
                }
                _ => {}
            }
        }
    }
}

/// An identity bound to a libp2p peer, ready to surface as an open link.
struct Binding {
    identity: PeerIdentity,
    open: Arc<AtomicBool>,
    incoming: bool,
}

/// libp2p peer ↔ chat identity bookkeeping.
///
/// A remote's inbox subscription alone never opens a link: gossipsub
/// reports subscriptions from every node we touch through the DHT. A peer
/// is bound only when we dialed its identity, or when it publishes its
/// first frame into our inbox.
#[derive(Default)]
struct Bindings {
    bound: HashMap<PeerId, (PeerIdentity, Arc<AtomicBool>)>,
    by_identity: HashMap<PeerIdentity, PeerId>,
    /// Outbound dials waiting for the remote's inbox subscription.
    dialing: HashMap<PeerIdentity, Arc<AtomicBool>>,
    dialing_peers: HashMap<PeerId, PeerIdentity>,
    /// Inbox subscriptions from peers nobody dialed yet.
    seen: HashMap<PeerId, PeerIdentity>,
}

impl Bindings {
    fn identity(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.bound.get(peer_id).map(|(identity, _)| identity.clone())
    }

    /// Re-use an existing binding for a fresh outbound connect.
    fn reuse(&mut self, identity: &PeerIdentity, open: &Arc<AtomicBool>) -> bool {
        let Some(peer_id) = self.by_identity.get(identity) else {
            return false;
        };
        open.store(true, Ordering::SeqCst);
        if let Some(entry) = self.bound.get_mut(peer_id) {
            entry.1 = Arc::clone(open);
        }
        true
    }

    fn start_dial(&mut self, identity: PeerIdentity, open: Arc<AtomicBool>) {
        self.dialing.insert(identity, open);
    }

    /// The DHT resolved `identity` to `provider`. Binds at once when the
    /// provider already announced that inbox.
    fn resolved(&mut self, identity: PeerIdentity, provider: PeerId) -> Option<Binding> {
        if self.seen.get(&provider) == Some(&identity) {
            self.seen.remove(&provider);
            return self.bind(provider, identity);
        }
        self.dialing_peers.insert(provider, identity);
        None
    }

    fn abandon(&mut self, identity: &PeerIdentity) {
        self.dialing.remove(identity);
    }

    fn dial_failed(&mut self, peer_id: &PeerId) -> Option<PeerIdentity> {
        let identity = self.dialing_peers.remove(peer_id)?;
        self.dialing.remove(&identity);
        Some(identity)
    }

    fn subscribed(&mut self, local_id: &PeerIdentity, peer_id: PeerId, identity: PeerIdentity) -> Option<Binding> {
        if &identity == local_id || self.bound.contains_key(&peer_id) {
            return None;
        }
        if self.dialing.contains_key(&identity) {
            return self.bind(peer_id, identity);
        }
        self.seen.insert(peer_id, identity);
        None
    }

    fn unsubscribed(&mut self, peer_id: &PeerId, identity: &PeerIdentity) {
        if self.seen.get(peer_id) == Some(identity) {
            self.seen.remove(peer_id);
        }
    }

    /// A frame arrived from `source` which is not bound yet.
    fn first_frame(&mut self, source: PeerId) -> Option<Binding> {
        let identity = self.seen.remove(&source)?;
        self.bind(source, identity)
    }

    fn close(&mut self, identity: &PeerIdentity) -> Option<PeerId> {
        self.dialing.remove(identity);
        let peer_id = self.by_identity.remove(identity)?;
        self.bound.remove(&peer_id);
        Some(peer_id)
    }

    fn disconnected(&mut self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.seen.remove(peer_id);
        let (identity, open) = self.bound.remove(peer_id)?;
        open.store(false, Ordering::SeqCst);
        self.by_identity.remove(&identity);
        Some(identity)
    }

    fn close_all(&mut self) {
        for (_, (_, open)) in self.bound.drain() {
            open.store(false, Ordering::SeqCst);
        }
        self.by_identity.clear();
    }

    fn bind(&mut self, peer_id: PeerId, identity: PeerIdentity) -> Option<Binding> {
        if self.bound.contains_key(&peer_id) || self.by_identity.contains_key(&identity) {
            return None;
        }
        self.dialing_peers.remove(&peer_id);
        let (open, incoming) = match self.dialing.remove(&identity) {
            Some(open) => (open, false),
            None => (Arc::new(AtomicBool::new(false)), true),
        };
        open.store(true, Ordering::SeqCst);
        self.bound.insert(peer_id, (identity.clone(), Arc::clone(&open)));
        self.by_identity.insert(identity.clone(), peer_id);
        debug!(peer = %identity, peer_id = %peer_id, incoming, "Bound identity");
        Some(Binding {
            identity,
            open,
            incoming,
        })
    }
}

struct EventLoop {
    swarm: Swarm<MeshBehaviour>,
    local_id: PeerIdentity,
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    cmd_rx: mpsc::Receiver<SwarmCommand>,
    events: mpsc::Sender<TransportEvent>,
    relays: Vec<Multiaddr>,
    registered: bool,
    bindings: Bindings,
    /// DHT lookups for outbound dials.
    lookups: HashMap<QueryId, PeerIdentity>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SwarmCommand::Shutdown) | None => {
                        info!("Swarm shutdown requested");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
            }
            if self.events.is_closed() {
                debug!("Event receiver dropped, stopping swarm");
                break;
            }
        }

        self.swarm
            .behaviour_mut()
            .kademlia
            .stop_providing(&rendezvous_key(&self.local_id));
        self.bindings.close_all();
        info!("Swarm event loop terminated");
    }

    /// The returned future owns a sender clone, so it never holds `&self`
    /// (and with it the non-`Sync` swarm) across an await.
    fn emit(&self, event: TransportEvent) -> impl Future<Output = ()> + Send + 'static {
        let events = self.events.clone();
        async move {
            let _ = events.send(event).await;
        }
    }

    /// Surface a fresh binding: a new incoming connection when the remote
    /// reached us first, then the open notification.
    fn open_link(&self, binding: Binding) -> impl Future<Output = ()> + Send + 'static {
        let events = self.events.clone();
        let cmd_tx = self.cmd_tx.clone();
        async move {
            if binding.incoming {
                let link = SwarmLink {
                    peer: binding.identity.clone(),
                    cmd_tx,
                    open: binding.open,
                };
                let connection = Connection::new(binding.identity.clone(), Arc::new(link));
                let _ = events.send(TransportEvent::IncomingConnection(connection)).await;
            }
            let _ = events
                .send(TransportEvent::ConnectionOpen {
                    peer: binding.identity,
                })
                .await;
        }
    }

    async fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Connect { peer, open } => {
                if self.bindings.reuse(&peer, &open) {
                    debug!(peer = %peer, "Identity already bound, link is open");
                    self.emit(TransportEvent::ConnectionOpen { peer }).await;
                    return;
                }
                let query = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(rendezvous_key(&peer));
                debug!(peer = %peer, "Looking up identity");
                self.lookups.insert(query, peer.clone());
                self.bindings.start_dial(peer, open);
            }
            SwarmCommand::Send { peer, data } => {
                let topic = IdentTopic::new(inbox_topic(&peer));
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
                    error!(peer = %peer, error = %e, "Publish failed");
                }
            }
            SwarmCommand::Close(peer) => {
                if let Some(peer_id) = self.bindings.close(&peer) {
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                }
                self.emit(TransportEvent::ConnectionClosed { peer }).await;
            }
            SwarmCommand::Shutdown => {}
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                let Some(identity) = identity_from_topic(topic.as_str()) else {
                    return;
                };
                match self.bindings.subscribed(&self.local_id, peer_id, identity) {
                    Some(binding) => self.open_link(binding).await,
                    None => debug!(peer_id = %peer_id, topic = %topic, "Inbox subscription noted"),
                }
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Unsubscribed {
                peer_id,
                topic,
            })) => {
                if let Some(identity) = identity_from_topic(topic.as_str()) {
                    self.bindings.unsubscribed(&peer_id, &identity);
                }
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message, ..
            })) => {
                let Some(source) = message.source else {
                    debug!("Dropping unsigned frame");
                    return;
                };
                let identity = match self.bindings.identity(&source) {
                    Some(identity) => identity,
                    None => match self.bindings.first_frame(source) {
                        Some(binding) => {
                            let identity = binding.identity.clone();
                            self.open_link(binding).await;
                            identity
                        }
                        None => {
                            debug!(source = %source, "Dropping frame from unbound peer");
                            return;
                        }
                    },
                };
                self.emit(TransportEvent::Data {
                    peer: identity,
                    data: message.data,
                })
                .await;
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: QueryResult::GetProviders(result),
                ..
            })) => self.handle_lookup(id, result).await,

            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(peer = %peer_id, protocol = ?info.protocol_version, "Identify: received info from peer");
                for addr in &info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                }
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
            )) => {
                info!(relay = %relay_peer_id, "Relay reservation accepted");
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::Dcutr(event)) => {
                debug!(event = ?event, "DCUtR event");
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => {
                if let Some(identity) = self.bindings.disconnected(&peer_id) {
                    self.emit(TransportEvent::ConnectionClosed { peer: identity }).await;
                } else if self.registered && self.is_rendezvous(&peer_id) && !self.rendezvous_connected() {
                    warn!(peer = %peer_id, "Lost every rendezvous connection");
                    self.registered = false;
                    self.emit(TransportEvent::Disconnected).await;
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                warn!(peer = %peer_id, error = %error, "Outgoing connection error");
                if let Some(identity) = self.bindings.dial_failed(&peer_id) {
                    self.emit(TransportEvent::ConnectionError {
                        peer: identity,
                        reason: error.to_string(),
                    })
                    .await;
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on new address");
            }

            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(error = %error, "Incoming connection error");
            }

            _ => {}
        }
    }

    async fn handle_lookup(&mut self, id: QueryId, result: kad::GetProvidersResult) {
        let Some(peer) = self.lookups.get(&id).cloned() else {
            return;
        };

        let provider = match &result {
            Ok(GetProvidersOk::FoundProviders { providers, .. }) => {
                providers.iter().copied().find(|p| *p != self.local_peer_id)
            }
            _ => None,
        };

        match (provider, result) {
            (Some(provider), _) => {
                self.lookups.remove(&id);
                if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                    query.finish();
                }
                self.dial(peer, provider).await;
            }
            (None, Ok(GetProvidersOk::FoundProviders { .. })) => {}
            (None, _) => {
                self.lookups.remove(&id);
                self.bindings.abandon(&peer);
                debug!(peer = %peer, "Identity not registered");
                self.emit(TransportEvent::ConnectionError {
                    peer,
                    reason: "peer unavailable".into(),
                })
                .await;
            }
        }
    }

    async fn dial(&mut self, peer: PeerIdentity, provider: PeerId) {
        if let Some(binding) = self.bindings.resolved(peer.clone(), provider) {
            self.open_link(binding).await;
            return;
        }
        if self.swarm.is_connected(&provider) {
            debug!(peer = %peer, provider = %provider, "Already connected, waiting for inbox subscription");
            return;
        }

        let addresses = self
            .relays
            .iter()
            .map(|relay_addr| relayed_addr(relay_addr, provider))
            .collect();
        let opts = DialOpts::peer_id(provider)
            .addresses(addresses)
            .extend_addresses_through_behaviour()
            .build();

        debug!(peer = %peer, provider = %provider, "Dialing peer");
        if let Err(e) = self.swarm.dial(opts) {
            self.bindings.dial_failed(&provider);
            self.emit(TransportEvent::ConnectionError {
                peer,
                reason: e.to_string(),
            })
            .await;
        }
    }

    fn is_rendezvous(&self, peer_id: &PeerId) -> bool {
        self.relays
            .iter()
            .any(|addr| extract_peer_id(addr).as_ref() == Some(peer_id))
    }

    fn rendezvous_connected(&self) -> bool {
        self.relays
            .iter()
            .filter_map(extract_peer_id)
            .any(|peer_id| self.swarm.is_connected(&peer_id))
    }
}
