//! Composed libp2p behaviour behind [`crate::swarm::SwarmTransport`].
//!
//! GossipSub carries envelopes (one inbox topic per identity), Kademlia
//! provider records act as the rendezvous registry, Identify feeds
//! addresses into Kademlia, and Relay client + DCUtR get peers behind NAT
//! talking to each other.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::{dcutr, identify, noise, relay, swarm::NetworkBehaviour, StreamProtocol, SwarmBuilder};
use tracing::info;

use meshchat_shared::constants::{
    GOSSIPSUB_HEARTBEAT_SECS, KAD_PROTOCOL, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
    RENDEZVOUS_RECORD_TTL_SECS,
};

/// Event type is the derive-generated `MeshBehaviourEvent`, one variant per
/// field.
#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    /// Envelope delivery through per-identity inbox topics
    pub gossipsub: gossipsub::Behaviour,
    /// Identity registrations as provider records
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Build a QUIC + relay swarm running [`MeshBehaviour`].
pub fn build_swarm(keypair: Keypair) -> anyhow::Result<libp2p::Swarm<MeshBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_relay_client(noise::Config::new, libp2p::yamux::Config::default)?
        .with_behaviour(|key, relay_client| -> Result<MeshBehaviour, BoxError> {
            let local_peer_id = key.public().to_peer_id();

            // Identical frames from one source are legitimate (two "stopped
            // typing" updates), so the sequence number is part of the id.
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.data.hash(&mut hasher);
                message.source.hash(&mut hasher);
                message.sequence_number.hash(&mut hasher);
                MessageId::from(hasher.finish().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> BoxError { format!("GossipSub config: {e}").into() })?;

            let gossipsub =
                gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossipsub_config)
                    .map_err(|e| -> BoxError { format!("GossipSub init: {e}").into() })?;

            let mut kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
            kad_config.set_provider_record_ttl(Some(Duration::from_secs(RENDEZVOUS_RECORD_TTL_SECS)));
            kad_config.set_provider_publication_interval(Some(Duration::from_secs(
                RENDEZVOUS_RECORD_TTL_SECS / 2,
            )));
            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60)),
            );

            let dcutr = dcutr::Behaviour::new(local_peer_id);

            Ok(MeshBehaviour {
                gossipsub,
                kademlia,
                identify,
                relay_client,
                dcutr,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built meshchat swarm with QUIC + relay transport");

    Ok(swarm)
}
