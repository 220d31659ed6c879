// Peer transport layer: the transport contract, an in-process rendezvous
// for tests and a libp2p adapter, plus the per-session connection registry.

pub mod behaviour;
pub mod discovery;
pub mod memory;
pub mod peers;
pub mod swarm;
pub mod transport;

pub use behaviour::{build_swarm, MeshBehaviour, MeshBehaviourEvent};
pub use discovery::load_bootstrap_peers;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peers::{ConnectionInfo, LinkState, LocalIdentity, SessionRegistry};
pub use swarm::{SwarmCommand, SwarmConfig, SwarmTransport};
pub use transport::{Connection, Link, Transport, TransportError, TransportEvent, TransportEvents};
