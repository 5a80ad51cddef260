//! Network layer for a shard-aware peer-to-peer node
//!
//! This crate provides everything a node needs to take part in the
//! sharded overlay:
//! - Seed-based identity derivation
//! - A libp2p overlay session (Kademlia routing, gossipsub, identify, ping)
//! - Shard interest subscription and announcement
//! - Collation dissemination workloads
//! - An HTTP control plane for managing a running node

use std::fmt;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Network error types
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Key generation or peer id derivation failed
    #[error("Identity error: {0}")]
    IdentityError(String),

    /// Transport setup or listen failure
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Routing table bootstrap failure
    #[error("Bootstrap error: {0}")]
    BootstrapError(String),

    /// Peer could not be resolved through the routing table
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Gossip publish or subscription failure
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Encoding or decoding of a wire message failed
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Shard id outside of the configured range
    #[error("Invalid shard {shard}: must be in [0, {num_shards})")]
    InvalidShard { shard: u64, num_shards: u64 },

    /// Invalid address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed collation send option
    #[error("Invalid send option {0:?}: expected <numShards>,<numCollations>,<intervalMs>")]
    InvalidSendOption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Control plane failure
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// A gossip message delivered to this node
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Original author of the message
    pub source: PeerId,
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub data: Vec<u8>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message {{ source: {}, topic: {}, bytes: {} }}",
               self.source,
               self.topic,
               self.data.len())
    }
}

/// Overlay service trait
///
/// The capabilities the node needs from the overlay substrate. The libp2p
/// backed [`OverlaySession`] is the production implementation.
#[async_trait]
pub trait OverlayService: Send + Sync + 'static {
    /// Identity of the local host
    fn local_peer_id(&self) -> PeerId;

    /// Addresses the host is currently listening on
    async fn listen_addresses(&self) -> NetworkResult<Vec<Multiaddr>>;

    /// Connect to each known peer, then bootstrap the routing table
    async fn bootstrap(&self, known_peers: &[PeerAddress]) -> NetworkResult<()>;

    /// Resolve a peer's addresses from its identity alone
    async fn lookup(&self, peer_id: PeerId) -> NetworkResult<Vec<Multiaddr>>;

    /// Record an address for a peer in the routing table
    async fn add_address(&self, peer_id: PeerId, address: Multiaddr) -> NetworkResult<()>;

    /// Establish (or reuse) a connection to a peer
    async fn connect(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> NetworkResult<()>;

    /// Peers with at least one open connection
    async fn connected_peers(&self) -> NetworkResult<Vec<PeerId>>;

    /// Join a gossip topic
    async fn subscribe(&self, topic: &str) -> NetworkResult<()>;

    /// Leave a gossip topic
    async fn unsubscribe(&self, topic: &str) -> NetworkResult<()>;

    /// Hand a message to the overlay for dissemination on a topic
    async fn publish(&self, topic: &str, data: Vec<u8>) -> NetworkResult<()>;

    /// Subscribe to receive gossip messages delivered to this node
    async fn subscribe_messages(&self) -> NetworkResult<mpsc::Receiver<InboundMessage>>;
}

/// Public modules
pub mod address;
pub mod config;
pub mod dissemination;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod node;
pub mod p2p;
pub mod rpc;

#[cfg(test)]
mod mock;

/// Re-exports
pub use crate::address::PeerAddress;
pub use crate::config::NodeConfig;
pub use crate::dissemination::{CollationSink, SendPlan, COLLATION_PAYLOAD_SIZE};
pub use crate::identity::Identity;
pub use crate::messages::{Collation, ListeningShards, ShardId};
pub use crate::metrics::NodeMetrics;
pub use crate::node::Node;
pub use crate::p2p::OverlaySession;
pub use crate::rpc::{AddPeerRequest, AddPeerResponse, RpcServer};

/// Serialization helpers for PeerId
mod peer_id_serde {
    use libp2p::PeerId;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(peer_id: &PeerId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = peer_id.to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PeerId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PeerId::from_str(&s).map_err(serde::de::Error::custom)
    }
}
