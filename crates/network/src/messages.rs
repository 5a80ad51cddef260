//! Gossip payloads exchanged between nodes
//!
//! Interest announcements travel on a single network-wide topic, collations
//! on one topic per shard. Both are bincode encoded.

use std::collections::BTreeSet;

use libp2p::PeerId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{NetworkError, NetworkResult};

/// Identifier of a logical shard
pub type ShardId = u64;

/// Topic carrying interest announcements
pub const TOPIC_LISTENING_SHARDS: &str = "listeningShards";

/// Prefix of the per-shard collation topics
const TOPIC_COLLATIONS_PREFIX: &str = "shardCollations_";

/// Gossip topic of a shard's collations
pub fn collation_topic(shard_id: ShardId) -> String {
    format!("{}{}", TOPIC_COLLATIONS_PREFIX, shard_id)
}

/// Shard id of a collation topic, if the topic is one
pub fn shard_of_topic(topic: &str) -> Option<ShardId> {
    topic.strip_prefix(TOPIC_COLLATIONS_PREFIX)?.parse().ok()
}

/// A unit of shard data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub shard_id: ShardId,
    /// Position in the sender's sequence for this shard
    pub number: i64,
    pub payload: Vec<u8>,
}

/// Snapshot of every shard a peer listens to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningShards {
    #[serde(with = "crate::peer_id_serde")]
    pub peer_id: PeerId,
    pub shards: Vec<ShardId>,
}

impl ListeningShards {
    pub fn new(peer_id: PeerId, shards: &BTreeSet<ShardId>) -> Self {
        Self {
            peer_id,
            shards: shards.iter().copied().collect(),
        }
    }

    pub fn shard_set(&self) -> BTreeSet<ShardId> {
        self.shards.iter().copied().collect()
    }
}

/// Encode a wire message
pub fn encode<T: Serialize>(message: &T) -> NetworkResult<Vec<u8>> {
    bincode::serialize(message).map_err(|e| NetworkError::CodecError(e.to_string()))
}

/// Decode a wire message
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> NetworkResult<T> {
    bincode::deserialize(data).map_err(|e| NetworkError::CodecError(e.to_string()))
}
