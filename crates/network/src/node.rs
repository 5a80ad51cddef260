//! The node: overlay session, shard interest and collation traffic
//!
//! Per shard the interest protocol moves `Unsubscribed -> Subscribed ->
//! Announced`. Subscribing is local; announcing publishes the whole
//! current interest set as one snapshot.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::config::NodeConfig;
use crate::dissemination::CollationSink;
use crate::messages::{self, collation_topic, shard_of_topic, Collation, ListeningShards, ShardId, TOPIC_LISTENING_SHARDS};
use crate::metrics::NodeMetrics;
use crate::{InboundMessage, NetworkError, NetworkResult, OverlayService};

/// Mutable node state, shared with the inbound message task
#[derive(Debug, Default)]
struct NodeState {
    /// Shards this node listens to
    subscribed_shards: BTreeSet<ShardId>,
    /// Shards whose collation topic is joined on the overlay
    joined_topics: BTreeSet<ShardId>,
    /// Peers added through the control plane, with their addresses
    peer_book: HashMap<PeerId, Vec<Multiaddr>>,
    /// Last interest snapshot announced by each remote peer
    peer_shards: HashMap<PeerId, BTreeSet<ShardId>>,
    /// Collations received per subscribed shard
    received_collations: HashMap<ShardId, u64>,
}

/// A participant in the sharded overlay
pub struct Node {
    config: NodeConfig,
    overlay: Arc<dyn OverlayService>,
    metrics: NodeMetrics,
    state: Arc<RwLock<NodeState>>,
}

impl Node {
    /// Create a node on top of an open overlay session
    ///
    /// Spawns the task that applies inbound announcements and collations.
    pub async fn new(config: NodeConfig, overlay: Arc<dyn OverlayService>, metrics: NodeMetrics) -> NetworkResult<Self> {
        config.validate()?;

        let state = Arc::new(RwLock::new(NodeState::default()));
        let inbound = overlay.subscribe_messages().await?;
        tokio::spawn(run_inbound(inbound, state.clone(), metrics.clone(), overlay.local_peer_id()));

        Ok(Self {
            config,
            overlay,
            metrics,
            state,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.overlay.local_peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Short name used in logs
    pub fn name(&self) -> String {
        let id = self.peer_id().to_base58();
        let tail = &id[id.len().saturating_sub(6)..];
        format!("node-{}", tail)
    }

    /// This node's canonical address, preferring a concrete listen address
    pub async fn full_addr(&self) -> NetworkResult<String> {
        let addrs = self.overlay.listen_addresses().await?;
        let addr = addrs.iter()
            .find(|addr| !is_unspecified(addr))
            .or_else(|| addrs.first())
            .ok_or_else(|| NetworkError::TransportError("no listen address".to_string()))?;
        Ok(addr.clone().with(Protocol::P2p(self.peer_id())).to_string())
    }

    fn check_shard(&self, shard_id: ShardId) -> NetworkResult<()> {
        if shard_id >= self.config.num_shards {
            return Err(NetworkError::InvalidShard {
                shard: shard_id,
                num_shards: self.config.num_shards,
            });
        }
        Ok(())
    }

    /// Mark a shard as subscribed; returns whether it was newly added
    pub async fn listen_shard(&self, shard_id: ShardId) -> NetworkResult<bool> {
        self.check_shard(shard_id)?;
        let added = self.state.write().await.subscribed_shards.insert(shard_id);
        if added {
            debug!("Listening to shard {}", shard_id);
        }
        Ok(added)
    }

    /// Drop a shard from the subscription set; returns whether it was present
    pub async fn unlisten_shard(&self, shard_id: ShardId) -> NetworkResult<bool> {
        self.check_shard(shard_id)?;
        let removed = self.state.write().await.subscribed_shards.remove(&shard_id);
        if removed {
            debug!("Stopped listening to shard {}", shard_id);
        }
        Ok(removed)
    }

    pub async fn subscribed_shards(&self) -> BTreeSet<ShardId> {
        self.state.read().await.subscribed_shards.clone()
    }

    /// Announce the full current interest set to the overlay
    ///
    /// Joins the collation topics of newly subscribed shards and leaves
    /// those of dropped shards before publishing the snapshot.
    pub async fn publish_listening_shards(&self) -> NetworkResult<ListeningShards> {
        let (snapshot, to_join, to_leave) = {
            let state = self.state.read().await;
            let to_join: Vec<ShardId> = state.subscribed_shards.difference(&state.joined_topics).copied().collect();
            let to_leave: Vec<ShardId> = state.joined_topics.difference(&state.subscribed_shards).copied().collect();
            (ListeningShards::new(self.peer_id(), &state.subscribed_shards), to_join, to_leave)
        };

        for shard_id in to_join {
            self.overlay.subscribe(&collation_topic(shard_id)).await?;
            self.state.write().await.joined_topics.insert(shard_id);
        }
        for shard_id in to_leave {
            self.overlay.unsubscribe(&collation_topic(shard_id)).await?;
            self.state.write().await.joined_topics.remove(&shard_id);
        }

        let data = messages::encode(&snapshot)?;
        self.overlay.publish(TOPIC_LISTENING_SHARDS, data).await?;
        self.metrics.record_announcement_sent();
        info!("Announced listening shards {:?}", snapshot.shards);

        Ok(snapshot)
    }

    /// Startup interest sequence: subscribe to shards `[0, count)` one by
    /// one, announce once, then let the announcement settle
    pub async fn listen_and_announce(&self, count: u64) -> NetworkResult<()> {
        for shard_id in 0..count {
            self.listen_shard(shard_id).await?;
            sleep(self.config.subscription_delay()).await;
        }

        if let Err(e) = self.publish_listening_shards().await {
            warn!("Failed to announce listening shards: {}", e);
        }

        sleep(self.config.settle_delay()).await;
        Ok(())
    }

    /// Join the overlay through a static list of known peers
    pub async fn bootstrap(&self, known_peers: &[PeerAddress]) -> NetworkResult<()> {
        info!("Bootstrapping with {} known peers", known_peers.len());
        self.overlay.bootstrap(known_peers).await
    }

    /// Add a peer from its canonical address string and connect to it
    ///
    /// The peer stays in the peer book even if the connection fails.
    pub async fn add_peer(&self, address: &str) -> NetworkResult<PeerId> {
        let peer: PeerAddress = address.parse()?;
        let transport = peer.transport_multiaddr();

        {
            let mut state = self.state.write().await;
            let addrs = state.peer_book.entry(peer.peer_id).or_default();
            if !addrs.contains(&transport) {
                addrs.push(transport.clone());
            }
        }
        self.overlay.add_address(peer.peer_id, transport.clone()).await?;

        match self.connect(peer.peer_id, vec![transport]).await {
            Ok(_) => Ok(peer.peer_id),
            Err(e) => {
                warn!("Failed to add peer {}: {}", peer, e);
                Err(e)
            }
        }
    }

    /// Connect to a peer and report how long it took
    pub async fn connect(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> NetworkResult<Duration> {
        let started = Instant::now();
        self.overlay.connect(peer_id, addresses).await?;
        let latency = started.elapsed();
        info!("Connected to {} in {:?}", peer_id, latency);
        Ok(latency)
    }

    /// Resolve a peer through the DHT by identity alone, then connect to it
    pub async fn find_and_connect(&self, peer_id: PeerId) -> NetworkResult<Duration> {
        let started = Instant::now();
        let addresses = self.overlay.lookup(peer_id).await?;
        debug!("Resolved {} to {:?}", peer_id, addresses);
        self.overlay.connect(peer_id, addresses).await?;
        let latency = started.elapsed();
        info!("node.connect to {} took {:?}", peer_id, latency);
        Ok(latency)
    }

    /// Peers added through `add_peer`
    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.state.read().await.peer_book.keys().copied().collect()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.state.read().await.peer_book.contains_key(peer_id)
    }

    pub async fn connected_peers(&self) -> NetworkResult<Vec<PeerId>> {
        self.overlay.connected_peers().await
    }

    /// Last announced interest set of a remote peer
    pub async fn peer_shards(&self, peer_id: &PeerId) -> Option<BTreeSet<ShardId>> {
        self.state.read().await.peer_shards.get(peer_id).cloned()
    }

    /// Remote peers whose last announcement included the shard
    pub async fn peers_listening_to(&self, shard_id: ShardId) -> Vec<PeerId> {
        self.state.read().await.peer_shards.iter()
            .filter(|(_, shards)| shards.contains(&shard_id))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Collations received so far for a subscribed shard
    pub async fn received_collations(&self, shard_id: ShardId) -> u64 {
        self.state.read().await.received_collations.get(&shard_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CollationSink for Node {
    async fn send_collation(&self, shard_id: ShardId, number: i64, payload: Vec<u8>) -> NetworkResult<()> {
        self.check_shard(shard_id)?;

        let collation = Collation { shard_id, number, payload };
        let data = messages::encode(&collation)?;
        let size = data.len();
        self.overlay.publish(&collation_topic(shard_id), data).await?;
        self.metrics.record_collation_sent(size);
        Ok(())
    }
}

fn is_unspecified(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| match p {
        Protocol::Ip4(ip) => ip.is_unspecified(),
        Protocol::Ip6(ip) => ip.is_unspecified(),
        _ => false,
    })
}

/// Apply inbound gossip to the node state until the overlay goes away
async fn run_inbound(
    mut inbound: mpsc::Receiver<InboundMessage>,
    state: Arc<RwLock<NodeState>>,
    metrics: NodeMetrics,
    local_peer_id: PeerId,
) {
    while let Some(message) = inbound.recv().await {
        if message.source == local_peer_id {
            continue;
        }
        if let Err(e) = handle_inbound(&message, &state, &metrics).await {
            warn!("Dropping {}: {}", message, e);
        }
    }
    debug!("Inbound message stream closed");
}

async fn handle_inbound(
    message: &InboundMessage,
    state: &RwLock<NodeState>,
    metrics: &NodeMetrics,
) -> NetworkResult<()> {
    if message.topic == TOPIC_LISTENING_SHARDS {
        let announcement: ListeningShards = messages::decode(&message.data)?;
        if announcement.peer_id != message.source {
            return Err(NetworkError::ProtocolError(format!(
                "announcement for {} signed by {}",
                announcement.peer_id, message.source
            )));
        }
        debug!("Peer {} listens to {:?}", message.source, announcement.shards);
        state.write().await.peer_shards.insert(message.source, announcement.shard_set());
        metrics.record_announcement_received();
        return Ok(());
    }

    if let Some(shard_id) = shard_of_topic(&message.topic) {
        let collation: Collation = messages::decode(&message.data)?;
        if collation.shard_id != shard_id {
            return Err(NetworkError::ProtocolError(format!(
                "collation of shard {} on topic {}",
                collation.shard_id, message.topic
            )));
        }

        let mut state = state.write().await;
        if !state.subscribed_shards.contains(&shard_id) {
            debug!("Ignoring collation for unsubscribed shard {}", shard_id);
            return Ok(());
        }
        *state.received_collations.entry(shard_id).or_insert(0) += 1;
        metrics.record_collation_received();
        debug!(
            "Received collation {} of shard {} from {} ({} bytes)",
            collation.number, shard_id, message.source, collation.payload.len()
        );
        return Ok(());
    }

    debug!("Ignoring message on unknown topic {}", message.topic);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::mock::MockOverlay;

    async fn test_node(num_shards: u64) -> (Node, Arc<MockOverlay>) {
        let overlay = Arc::new(MockOverlay::new(Identity::peer_id_for_seed(1).unwrap()));
        let mut config = NodeConfig::with_seed(1);
        config.num_shards = num_shards;
        config.subscription_delay_ms = 1;
        config.settle_delay_ms = 1;
        let node = Node::new(config, overlay.clone(), NodeMetrics::new().unwrap()).await.unwrap();
        (node, overlay)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_listen_shard_is_idempotent() {
        let (node, overlay) = test_node(100).await;

        assert!(node.listen_shard(4).await.unwrap());
        assert!(!node.listen_shard(4).await.unwrap());
        assert_eq!(node.subscribed_shards().await, [4].into_iter().collect());

        // Subscribing is local
        assert!(overlay.published().is_empty());
        assert!(overlay.topics().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_shards_are_rejected() {
        let (node, _) = test_node(10).await;

        assert!(node.listen_shard(9).await.is_ok());
        assert!(matches!(
            node.listen_shard(10).await,
            Err(NetworkError::InvalidShard { shard: 10, num_shards: 10 })
        ));
        assert!(node.unlisten_shard(11).await.is_err());
        assert!(node.send_collation(10, 0, vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_announcement_is_a_snapshot() {
        let (node, overlay) = test_node(100).await;

        node.listen_shard(1).await.unwrap();
        node.listen_shard(2).await.unwrap();
        let snapshot = node.publish_listening_shards().await.unwrap();
        assert_eq!(snapshot.shards, vec![1, 2]);

        let published = overlay.published_on(TOPIC_LISTENING_SHARDS);
        assert_eq!(published.len(), 1);
        let announced: ListeningShards = messages::decode(&published[0]).unwrap();
        assert_eq!(announced.peer_id, node.peer_id());
        assert_eq!(announced.shards, vec![1, 2]);

        // Re-announcing sends the whole set again
        node.listen_shard(3).await.unwrap();
        node.publish_listening_shards().await.unwrap();
        let published = overlay.published_on(TOPIC_LISTENING_SHARDS);
        let announced: ListeningShards = messages::decode(&published[1]).unwrap();
        assert_eq!(announced.shards, vec![1, 2, 3]);
        assert_eq!(node.metrics().announcements_sent(), 2);
    }

    #[tokio::test]
    async fn test_announcement_reconciles_collation_topics() {
        let (node, overlay) = test_node(100).await;

        node.listen_shard(1).await.unwrap();
        node.listen_shard(2).await.unwrap();
        node.publish_listening_shards().await.unwrap();
        assert_eq!(overlay.topics(), [collation_topic(1), collation_topic(2)].into_iter().collect());

        node.unlisten_shard(1).await.unwrap();
        assert!(!node.unlisten_shard(1).await.unwrap());
        node.publish_listening_shards().await.unwrap();
        assert_eq!(overlay.topics(), [collation_topic(2)].into_iter().collect());
    }

    #[tokio::test]
    async fn test_listen_and_announce() {
        let (node, overlay) = test_node(100).await;

        node.listen_and_announce(3).await.unwrap();
        assert_eq!(node.subscribed_shards().await, [0, 1, 2].into_iter().collect());
        assert_eq!(overlay.published_on(TOPIC_LISTENING_SHARDS).len(), 1);
    }

    #[tokio::test]
    async fn test_listen_and_announce_tolerates_publish_failure() {
        let (node, overlay) = test_node(100).await;
        overlay.fail_publish(true);

        node.listen_and_announce(2).await.unwrap();
        assert_eq!(node.subscribed_shards().await.len(), 2);
    }

    #[tokio::test]
    async fn test_send_collation_publishes_on_shard_topic() {
        let (node, overlay) = test_node(100).await;

        node.send_collation(7, 3, vec![0u8; 128]).await.unwrap();
        let published = overlay.published_on(&collation_topic(7));
        assert_eq!(published.len(), 1);
        let collation: Collation = messages::decode(&published[0]).unwrap();
        assert_eq!(collation, Collation { shard_id: 7, number: 3, payload: vec![0u8; 128] });
        assert_eq!(node.metrics().collations_sent(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_senders() {
        let (node, overlay) = test_node(100).await;
        let node = Arc::new(node);

        let mut tasks = Vec::new();
        for shard in 0..4u64 {
            let node = node.clone();
            tasks.push(tokio::spawn(async move {
                for number in 0..5 {
                    node.send_collation(shard, number, vec![1, 2, 3]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for shard in 0..4u64 {
            let numbers: Vec<i64> = overlay.published_on(&collation_topic(shard)).iter()
                .map(|data| messages::decode::<Collation>(data).unwrap().number)
                .collect();
            assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_add_peer_records_and_connects() {
        let (node, overlay) = test_node(100).await;
        let target = Identity::peer_id_for_seed(7).unwrap();

        let added = node.add_peer(&format!("/ip4/127.0.0.1/tcp/10007/p2p/{}", target)).await.unwrap();
        assert_eq!(added, target);
        assert!(node.has_peer(&target).await);
        assert_eq!(overlay.connect_calls(), vec![target]);
    }

    #[tokio::test]
    async fn test_add_peer_keeps_peer_when_connect_fails() {
        let (node, overlay) = test_node(100).await;
        overlay.fail_connect(true);
        let target = Identity::peer_id_for_seed(8).unwrap();

        let result = node.add_peer(&format!("/ip4/127.0.0.1/tcp/10008/p2p/{}", target)).await;
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
        assert_eq!(node.known_peers().await, vec![target]);
    }

    #[tokio::test]
    async fn test_add_peer_rejects_bad_address() {
        let (node, _) = test_node(100).await;
        assert!(matches!(node.add_peer("/ip4/127.0.0.1/tcp/1").await, Err(NetworkError::InvalidAddress(_))));
        assert!(node.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_find_and_connect_uses_lookup() {
        let (node, overlay) = test_node(100).await;
        let target = Identity::peer_id_for_seed(2).unwrap();

        assert!(matches!(node.find_and_connect(target).await, Err(NetworkError::PeerNotFound(_))));

        overlay.set_lookup(target, vec!["/ip4/127.0.0.1/tcp/10002".parse().unwrap()]);
        node.find_and_connect(target).await.unwrap();
        assert_eq!(overlay.connect_calls(), vec![target]);
    }

    #[tokio::test]
    async fn test_inbound_announcement_replaces_peer_snapshot() {
        let (node, overlay) = test_node(100).await;
        let node_ref = &node;
        let remote = Identity::peer_id_for_seed(3).unwrap();

        let first = ListeningShards { peer_id: remote, shards: vec![0, 1, 2] };
        overlay.deliver(remote, TOPIC_LISTENING_SHARDS, messages::encode(&first).unwrap()).await;
        wait_until(move || async move { node_ref.peer_shards(&remote).await.is_some() }).await;
        assert_eq!(node.peers_listening_to(1).await, vec![remote]);

        let second = ListeningShards { peer_id: remote, shards: vec![5] };
        overlay.deliver(remote, TOPIC_LISTENING_SHARDS, messages::encode(&second).unwrap()).await;
        wait_until(move || async move { node_ref.peer_shards(&remote).await == Some([5].into_iter().collect()) }).await;
        assert!(node.peers_listening_to(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_announcement_for_other_peer_is_dropped() {
        let (node, overlay) = test_node(100).await;
        let node_ref = &node;
        let remote = Identity::peer_id_for_seed(3).unwrap();
        let forged = Identity::peer_id_for_seed(4).unwrap();

        let message = ListeningShards { peer_id: forged, shards: vec![1] };
        overlay.deliver(remote, TOPIC_LISTENING_SHARDS, messages::encode(&message).unwrap()).await;
        let valid = ListeningShards { peer_id: remote, shards: vec![2] };
        overlay.deliver(remote, TOPIC_LISTENING_SHARDS, messages::encode(&valid).unwrap()).await;

        wait_until(move || async move { node_ref.peer_shards(&remote).await.is_some() }).await;
        assert!(node.peer_shards(&forged).await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_collations_counted_for_subscribed_shards() {
        let (node, overlay) = test_node(100).await;
        let node_ref = &node;
        let remote = Identity::peer_id_for_seed(3).unwrap();
        node.listen_shard(1).await.unwrap();

        for (shard, number) in [(1u64, 0i64), (2, 0), (1, 1)] {
            let collation = Collation { shard_id: shard, number, payload: vec![0u8; 16] };
            overlay.deliver(remote, &collation_topic(shard), messages::encode(&collation).unwrap()).await;
        }

        wait_until(move || async move { node_ref.received_collations(1).await == 2 }).await;
        assert_eq!(node.received_collations(2).await, 0);
        assert_eq!(node.metrics().collations_received(), 2);
    }
}
