use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardp2p_network::rpc::RpcClient;
use shardp2p_network::{
    CollationSink, Identity, NetworkError, Node, NodeConfig, NodeMetrics, OverlaySession, PeerAddress, RpcServer,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// Initialize logging for tests
fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,shardp2p_network=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

// Loopback configuration with fast protocol timings; each test uses its own port bases
fn test_config(seed: i64, port_base: u16) -> NodeConfig {
    let mut config = NodeConfig::with_seed(seed);
    config.port_base = port_base;
    config.rpc_port_base = port_base + 500;
    config.listen_ip = LOCALHOST;
    config.bootstrap_dial_interval_ms = 10;
    config.subscription_delay_ms = 1;
    config.settle_delay_ms = 10;
    config.gossip_heartbeat_ms = 100;
    config
}

async fn start_node(seed: i64, port_base: u16) -> Arc<Node> {
    let config = test_config(seed, port_base);
    let identity = Identity::derive(seed).unwrap();
    let metrics = NodeMetrics::new().unwrap();
    let overlay = OverlaySession::open(&identity, &config, metrics.clone()).await.unwrap();
    Arc::new(Node::new(config, Arc::new(overlay), metrics).await.unwrap())
}

// Retry an async check until it holds or the deadline passes
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_two_node_bootstrap_and_announcement() {
    init_logging();
    let port_base = 31000;

    let node_a = start_node(1, port_base).await;
    node_a.listen_and_announce(3).await.unwrap();

    let node_b = start_node(2, port_base).await;
    let a_addr = PeerAddress::for_seed(LOCALHOST, 1, node_b.config()).unwrap();
    assert_eq!(a_addr.peer_id, node_a.peer_id());
    node_b.bootstrap(&[a_addr]).await.unwrap();

    // B resolves A from its seed alone
    let a_peer = Identity::peer_id_for_seed(1).unwrap();
    let latency = node_b.find_and_connect(a_peer).await.unwrap();
    assert!(latency > Duration::ZERO);
    assert!(node_b.connected_peers().await.unwrap().contains(&a_peer));

    // Re-announce until B has heard A's snapshot
    let a = node_a.clone();
    let b = node_b.clone();
    eventually("A's interest set at B", move || {
        let a = a.clone();
        let b = b.clone();
        async move {
            let _ = a.publish_listening_shards().await;
            b.peer_shards(&a.peer_id()).await == Some([0, 1, 2].into_iter().collect::<BTreeSet<u64>>())
        }
    }).await;

    assert_eq!(node_b.peers_listening_to(2).await, vec![node_a.peer_id()]);
    assert!(node_b.peers_listening_to(3).await.is_empty());
}

#[tokio::test]
async fn test_lookup_through_dht() {
    init_logging();
    let port_base = 32000;

    let hub = start_node(1, port_base).await;
    let hub_addr = PeerAddress::for_seed(LOCALHOST, 1, hub.config()).unwrap();

    let target = start_node(2, port_base).await;
    target.bootstrap(&[hub_addr.clone()]).await.unwrap();

    let seeker = start_node(3, port_base).await;
    seeker.bootstrap(&[hub_addr]).await.unwrap();

    // The seeker only knows the hub; the target's address comes from the DHT
    let target_peer = Identity::peer_id_for_seed(2).unwrap();
    let s = seeker.clone();
    eventually("DHT lookup of the target", move || {
        let s = s.clone();
        async move { s.find_and_connect(target_peer).await.is_ok() }
    }).await;

    assert!(seeker.connected_peers().await.unwrap().contains(&target_peer));
}

#[tokio::test]
async fn test_collations_reach_subscribed_peer() {
    init_logging();
    let port_base = 33000;

    let receiver = start_node(1, port_base).await;
    receiver.listen_shard(0).await.unwrap();
    receiver.publish_listening_shards().await.ok();

    let sender = start_node(2, port_base).await;
    let receiver_addr = PeerAddress::for_seed(LOCALHOST, 1, sender.config()).unwrap();
    sender.bootstrap(&[receiver_addr]).await.unwrap();

    let s = sender.clone();
    let r = receiver.clone();
    let mut number = 0;
    eventually("a collation at the receiver", move || {
        let s = s.clone();
        let r = r.clone();
        number += 1;
        async move {
            let _ = s.send_collation(0, number, vec![7u8; shardp2p_network::COLLATION_PAYLOAD_SIZE]).await;
            r.received_collations(0).await > 0
        }
    }).await;

    assert!(receiver.metrics().collations_received() > 0);
    assert!(sender.metrics().collations_sent() > 0);
    assert_eq!(receiver.received_collations(1).await, 0);
}

#[tokio::test]
async fn test_control_plane_add_peer() {
    init_logging();
    let port_base = 34000;

    let server_node = start_node(5, port_base).await;
    let _target = start_node(7, port_base).await;

    let server = RpcServer::new(server_node.clone()).unwrap();
    assert_eq!(server.addr().port(), port_base + 500 + 5);
    let rpc_addr = server.addr();
    let _handle = server.start().unwrap();

    let response = RpcClient::new(rpc_addr).add_peer("127.0.0.1", 7).await.unwrap();
    let expected = Identity::peer_id_for_seed(7).unwrap();
    assert!(response.success, "addpeer failed: {:?}", response.error);
    assert_eq!(response.peer_id, Some(expected.to_string()));
    assert!(server_node.has_peer(&expected).await);
    assert!(server_node.connected_peers().await.unwrap().contains(&expected));

    // Nothing listens for seed 9; the peer is still recorded and the failure reported
    let response = RpcClient::new(rpc_addr).add_peer("127.0.0.1", 9).await.unwrap();
    assert!(!response.success);
    assert!(server_node.has_peer(&Identity::peer_id_for_seed(9).unwrap()).await);
}

#[tokio::test]
async fn test_listen_port_in_use_is_fatal() {
    init_logging();
    let port_base = 35000;

    let _first = start_node(1, port_base).await;

    let config = test_config(1, port_base);
    let identity = Identity::derive(1).unwrap();
    let result = OverlaySession::open(&identity, &config, NodeMetrics::new().unwrap()).await;
    assert!(matches!(result, Err(NetworkError::TransportError(_))));

    // A different identity cannot share the port either
    let other = Identity::derive(2).unwrap();
    let result = OverlaySession::open(&other, &config, NodeMetrics::new().unwrap()).await;
    assert!(matches!(result, Err(NetworkError::TransportError(_))));
}

#[tokio::test]
async fn test_bootstrap_skips_unreachable_peers() {
    init_logging();
    let port_base = 36000;

    let node = start_node(1, port_base).await;
    let live = start_node(2, port_base).await;
    let dead = PeerAddress::for_seed(LOCALHOST, 3, node.config()).unwrap();
    let live_addr = PeerAddress::for_seed(LOCALHOST, 2, node.config()).unwrap();

    node.bootstrap(&[dead.clone(), live_addr]).await.unwrap();
    assert!(node.connected_peers().await.unwrap().contains(&live.peer_id()));

    // With no reachable peer at all the routing table cannot bootstrap
    let lonely = start_node(4, port_base).await;
    let result = lonely.bootstrap(&[dead]).await;
    assert!(matches!(result, Err(NetworkError::BootstrapError(_))));

    // An empty list is not an error
    lonely.bootstrap(&[]).await.unwrap();
}
