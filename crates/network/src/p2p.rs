//! Overlay session implementation using libp2p
//!
//! One background task owns the swarm. Callers hold an [`OverlaySession`]
//! handle and talk to the task over a command channel, so every swarm
//! mutation is serialized without locks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode},
    identify, kad, noise, ping,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::address::PeerAddress;
use crate::config::NodeConfig;
use crate::identity::Identity;
use crate::messages::TOPIC_LISTENING_SHARDS;
use crate::metrics::NodeMetrics;
use crate::{InboundMessage, NetworkError, NetworkResult, OverlayService};

/// Protocol version announced through identify
const PROTOCOL_VERSION: &str = "/shardp2p/1.0.0";

/// How long `open` waits for the listener to come up
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of each inbound message subscription
const INBOUND_BUFFER: usize = 1024;

/// Network behavior combining multiple protocols
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "ComposedEvent")]
struct OverlayBehaviour {
    /// Ping protocol for measuring latency
    ping: ping::Behaviour,
    /// Identify protocol, feeds listen addresses into the routing table
    identify: identify::Behaviour,
    /// Kademlia DHT for peer discovery
    kad: kad::Behaviour<kad::store::MemoryStore>,
    /// GossipSub for shard announcements and collations
    gossipsub: gossipsub::Behaviour,
}

/// Combined events from all protocols
#[derive(Debug)]
enum ComposedEvent {
    Ping(ping::Event),
    Identify(identify::Event),
    Kad(kad::Event),
    Gossipsub(gossipsub::Event),
}

impl From<ping::Event> for ComposedEvent {
    fn from(event: ping::Event) -> Self {
        ComposedEvent::Ping(event)
    }
}

impl From<identify::Event> for ComposedEvent {
    fn from(event: identify::Event) -> Self {
        ComposedEvent::Identify(event)
    }
}

impl From<kad::Event> for ComposedEvent {
    fn from(event: kad::Event) -> Self {
        ComposedEvent::Kad(event)
    }
}

impl From<gossipsub::Event> for ComposedEvent {
    fn from(event: gossipsub::Event) -> Self {
        ComposedEvent::Gossipsub(event)
    }
}

type Reply<T> = oneshot::Sender<NetworkResult<T>>;

/// Command messages to control the swarm task
enum Command {
    /// Get listen addresses
    ListenAddresses(Reply<Vec<Multiaddr>>),
    /// Run the routing table bootstrap query
    BootstrapRoutingTable(Reply<()>),
    /// Resolve a peer's addresses by identity
    Lookup(PeerId, Reply<Vec<Multiaddr>>),
    /// Record a peer address in the routing table
    AddAddress(PeerId, Multiaddr, Reply<()>),
    /// Connect to a peer
    Connect(PeerId, Vec<Multiaddr>, Reply<()>),
    /// Get the connected peers
    ConnectedPeers(Reply<Vec<PeerId>>),
    /// Join a gossip topic
    Subscribe(String, Reply<()>),
    /// Leave a gossip topic
    Unsubscribe(String, Reply<()>),
    /// Publish on a gossip topic
    Publish(String, Vec<u8>, Reply<()>),
    /// Register an inbound message subscriber
    SubscribeMessages(Reply<mpsc::Receiver<InboundMessage>>),
}

/// Handle to a running overlay host
#[derive(Clone)]
pub struct OverlaySession {
    /// Local peer ID
    local_peer_id: PeerId,
    /// Delay between bootstrap connection attempts
    bootstrap_dial_interval: Duration,
    /// Command sender
    command_tx: mpsc::Sender<Command>,
}

impl OverlaySession {
    /// Bind the host to `listen_ip:port_base + seed` and start the swarm task
    ///
    /// A listener that cannot be bound is returned as a
    /// [`NetworkError::TransportError`]; there is no retry on another port.
    pub async fn open(identity: &Identity, config: &NodeConfig, metrics: NodeMetrics) -> NetworkResult<Self> {
        let listen_addr = config.listen_multiaddr()?;
        claim_port(SocketAddr::new(config.listen_ip, config.listen_port()?))?;
        let mut swarm = Self::create_swarm(identity, config)?;

        swarm.listen_on(listen_addr.clone())
            .map_err(|e| NetworkError::TransportError(format!("Failed to listen on {}: {}", listen_addr, e)))?;

        let listen_addresses = timeout(LISTEN_TIMEOUT, Self::await_listener(&mut swarm))
            .await
            .map_err(|_| NetworkError::TransportError(format!("Listener on {} did not come up", listen_addr)))??;

        let (command_tx, command_rx) = mpsc::channel(256);
        let local_peer_id = identity.peer_id();

        let driver = SwarmDriver {
            swarm,
            command_rx,
            listen_addresses,
            pending_dials: HashMap::new(),
            pending_lookups: HashMap::new(),
            subscribers: Vec::new(),
            metrics,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            local_peer_id,
            bootstrap_dial_interval: config.bootstrap_dial_interval(),
            command_tx,
        })
    }

    /// Create the swarm with all network behaviors
    fn create_swarm(identity: &Identity, config: &NodeConfig) -> NetworkResult<Swarm<OverlayBehaviour>> {
        let swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::TransportError(e.to_string()))?
            .with_behaviour(|key| -> Result<OverlayBehaviour, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self::create_behaviour(key, config)?)
            })
            .map_err(|e| NetworkError::TransportError(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout()))
            .build();

        Ok(swarm)
    }

    fn create_behaviour(key: &libp2p::identity::Keypair, config: &NodeConfig) -> NetworkResult<OverlayBehaviour> {
        let local_peer_id = key.public().to_peer_id();

        // Set up gossipsub
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(config.gossip_heartbeat())
            .validation_mode(ValidationMode::Strict)
            .max_transmit_size(config.max_transmit_size)
            .build()
            .map_err(|e| NetworkError::ProtocolError(e.to_string()))?;

        let mut gossipsub = gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossipsub_config)
            .map_err(|e| NetworkError::ProtocolError(e.to_string()))?;

        // Every node hears every interest announcement
        gossipsub.subscribe(&IdentTopic::new(TOPIC_LISTENING_SHARDS))
            .map_err(|e| NetworkError::ProtocolError(e.to_string()))?;

        // Set up Kademlia, answering queries even before an external address is confirmed
        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kad = kad::Behaviour::with_config(local_peer_id, store, kad::Config::new(kad::PROTOCOL_NAME));
        kad.set_mode(Some(kad::Mode::Server));

        Ok(OverlayBehaviour {
            ping: ping::Behaviour::new(ping::Config::new()),
            identify: identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.to_string(),
                key.public(),
            )),
            kad,
            gossipsub,
        })
    }

    /// Drive the swarm until the listener reports its first address
    async fn await_listener(swarm: &mut Swarm<OverlayBehaviour>) -> NetworkResult<Vec<Multiaddr>> {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => {
                    info!("Listening on {}", address);
                    return Ok(vec![address]);
                }
                SwarmEvent::ListenerClosed { reason: Err(e), .. } | SwarmEvent::ListenerError { error: e, .. } => {
                    return Err(NetworkError::TransportError(e.to_string()));
                }
                other => debug!("Swarm event before listener came up: {:?}", other),
            }
        }
    }

    /// Send a command and wait for the task's reply
    async fn request<T>(&self, what: &str, make: impl FnOnce(Reply<T>) -> Command) -> NetworkResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(make(tx)).await
            .map_err(|_| NetworkError::ChannelClosed(format!("Failed to send {} command", what)))?;

        rx.await
            .map_err(|_| NetworkError::ChannelClosed(format!("Failed to receive {} response", what)))?
    }
}

#[async_trait]
impl OverlayService for OverlaySession {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn listen_addresses(&self) -> NetworkResult<Vec<Multiaddr>> {
        self.request("listen_addresses", Command::ListenAddresses).await
    }

    async fn bootstrap(&self, known_peers: &[PeerAddress]) -> NetworkResult<()> {
        if known_peers.is_empty() {
            info!("No bootstrap peers configured, skipping routing table bootstrap");
            return Ok(());
        }

        let mut connected = 0;
        for (i, peer) in known_peers.iter().enumerate() {
            if i > 0 {
                sleep(self.bootstrap_dial_interval).await;
            }
            match self.connect(peer.peer_id, vec![peer.transport_multiaddr()]).await {
                Ok(()) => {
                    info!("Connected to bootstrap peer {}", peer);
                    connected += 1;
                }
                Err(e) => warn!("Failed to connect to bootstrap peer {}: {}", peer, e),
            }
        }

        // Failed dials still leave their address in the routing table
        if connected == 0 {
            return Err(NetworkError::BootstrapError(format!(
                "none of the {} bootstrap peers could be reached",
                known_peers.len()
            )));
        }

        self.request("bootstrap", Command::BootstrapRoutingTable).await
    }

    async fn lookup(&self, peer_id: PeerId) -> NetworkResult<Vec<Multiaddr>> {
        self.request("lookup", |tx| Command::Lookup(peer_id, tx)).await
    }

    async fn add_address(&self, peer_id: PeerId, address: Multiaddr) -> NetworkResult<()> {
        self.request("add_address", |tx| Command::AddAddress(peer_id, address, tx)).await
    }

    async fn connect(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> NetworkResult<()> {
        self.request("connect", |tx| Command::Connect(peer_id, addresses, tx)).await
    }

    async fn connected_peers(&self) -> NetworkResult<Vec<PeerId>> {
        self.request("connected_peers", Command::ConnectedPeers).await
    }

    async fn subscribe(&self, topic: &str) -> NetworkResult<()> {
        let topic = topic.to_string();
        self.request("subscribe", |tx| Command::Subscribe(topic, tx)).await
    }

    async fn unsubscribe(&self, topic: &str) -> NetworkResult<()> {
        let topic = topic.to_string();
        self.request("unsubscribe", |tx| Command::Unsubscribe(topic, tx)).await
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> NetworkResult<()> {
        let topic = topic.to_string();
        self.request("publish", |tx| Command::Publish(topic, data, tx)).await
    }

    async fn subscribe_messages(&self) -> NetworkResult<mpsc::Receiver<InboundMessage>> {
        self.request("subscribe_messages", Command::SubscribeMessages).await
    }
}

/// Fail if another socket holds the port
///
/// libp2p-tcp binds with SO_REUSEPORT, so the swarm itself never sees
/// EADDRINUSE. The plain listener is dropped before the swarm binds.
fn claim_port(addr: SocketAddr) -> NetworkResult<()> {
    std::net::TcpListener::bind(addr)
        .map(drop)
        .map_err(|e| NetworkError::TransportError(format!("Failed to listen on {}: {}", addr, e)))
}

/// State owned by the swarm task
struct SwarmDriver {
    swarm: Swarm<OverlayBehaviour>,
    command_rx: mpsc::Receiver<Command>,
    listen_addresses: Vec<Multiaddr>,
    /// Callers waiting for a connection to a peer
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    /// Callers waiting for a closest-peers query
    pending_lookups: HashMap<kad::QueryId, (PeerId, Reply<Vec<Multiaddr>>)>,
    subscribers: Vec<mpsc::Sender<InboundMessage>>,
    metrics: NodeMetrics,
}

impl SwarmDriver {
    async fn run(mut self) {
        info!("Overlay task started, peer ID: {}", self.swarm.local_peer_id());

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("All overlay handles dropped");
                        break;
                    }
                },
            }
        }

        info!("Overlay task stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ListenAddresses(reply) => {
                let _ = reply.send(Ok(self.listen_addresses.clone()));
            }
            Command::BootstrapRoutingTable(reply) => {
                let result = self.swarm.behaviour_mut().kad.bootstrap()
                    .map(|query_id| debug!("Routing table bootstrap started: {:?}", query_id))
                    .map_err(|e| NetworkError::BootstrapError(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Lookup(peer_id, reply) => {
                let known = self.routing_table_addresses(&peer_id);
                if !known.is_empty() {
                    let _ = reply.send(Ok(known));
                } else {
                    let query_id = self.swarm.behaviour_mut().kad.get_closest_peers(peer_id);
                    debug!("Looking up {} through the DHT: {:?}", peer_id, query_id);
                    self.pending_lookups.insert(query_id, (peer_id, reply));
                }
            }
            Command::AddAddress(peer_id, address, reply) => {
                self.swarm.behaviour_mut().kad.add_address(&peer_id, address);
                let _ = reply.send(Ok(()));
            }
            Command::Connect(peer_id, addresses, reply) => self.handle_connect(peer_id, addresses, reply),
            Command::ConnectedPeers(reply) => {
                let _ = reply.send(Ok(self.swarm.connected_peers().cloned().collect()));
            }
            Command::Subscribe(topic, reply) => {
                let result = self.swarm.behaviour_mut().gossipsub.subscribe(&IdentTopic::new(topic.as_str()))
                    .map(|newly| if newly { debug!("Subscribed to {}", topic) })
                    .map_err(|e| NetworkError::ProtocolError(format!("subscribe {}: {}", topic, e)));
                let _ = reply.send(result);
            }
            Command::Unsubscribe(topic, reply) => {
                let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&IdentTopic::new(topic.as_str()));
                debug!("Unsubscribed from {}", topic);
                let _ = reply.send(Ok(()));
            }
            Command::Publish(topic, data, reply) => {
                let result = self.swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(topic.as_str()), data)
                    .map(|message_id| debug!("Published {} on {}", message_id, topic))
                    .map_err(|e| NetworkError::ProtocolError(format!("publish on {}: {}", topic, e)));
                let _ = reply.send(result);
            }
            Command::SubscribeMessages(reply) => {
                let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
                self.subscribers.push(tx);
                let _ = reply.send(Ok(rx));
            }
        }
    }

    fn handle_connect(&mut self, peer_id: PeerId, addresses: Vec<Multiaddr>, reply: Reply<()>) {
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(waiting) = self.pending_dials.get_mut(&peer_id) {
            waiting.push(reply);
            return;
        }

        for addr in &addresses {
            self.swarm.behaviour_mut().kad.add_address(&peer_id, addr.clone());
        }

        self.metrics.record_connection_attempt();
        let opts = DialOpts::peer_id(peer_id)
            .addresses(addresses)
            .extend_addresses_through_behaviour()
            .build();

        match self.swarm.dial(opts) {
            Ok(()) => {
                debug!("Dialing {}", peer_id);
                self.pending_dials.insert(peer_id, vec![reply]);
            }
            Err(e) => {
                self.metrics.record_connection_failure();
                let _ = reply.send(Err(NetworkError::ConnectionFailed(format!("{}: {}", peer_id, e))));
            }
        }
    }

    /// Addresses of a peer currently held in the routing table
    fn routing_table_addresses(&mut self, peer_id: &PeerId) -> Vec<Multiaddr> {
        let mut found = Vec::new();
        for bucket in self.swarm.behaviour_mut().kad.kbuckets() {
            for entry in bucket.iter() {
                if entry.node.key.preimage() == peer_id {
                    found.extend(entry.node.value.iter().cloned());
                }
            }
        }
        found
    }

    fn resolve_dial(&mut self, peer_id: &PeerId, result: impl Fn() -> NetworkResult<()>) {
        if let Some(waiting) = self.pending_dials.remove(peer_id) {
            for reply in waiting {
                let _ = reply.send(result());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ComposedEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                if !self.listen_addresses.contains(&address) {
                    self.listen_addresses.push(address);
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                if num_established.get() == 1 {
                    debug!("Connection established with peer: {} at {}", peer_id, endpoint.get_remote_address());
                }
                self.metrics.set_peers_connected(self.swarm.connected_peers().count());
                self.resolve_dial(&peer_id, || Ok(()));
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, num_established, .. } => {
                if num_established == 0 {
                    debug!("Connection closed with peer: {}, cause: {:?}", peer_id, cause);
                }
                self.metrics.set_peers_connected(self.swarm.connected_peers().count());
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                warn!("Outgoing connection error to {}: {}", peer_id, error);
                if self.swarm.is_connected(&peer_id) {
                    self.resolve_dial(&peer_id, || Ok(()));
                } else {
                    self.metrics.record_connection_failure();
                    let reason = error.to_string();
                    self.resolve_dial(&peer_id, || Err(NetworkError::ConnectionFailed(format!("{}: {}", peer_id, reason))));
                }
            }
            SwarmEvent::Behaviour(ComposedEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let inbound = InboundMessage {
                    source: message.source.unwrap_or(propagation_source),
                    topic: message.topic.into_string(),
                    data: message.data,
                };
                debug!("Received gossip {} via {}", inbound, propagation_source);
                self.dispatch(inbound);
            }
            SwarmEvent::Behaviour(ComposedEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(ComposedEvent::Kad(kad::Event::OutboundQueryProgressed { id, result, .. })) => {
                self.handle_query_result(id, result);
            }
            SwarmEvent::Behaviour(ComposedEvent::Kad(kad::Event::RoutingUpdated { peer, .. })) => {
                debug!("Kademlia routing updated for peer: {}", peer);
            }
            SwarmEvent::Behaviour(ComposedEvent::Ping(ping::Event { peer, result: Ok(rtt), .. })) => {
                debug!("Ping to {} took {:?}", peer, rtt);
            }
            _ => {}
        }
    }

    fn handle_query_result(&mut self, id: kad::QueryId, result: kad::QueryResult) {
        match result {
            kad::QueryResult::GetClosestPeers(result) => {
                let Some((target, reply)) = self.pending_lookups.remove(&id) else {
                    return;
                };

                let mut addresses: Vec<Multiaddr> = match result {
                    Ok(ok) => ok.peers.into_iter()
                        .filter(|info| info.peer_id == target)
                        .flat_map(|info| info.addrs)
                        .collect(),
                    Err(e) => {
                        warn!("Closest peers query for {} failed: {}", target, e);
                        Vec::new()
                    }
                };
                if addresses.is_empty() {
                    addresses = self.routing_table_addresses(&target);
                }

                let result = if addresses.is_empty() {
                    Err(NetworkError::PeerNotFound(target.to_string()))
                } else {
                    Ok(addresses)
                };
                let _ = reply.send(result);
            }
            kad::QueryResult::Bootstrap(Ok(ok)) => {
                debug!("Bootstrap step reached {}, {} remaining", ok.peer, ok.num_remaining);
            }
            kad::QueryResult::Bootstrap(Err(e)) => {
                warn!("Routing table bootstrap failed: {}", e);
            }
            _ => {}
        }
    }

    /// Hand an inbound message to every live subscriber
    fn dispatch(&mut self, message: InboundMessage) {
        self.subscribers.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!("Inbound subscriber is full, dropping {}", message);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
