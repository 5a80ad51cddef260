//! In-memory overlay for unit tests

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;

use crate::address::PeerAddress;
use crate::{InboundMessage, NetworkError, NetworkResult, OverlayService};

#[derive(Default)]
struct MockState {
    published: Vec<(String, Vec<u8>)>,
    topics: BTreeSet<String>,
    connects: Vec<PeerId>,
    lookups: HashMap<PeerId, Vec<Multiaddr>>,
    subscribers: Vec<mpsc::Sender<InboundMessage>>,
    fail_publish: bool,
    fail_connect: bool,
}

/// Records every call and lets tests inject inbound messages
pub struct MockOverlay {
    peer_id: PeerId,
    state: Mutex<MockState>,
}

impl MockOverlay {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published().into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, data)| data)
            .collect()
    }

    pub fn topics(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().topics.clone()
    }

    pub fn connect_calls(&self) -> Vec<PeerId> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn set_lookup(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) {
        self.state.lock().unwrap().lookups.insert(peer_id, addresses);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.lock().unwrap().fail_publish = fail;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    /// Deliver a gossip message as if it came from `source`
    pub async fn deliver(&self, source: PeerId, topic: &str, data: Vec<u8>) {
        let subscribers = self.state.lock().unwrap().subscribers.clone();
        for tx in subscribers {
            let message = InboundMessage { source, topic: topic.to_string(), data: data.clone() };
            tx.send(message).await.unwrap();
        }
    }
}

#[async_trait]
impl OverlayService for MockOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn listen_addresses(&self) -> NetworkResult<Vec<Multiaddr>> {
        Ok(vec!["/ip4/127.0.0.1/tcp/10001".parse().unwrap()])
    }

    async fn bootstrap(&self, known_peers: &[PeerAddress]) -> NetworkResult<()> {
        for peer in known_peers {
            self.state.lock().unwrap().connects.push(peer.peer_id);
        }
        Ok(())
    }

    async fn lookup(&self, peer_id: PeerId) -> NetworkResult<Vec<Multiaddr>> {
        self.state.lock().unwrap().lookups.get(&peer_id).cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))
    }

    async fn add_address(&self, _peer_id: PeerId, _address: Multiaddr) -> NetworkResult<()> {
        Ok(())
    }

    async fn connect(&self, peer_id: PeerId, _addresses: Vec<Multiaddr>) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(NetworkError::ConnectionFailed(peer_id.to_string()));
        }
        state.connects.push(peer_id);
        Ok(())
    }

    async fn connected_peers(&self) -> NetworkResult<Vec<PeerId>> {
        Ok(self.state.lock().unwrap().connects.clone())
    }

    async fn subscribe(&self, topic: &str) -> NetworkResult<()> {
        self.state.lock().unwrap().topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> NetworkResult<()> {
        self.state.lock().unwrap().topics.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_publish {
            return Err(NetworkError::ProtocolError(format!("publish on {}: no peers", topic)));
        }
        state.published.push((topic.to_string(), data));
        Ok(())
    }

    async fn subscribe_messages(&self) -> NetworkResult<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().subscribers.push(tx);
        Ok(rx)
    }
}
