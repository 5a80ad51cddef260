//! Node configuration module
//!
//! This module provides the configuration object a node is constructed
//! from, together with the seed-based port conventions.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::{NetworkError, NetworkResult};

/// Base of the overlay listen ports, `listen_port = port_base + seed`
pub const DEFAULT_PORT_BASE: u16 = 10000;

/// Base of the control plane ports, `rpc_port = rpc_port_base + seed`
pub const DEFAULT_RPC_PORT_BASE: u16 = 13000;

/// Total number of logical shards in the network
pub const DEFAULT_NUM_SHARDS: u64 = 100;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and port seed, 0 for a non-reproducible identity
    pub seed: i64,
    /// Base of the overlay listen ports
    pub port_base: u16,
    /// Base of the control plane ports
    pub rpc_port_base: u16,
    /// Number of shards, valid shard ids are `[0, num_shards)`
    pub num_shards: u64,
    /// IP the overlay listener binds to
    pub listen_ip: IpAddr,
    /// IP the control plane binds to
    pub rpc_ip: IpAddr,
    /// Peers to connect to before bootstrapping the routing table
    pub bootstrap_peers: Vec<String>,
    /// Delay between bootstrap connection attempts
    pub bootstrap_dial_interval_ms: u64,
    /// Delay between consecutive shard subscriptions at startup
    pub subscription_delay_ms: u64,
    /// Delay between the interest announcement and the first collation
    pub settle_delay_ms: u64,
    /// Gossipsub heartbeat interval
    pub gossip_heartbeat_ms: u64,
    /// Largest gossip message the node sends or accepts
    pub max_transmit_size: usize,
    /// How long a connection without active streams is kept open
    pub idle_connection_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            port_base: DEFAULT_PORT_BASE,
            rpc_port_base: DEFAULT_RPC_PORT_BASE,
            num_shards: DEFAULT_NUM_SHARDS,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rpc_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bootstrap_peers: Vec::new(),
            bootstrap_dial_interval_ms: 1000,
            subscription_delay_ms: 30,
            settle_delay_ms: 500,
            gossip_heartbeat_ms: 1000,
            max_transmit_size: 2 * 1024 * 1024,
            idle_connection_timeout_secs: 60,
        }
    }
}

impl NodeConfig {
    /// Create a default configuration for the given seed
    pub fn with_seed(seed: i64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Check the configuration for values the node cannot run with
    pub fn validate(&self) -> NetworkResult<()> {
        if self.num_shards == 0 {
            return Err(NetworkError::ConfigError("num_shards must be positive".to_string()));
        }
        if self.max_transmit_size < crate::dissemination::COLLATION_PAYLOAD_SIZE + 1024 {
            return Err(NetworkError::ConfigError(format!(
                "max_transmit_size {} cannot carry a collation",
                self.max_transmit_size
            )));
        }
        self.listen_port()?;
        self.rpc_port()?;
        Ok(())
    }

    /// Overlay port of the node with the given seed
    pub fn port_for_seed(&self, seed: i64) -> NetworkResult<u16> {
        offset_port(self.port_base, seed)
    }

    /// Control plane port of the node with the given seed
    pub fn rpc_port_for_seed(&self, seed: i64) -> NetworkResult<u16> {
        offset_port(self.rpc_port_base, seed)
    }

    /// Overlay port of this node
    pub fn listen_port(&self) -> NetworkResult<u16> {
        self.port_for_seed(self.seed)
    }

    /// Control plane port of this node
    pub fn rpc_port(&self) -> NetworkResult<u16> {
        self.rpc_port_for_seed(self.seed)
    }

    /// Multiaddress the overlay listens on
    pub fn listen_multiaddr(&self) -> NetworkResult<Multiaddr> {
        let proto = match self.listen_ip {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        format!("/{}/{}/tcp/{}", proto, self.listen_ip, self.listen_port()?)
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{}", e)))
    }

    /// Socket address of the control plane
    pub fn rpc_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(SocketAddr::new(self.rpc_ip, self.rpc_port()?))
    }

    pub fn bootstrap_dial_interval(&self) -> Duration {
        Duration::from_millis(self.bootstrap_dial_interval_ms)
    }

    pub fn subscription_delay(&self) -> Duration {
        Duration::from_millis(self.subscription_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn gossip_heartbeat(&self) -> Duration {
        Duration::from_millis(self.gossip_heartbeat_ms)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }
}

fn offset_port(base: u16, seed: i64) -> NetworkResult<u16> {
    i64::from(base)
        .checked_add(seed)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| NetworkError::ConfigError(format!("port {} + seed {} is out of range", base, seed)))
}
