//! Canonical peer addresses
//!
//! `/ip4/<ip>/tcp/<port>/p2p/<peerID>`; the legacy `/ipfs/` transport id is
//! accepted when parsing.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::config::NodeConfig;
use crate::identity::Identity;
use crate::{NetworkError, NetworkResult};

/// A dialable address of a specific peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub peer_id: PeerId,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16, peer_id: PeerId) -> Self {
        Self { ip, port, peer_id }
    }

    /// Address of the node with the given seed, following the port convention
    pub fn for_seed(ip: IpAddr, seed: i64, config: &NodeConfig) -> NetworkResult<Self> {
        let peer_id = Identity::peer_id_for_seed(seed)?;
        let port = config.port_for_seed(seed)?;
        Ok(Self::new(ip, port, peer_id))
    }

    /// Whether both addresses name the same peer, whatever the transport path
    pub fn same_peer(&self, other: &PeerAddress) -> bool {
        self.peer_id == other.peer_id
    }

    /// Transport part of the address, without the peer id
    pub fn transport_multiaddr(&self) -> Multiaddr {
        let mut addr = Multiaddr::empty();
        addr.push(match self.ip {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        });
        addr.push(Protocol::Tcp(self.port));
        addr
    }

    /// Full address including the peer id
    pub fn to_multiaddr(&self) -> Multiaddr {
        self.transport_multiaddr().with(Protocol::P2p(self.peer_id))
    }

    /// Split a full multiaddress into its components
    pub fn from_multiaddr(addr: &Multiaddr) -> NetworkResult<Self> {
        let mut ip = None;
        let mut port = None;
        let mut peer_id = None;

        for proto in addr.iter() {
            match proto {
                Protocol::Ip4(v4) if ip.is_none() => ip = Some(IpAddr::V4(v4)),
                Protocol::Ip6(v6) if ip.is_none() => ip = Some(IpAddr::V6(v6)),
                Protocol::Tcp(p) if port.is_none() => port = Some(p),
                Protocol::P2p(id) => peer_id = Some(id),
                other => {
                    return Err(NetworkError::InvalidAddress(format!(
                        "unexpected component {} in {}",
                        other, addr
                    )))
                }
            }
        }

        match (ip, port, peer_id) {
            (Some(ip), Some(port), Some(peer_id)) => Ok(Self::new(ip, port, peer_id)),
            _ => Err(NetworkError::InvalidAddress(format!(
                "{} must contain an ip, a tcp port and a peer id",
                addr
            ))),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_multiaddr())
    }
}

impl FromStr for PeerAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s.parse::<Multiaddr>()
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", s, e)))?;
        Self::from_multiaddr(&addr)
    }
}
