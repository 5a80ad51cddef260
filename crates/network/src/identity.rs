//! Seed-based node identity
//!
//! A non-zero seed always yields the same key pair and peer id, on any
//! machine and in any run, so nodes in a test topology can refer to each
//! other by seed alone. Seed 0 draws the key from the OS entropy source.
//! Small integer seeds are trivially guessable; this scheme is meant for
//! simulations and development networks.

use std::fmt;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::{NetworkError, NetworkResult};

/// Length of an Ed25519 secret key
const SECRET_KEY_LEN: usize = 32;

/// The key material and peer id of a node
#[derive(Clone)]
pub struct Identity {
    seed: i64,
    keypair: Keypair,
    peer_id: PeerId,
}

impl Identity {
    /// Derive the identity for a seed
    pub fn derive(seed: i64) -> NetworkResult<Self> {
        let mut secret = [0u8; SECRET_KEY_LEN];
        if seed == 0 {
            OsRng.try_fill_bytes(&mut secret)
                .map_err(|e| NetworkError::IdentityError(format!("entropy source failed: {}", e)))?;
        } else {
            ChaCha20Rng::seed_from_u64(seed as u64).fill_bytes(&mut secret);
        }

        let keypair = Keypair::ed25519_from_bytes(secret)
            .map_err(|e| NetworkError::IdentityError(e.to_string()))?;
        let peer_id = keypair.public().to_peer_id();
        debug!("Derived peer id {} from seed {}", peer_id, seed);

        Ok(Self { seed, keypair, peer_id })
    }

    /// Resolve only the public identity of the node with the given seed
    pub fn peer_id_for_seed(seed: i64) -> NetworkResult<PeerId> {
        Self::derive(seed).map(|identity| identity.peer_id)
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("seed", &self.seed)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}
