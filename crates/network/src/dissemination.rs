//! Collation traffic generation
//!
//! A workload of `n` shards starts one worker per shard, staggered by the
//! interval, and each worker sends its collations one `interval * n` apart.
//! Workers share nothing but the sink, so the sink must accept concurrent
//! callers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::messages::ShardId;
use crate::{NetworkError, NetworkResult};

/// Payload size of every generated collation, just under 1 MiB
pub const COLLATION_PAYLOAD_SIZE: usize = (1 << 20) - 100;

/// Destination of generated collations
#[async_trait]
pub trait CollationSink: Send + Sync + 'static {
    /// Hand one collation to the network; `Ok` only means accepted for transmission
    async fn send_collation(&self, shard_id: ShardId, number: i64, payload: Vec<u8>) -> NetworkResult<()>;
}

/// Parameters of a dissemination workload, parsed from `<numShards>,<numCollations>,<intervalMs>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPlan {
    pub num_shards: u64,
    pub num_collations: u64,
    pub interval_ms: u64,
}

impl SendPlan {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reject workloads that address shards outside `[0, num_shards)`
    pub fn check_shards(&self, num_shards: u64) -> NetworkResult<()> {
        if self.num_shards > num_shards {
            return Err(NetworkError::InvalidShard {
                shard: self.num_shards - 1,
                num_shards,
            });
        }
        Ok(())
    }

    /// Spacing between two sends of the same worker
    pub fn send_period(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(self.num_shards))
    }
}

impl fmt::Display for SendPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.num_shards, self.num_collations, self.interval_ms)
    }
}

impl FromStr for SendPlan {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 3 {
            return Err(NetworkError::InvalidSendOption(s.to_string()));
        }

        let parse = |field: &str| field.trim().parse::<u64>()
            .map_err(|_| NetworkError::InvalidSendOption(s.to_string()));

        Ok(Self {
            num_shards: parse(fields[0])?,
            num_collations: parse(fields[1])?,
            interval_ms: parse(fields[2])?,
        })
    }
}

/// Start the workload's workers, one per shard in `[0, num_shards)`
///
/// Worker `i` is spawned `(i + 1) * interval` after the call; the call
/// returns once the last worker has been spawned. The handles complete
/// when their worker has sent all of its collations.
pub async fn launch(sink: Arc<dyn CollationSink>, plan: SendPlan) -> Vec<JoinHandle<()>> {
    info!("Starting collation workload {}", plan);
    let mut workers = Vec::new();

    for shard_id in 0..plan.num_shards {
        sleep(plan.interval()).await;
        workers.push(tokio::spawn(run_worker(sink.clone(), shard_id, plan)));
    }

    workers
}

/// Send one shard's collations in order, numbered from zero
async fn run_worker(sink: Arc<dyn CollationSink>, shard_id: ShardId, plan: SendPlan) {
    let period = plan.send_period();

    for number in 0..plan.num_collations as i64 {
        sleep(period).await;
        match sink.send_collation(shard_id, number, vec![0u8; COLLATION_PAYLOAD_SIZE]).await {
            Ok(()) => debug!("Sent collation {} of shard {}", number, shard_id),
            Err(e) => warn!("Failed to send collation {} of shard {}: {}", number, shard_id, e),
        }
    }

    debug!("Worker for shard {} finished", shard_id);
}
