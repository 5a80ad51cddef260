use prometheus::{IntCounter, IntGauge, Registry};

use crate::{NetworkError, NetworkResult};

/// Node metrics collector
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,

    // Connection metrics
    peers_connected: IntGauge,
    connection_attempts: IntCounter,
    connection_failures: IntCounter,

    // Shard traffic metrics
    collations_sent: IntCounter,
    collation_bytes_sent: IntCounter,
    collations_received: IntCounter,
    announcements_sent: IntCounter,
    announcements_received: IntCounter,
}

impl NodeMetrics {
    /// Create a new NodeMetrics instance
    pub fn new() -> NetworkResult<Self> {
        let registry = Registry::new();

        let peers_connected = IntGauge::new("shardp2p_peers_connected", "Number of connected peers")
            .map_err(metrics_error)?;
        let connection_attempts = counter("shardp2p_connection_attempts", "Number of connection attempts")?;
        let connection_failures = counter("shardp2p_connection_failures", "Number of failed connections")?;
        let collations_sent = counter("shardp2p_collations_sent", "Number of collations handed to the overlay")?;
        let collation_bytes_sent = counter("shardp2p_collation_bytes_sent", "Encoded bytes of collations sent")?;
        let collations_received = counter("shardp2p_collations_received", "Number of collations received for subscribed shards")?;
        let announcements_sent = counter("shardp2p_announcements_sent", "Number of shard interest announcements published")?;
        let announcements_received = counter("shardp2p_announcements_received", "Number of shard interest announcements received")?;

        registry.register(Box::new(peers_connected.clone())).map_err(metrics_error)?;
        registry.register(Box::new(connection_attempts.clone())).map_err(metrics_error)?;
        registry.register(Box::new(connection_failures.clone())).map_err(metrics_error)?;
        registry.register(Box::new(collations_sent.clone())).map_err(metrics_error)?;
        registry.register(Box::new(collation_bytes_sent.clone())).map_err(metrics_error)?;
        registry.register(Box::new(collations_received.clone())).map_err(metrics_error)?;
        registry.register(Box::new(announcements_sent.clone())).map_err(metrics_error)?;
        registry.register(Box::new(announcements_received.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            peers_connected,
            connection_attempts,
            connection_failures,
            collations_sent,
            collation_bytes_sent,
            collations_received,
            announcements_sent,
            announcements_received,
        })
    }

    pub fn set_peers_connected(&self, count: usize) {
        self.peers_connected.set(count as i64);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.inc();
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.inc();
    }

    pub fn record_collation_sent(&self, bytes: usize) {
        self.collations_sent.inc();
        self.collation_bytes_sent.inc_by(bytes as u64);
    }

    pub fn record_collation_received(&self) {
        self.collations_received.inc();
    }

    pub fn record_announcement_sent(&self) {
        self.announcements_sent.inc();
    }

    pub fn record_announcement_received(&self) {
        self.announcements_received.inc();
    }

    pub fn collations_sent(&self) -> u64 {
        self.collations_sent.get()
    }

    pub fn collations_received(&self) -> u64 {
        self.collations_received.get()
    }

    pub fn announcements_sent(&self) -> u64 {
        self.announcements_sent.get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode_text(&self) -> NetworkResult<Vec<u8>> {
        use prometheus::{Encoder, TextEncoder};

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

fn counter(name: &str, help: &str) -> NetworkResult<IntCounter> {
    IntCounter::new(name, help).map_err(metrics_error)
}

fn metrics_error(e: prometheus::Error) -> NetworkError {
    NetworkError::ConfigError(format!("metrics: {}", e))
}
