//! Replication configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the per-stream replication engine.
///
/// All intervals are expressed in milliseconds so the struct can be loaded
/// from any serde-compatible config source; `Duration` accessors are provided
/// for call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Window beyond which a silent or lagging follower leaves the ISR.
    #[serde(default = "default_replica_max_lag_time_ms")]
    pub replica_max_lag_time_ms: u64,

    /// Number of messages a follower may trail the leader's newest offset
    /// before it is considered lagging.
    #[serde(default = "default_replica_max_lag_messages")]
    pub replica_max_lag_messages: u64,

    /// Per-fetch RPC timeout for follower replication requests.
    #[serde(default = "default_replica_fetch_timeout_ms")]
    pub replica_fetch_timeout_ms: u64,

    /// How long a follower tolerates an unresponsive leader before reporting
    /// it unreachable to the controller.
    #[serde(default = "default_replica_max_leader_timeout_ms")]
    pub replica_max_leader_timeout_ms: u64,

    /// Minimum ISR size required to admit publishes.
    #[serde(default = "default_min_isr")]
    pub min_isr: usize,

    /// Default per-stream replica count.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Maximum log segment size before rolling to a new segment.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Maximum total message bytes returned by one replication fetch.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,

    /// Interval at which the high watermark is persisted to disk.
    #[serde(default = "default_hw_checkpoint_interval_ms")]
    pub hw_checkpoint_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_max_lag_time_ms: default_replica_max_lag_time_ms(),
            replica_max_lag_messages: default_replica_max_lag_messages(),
            replica_fetch_timeout_ms: default_replica_fetch_timeout_ms(),
            replica_max_leader_timeout_ms: default_replica_max_leader_timeout_ms(),
            min_isr: default_min_isr(),
            replication_factor: default_replication_factor(),
            max_segment_bytes: default_max_segment_bytes(),
            max_batch_bytes: default_max_batch_bytes(),
            hw_checkpoint_interval_ms: default_hw_checkpoint_interval_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn replica_max_lag_time(&self) -> Duration {
        Duration::from_millis(self.replica_max_lag_time_ms)
    }

    pub fn replica_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_fetch_timeout_ms)
    }

    pub fn replica_max_leader_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_max_leader_timeout_ms)
    }

    pub fn hw_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.hw_checkpoint_interval_ms)
    }

    /// Interval of the leader-side ISR liveness check. Must not exceed the
    /// lag window or a silent follower could outlive it undetected.
    pub fn isr_check_interval(&self) -> Duration {
        Duration::from_millis((self.replica_max_lag_time_ms / 2).max(10))
    }
}

fn default_replica_max_lag_time_ms() -> u64 {
    10_000
}

fn default_replica_max_lag_messages() -> u64 {
    10_000
}

fn default_replica_fetch_timeout_ms() -> u64 {
    3_000
}

fn default_replica_max_leader_timeout_ms() -> u64 {
    10_000
}

fn default_min_isr() -> usize {
    1
}

fn default_replication_factor() -> usize {
    1
}

fn default_max_segment_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_batch_bytes() -> u64 {
    1024 * 1024
}

fn default_hw_checkpoint_interval_ms() -> u64 {
    5_000
}
