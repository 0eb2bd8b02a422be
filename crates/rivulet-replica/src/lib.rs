//! Per-stream replication engine for Rivulet.
//!
//! Each stream is replicated across a configured set of nodes; one replica
//! leads, the rest follow. The leader accepts publishes, tracks per-follower
//! progress, advances the high watermark, and maintains the in-sync replica
//! set through the controller. Followers fetch from the leader's epoch-scoped
//! inbox and reconcile their logs over the epoch handshake on every
//! leadership change, so no two replicas ever hold divergent committed
//! history.

pub mod client;
pub mod controller;
pub mod error;
mod follower;
mod leader;
pub mod node;
pub mod pending;
pub mod replica;

pub use client::{PublishAck, PublishOptions, StreamClient};
pub use controller::{Controller, ControllerEvent, IsrChange, LocalController, StreamUpdate};
pub use error::{ReplicaError, Result};
pub use node::Node;
pub use replica::{MessageStream, StreamReplica};
