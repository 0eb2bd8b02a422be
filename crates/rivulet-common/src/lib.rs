//! Common types and configuration shared across Rivulet crates.

pub mod config;
pub mod types;

pub use config::ReplicationConfig;
pub use types::{
    AckPolicy, Epoch, Message, NodeId, Offset, StartPosition, StreamId, Timestamp,
};
