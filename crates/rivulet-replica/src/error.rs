//! Replication engine error types.

use rivulet_common::{NodeId, Offset};
use rivulet_log::LogError;
use rivulet_transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicaError>;

#[derive(Error, Debug)]
pub enum ReplicaError {
    /// Retriable: leader not assigned, ISR below the publish gate, or a
    /// temporary transport failure.
    #[error("Temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("Not the stream leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("Stale leader epoch {request}, current is {current}")]
    StaleEpoch { request: u64, current: u64 },

    #[error("Offset {offset} out of range ({oldest}..={newest})")]
    OffsetOutOfRange {
        offset: Offset,
        oldest: Offset,
        newest: Offset,
    },

    #[error("Subscriber cursor at offset {0} was overtaken by truncation")]
    Truncated(Offset),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out waiting for the publish to commit")]
    AckTimeout,

    #[error("Publish failed: {kind:?}: {message}")]
    PublishFailed {
        kind: rivulet_transport::frames::ErrorKind,
        message: String,
    },

    #[error("Stream not found")]
    NoSuchStream,

    /// Local storage failure; the replica's role loop exits and the node
    /// keeps serving its other streams.
    #[error("Storage failure: {0}")]
    Fatal(LogError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Controller rejected ISR change")]
    IsrChangeRejected,
}

impl From<LogError> for ReplicaError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::OffsetOutOfRange {
                offset,
                oldest,
                newest,
            } => Self::OffsetOutOfRange {
                offset,
                oldest,
                newest,
            },
            other => Self::Fatal(other),
        }
    }
}
