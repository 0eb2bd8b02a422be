//! Replication and client wire frames.
//!
//! Each subject carries exactly one frame type, so frames are standalone
//! bincode-encoded structs rather than a tagged envelope. Within a single
//! [`ReplicationResponse`] the batch is contiguous and ordered; everything
//! else about delivery is best-effort and handled by the protocol logic.

use bytes::Bytes;
use rivulet_common::{AckPolicy, Epoch, Message, NodeId, Offset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Follower → leader: send batches starting at `fetch_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub replica_id: NodeId,
    pub fetch_offset: Offset,
    pub leader_epoch: Epoch,
}

/// Leader → follower: a batch (possibly empty) plus the leader's committed
/// frontier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResponse {
    pub leader_epoch: Epoch,
    pub leader_hw: Offset,
    pub batch: Vec<Message>,
}

/// Leader → follower: a fetch was rejected rather than served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationError {
    pub kind: ErrorKind,
    pub message: String,
    /// The leader's current epoch, so a stale sender can re-read metadata.
    pub leader_epoch: Epoch,
}

/// Envelope for replies on the replication inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchReply {
    Batch(ReplicationResponse),
    Error(ReplicationError),
}

/// Follower → leader at startup or rejoin: locate a safe truncation point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderEpochRequest {
    pub replica_id: NodeId,
    pub follower_epoch: Epoch,
}

/// Leader → follower: the greatest offset still valid under the follower's
/// epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderEpochResponse {
    pub last_offset_in_epoch: Offset,
}

/// Client → leader: publish one message to a stream subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub ack_policy: AckPolicy,
    pub correlation_id: String,
    /// Inbox acks are delivered to; when absent the reply subject is used.
    pub ack_inbox: Option<String>,
}

/// Error kinds surfaced over the wire, to publishers and fetching replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Retriable: leader not assigned, ISR below the publish gate, or a
    /// temporary transport failure.
    TransientUnavailable,
    /// The addressed node is not the leader; refresh routing.
    NotLeader { leader: Option<NodeId> },
    /// The sender used an old leader epoch.
    StaleEpoch,
    /// Requested offset outside the retained range.
    OffsetOutOfRange,
    /// The publish was accepted but not committed within the deadline.
    Timeout,
    Cancelled,
    Internal,
}

/// Leader → publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishReply {
    Ack {
        offset: Offset,
        correlation_id: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
        correlation_id: String,
    },
}

/// Encode a frame for the wire.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(frame)?))
}

/// Decode a frame received from the wire.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}
