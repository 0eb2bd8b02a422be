//! Common types used throughout Rivulet.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Offset within a stream. Offsets are dense, start at 0, and are assigned
/// by the stream leader at append time. `-1` denotes "no offset" (empty log,
/// nothing committed).
pub type Offset = i64;

/// Timestamp in milliseconds since epoch.
pub type Timestamp = i64;

/// Leader epoch counter, incremented on every leadership change.
pub type Epoch = u64;

/// Node identifier in the cluster.
pub type NodeId = String;

/// Stream identifier: the pub/sub subject messages are published to, plus a
/// unique stream name within that subject.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamId {
    pub subject: String,
    pub name: String,
}

impl StreamId {
    pub fn new(subject: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[subject={}, name={}]", self.subject, self.name)
    }
}

/// A single message in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub offset: Offset,
    pub timestamp: Timestamp,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl Message {
    /// Approximate in-memory/wire size, used for batch budgeting.
    pub fn size(&self) -> usize {
        let key_len = self.key.as_ref().map_or(0, Vec::len);
        let header_len: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        key_len + self.value.len() + header_len + 24
    }
}

/// Acknowledgement policy for publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// No ack is sent.
    None,
    /// Ack once the leader has written the message to its log.
    Leader,
    /// Ack once the message is replicated to every ISR member.
    All,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPosition {
    /// The first retained message.
    Earliest,
    /// The last message in the stream.
    Latest,
    /// A specific offset.
    Offset(Offset),
    /// The first message with a timestamp at or after the given time.
    Timestamp(Timestamp),
    /// Only messages published after the subscription is created.
    NewOnly,
}
