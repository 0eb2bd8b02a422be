//! Publish client helper.
//!
//! Publishes are addressed to the stream subject on the bus; the leader of
//! every stream backed by that subject appends and acks per the requested
//! policy. The returned future is cancel-safe: dropping it abandons the wait
//! and the leader's ack lands on a reply inbox nobody reads.

use std::sync::Arc;
use std::time::Duration;

use rivulet_common::{AckPolicy, Offset};
use rivulet_transport::bus::MessageBus;
use rivulet_transport::frames::{self, ErrorKind, Publish, PublishReply};
use rivulet_transport::TransportError;
use uuid::Uuid;

use crate::error::{ReplicaError, Result};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub ack_policy: AckPolicy,
    /// How long to wait for the ack before surfacing a retriable timeout.
    pub timeout: Duration,
    /// Deliver the ack to this inbox instead of an inline reply.
    pub ack_inbox: Option<String>,
    /// Correlation id echoed back in the ack; generated when absent.
    pub correlation_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            key: None,
            value: Vec::new(),
            headers: Vec::new(),
            ack_policy: AckPolicy::Leader,
            timeout: Duration::from_secs(5),
            ack_inbox: None,
            correlation_id: None,
        }
    }
}

/// Ack returned to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub offset: Offset,
    pub correlation_id: String,
}

pub struct StreamClient {
    bus: Arc<dyn MessageBus>,
}

impl StreamClient {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Publish one message to `subject`. Returns `None` under
    /// [`AckPolicy::None`], the ack otherwise.
    pub async fn publish(&self, subject: &str, options: PublishOptions) -> Result<Option<PublishAck>> {
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let frame = Publish {
            key: options.key,
            value: options.value,
            headers: options.headers,
            ack_policy: options.ack_policy,
            correlation_id: correlation_id.clone(),
            ack_inbox: options.ack_inbox.clone(),
        };
        let payload = frames::encode(&frame)?;

        if options.ack_policy == AckPolicy::None {
            self.bus.publish(subject, payload).await?;
            return Ok(None);
        }

        let reply = match options.ack_inbox {
            Some(inbox) => {
                let mut sub = self.bus.subscribe(&inbox).await?;
                self.bus.publish(subject, payload).await?;
                match tokio::time::timeout(options.timeout, sub.next()).await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return Err(TransportError::Closed.into()),
                    Err(_) => return Err(ReplicaError::AckTimeout),
                }
            }
            None => self
                .bus
                .request(subject, payload, options.timeout)
                .await
                .map_err(|e| match e {
                    TransportError::RequestTimeout { .. } => ReplicaError::AckTimeout,
                    other => other.into(),
                })?,
        };
        parse_reply(&reply.payload, &correlation_id).map(Some)
    }
}

fn parse_reply(payload: &[u8], correlation_id: &str) -> Result<PublishAck> {
    match frames::decode::<PublishReply>(payload)? {
        PublishReply::Ack {
            offset,
            correlation_id: echoed,
        } => {
            if echoed != correlation_id {
                return Err(ReplicaError::PublishFailed {
                    kind: ErrorKind::Internal,
                    message: format!("correlation mismatch: sent {correlation_id}, got {echoed}"),
                });
            }
            Ok(PublishAck {
                offset,
                correlation_id: echoed,
            })
        }
        PublishReply::Error { kind, message, .. } => Err(match kind {
            ErrorKind::TransientUnavailable => ReplicaError::TransientUnavailable(message),
            ErrorKind::NotLeader { leader } => ReplicaError::NotLeader { leader },
            ErrorKind::Timeout => ReplicaError::AckTimeout,
            ErrorKind::Cancelled => ReplicaError::Cancelled,
            kind => ReplicaError::PublishFailed { kind, message },
        }),
    }
}
