//! Pub/sub bus abstraction.
//!
//! Inter-node messaging is carried over an external pub/sub transport that is
//! only required to provide best-effort delivery: messages may be dropped,
//! duplicated, or reordered between requests. Request/reply is layered on top
//! with per-request reply inboxes. The in-memory implementation backs tests
//! and single-process clusters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, TransportError};

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Pub/sub transport used for client publishes and inter-node replication.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` to `subject`, fire-and-forget.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish with a reply inbox the receiver can respond to.
    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to all messages on `subject`.
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Publish to `subject` and await a single reply on a fresh inbox.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<BusMessage>;

    /// A unique inbox subject for replies.
    fn new_inbox(&self) -> String;
}

/// A stream of messages for one subject. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    registry: Arc<SubjectRegistry>,
    id: u64,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.subject, self.id);
    }
}

#[derive(Default)]
struct SubjectRegistry {
    subscribers: DashMap<String, Vec<(u64, mpsc::UnboundedSender<BusMessage>)>>,
}

impl SubjectRegistry {
    fn add(&self, subject: &str, id: u64, tx: mpsc::UnboundedSender<BusMessage>) {
        self.subscribers
            .entry(subject.to_string())
            .or_default()
            .push((id, tx));
    }

    fn remove(&self, subject: &str, id: u64) {
        let now_empty = match self.subscribers.get_mut(subject) {
            Some(mut entry) => {
                entry.retain(|(sub_id, _)| *sub_id != id);
                entry.is_empty()
            }
            None => false,
        };
        // Drop dead subjects, reply inboxes in particular, or the registry
        // grows by one entry per request ever made.
        if now_empty {
            self.subscribers.remove_if(subject, |_, subs| subs.is_empty());
        }
    }

    fn deliver(&self, message: &BusMessage) {
        if let Some(mut entry) = self.subscribers.get_mut(&message.subject) {
            entry.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        }
    }
}

/// In-process bus delivering messages to exact-subject subscribers.
#[derive(Default)]
pub struct InMemoryBus {
    registry: Arc<SubjectRegistry>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.registry.deliver(&BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        });
        Ok(())
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.registry.deliver(&BusMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.add(subject, id, tx);
        Ok(Subscription {
            subject: subject.to_string(),
            rx,
            registry: Arc::clone(&self.registry),
            id,
        })
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<BusMessage> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, &inbox, payload).await?;
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::RequestTimeout {
                subject: subject.to_string(),
            }),
        }
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("foo").await.unwrap();

        bus.publish("foo", Bytes::from_static(b"hello")).await.unwrap();
        let message = sub.next().await.unwrap();
        assert_eq!(message.payload.as_ref(), b"hello");
        assert_eq!(message.reply, None);
    }

    #[tokio::test]
    async fn test_no_delivery_across_subjects() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("foo").await.unwrap();

        bus.publish("bar", Bytes::from_static(b"x")).await.unwrap();
        bus.publish("foo", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().payload.as_ref(), b"y");
    }

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = InMemoryBus::new();
        let mut sub1 = bus.subscribe("foo").await.unwrap();
        let mut sub2 = bus.subscribe("foo").await.unwrap();

        bus.publish("foo", Bytes::from_static(b"m")).await.unwrap();
        assert_eq!(sub1.next().await.unwrap().payload.as_ref(), b"m");
        assert_eq!(sub2.next().await.unwrap().payload.as_ref(), b"m");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = Arc::new(InMemoryBus::new());

        let responder_bus = Arc::clone(&bus);
        let mut service = bus.subscribe("service").await.unwrap();
        tokio::spawn(async move {
            while let Some(message) = service.next().await {
                if let Some(reply) = message.reply {
                    responder_bus
                        .publish(&reply, Bytes::from_static(b"pong"))
                        .await
                        .unwrap();
                }
            }
        });

        let reply = bus
            .request("service", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload.as_ref(), b"pong");
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let bus = InMemoryBus::new();
        let result = bus
            .request("nobody", Bytes::new(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TransportError::RequestTimeout { .. })));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("foo").await.unwrap();
        drop(sub);

        // Delivering to a dropped subscription must not error, and the
        // subject entry itself is gone.
        bus.publish("foo", Bytes::from_static(b"m")).await.unwrap();
        assert!(bus.registry.subscribers.get("foo").is_none());
    }
}
