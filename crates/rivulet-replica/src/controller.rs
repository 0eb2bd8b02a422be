//! Controller interface.
//!
//! The external metadata service owns stream creation and deletion, replica
//! assignment, leader election, ISR change acceptance, and epoch numbering.
//! The core only observes `{leader, replicas, isr, epoch}` transitions —
//! delivered at least once and monotonic in epoch per stream — and calls back
//! to propose ISR changes or hint that a leader is unreachable.
//!
//! [`LocalController`] is an in-process implementation used by tests and
//! embedded single-process clusters; it elects the first reachable in-sync
//! replica when a leader is reported unreachable.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rivulet_common::{Epoch, NodeId, StreamId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Authoritative per-stream metadata transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub stream: StreamId,
    pub leader: NodeId,
    pub replicas: Vec<NodeId>,
    pub isr: Vec<NodeId>,
    pub epoch: Epoch,
}

/// Events delivered to a node's observer.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StreamUpdated(StreamUpdate),
    StreamDeleted(StreamId),
}

/// Outcome of a proposed ISR change.
#[derive(Debug, Clone)]
pub struct IsrChange {
    pub accepted: bool,
    pub epoch: Epoch,
    pub isr: Vec<NodeId>,
}

/// Core-facing controller operations.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Leader-initiated ISR shrink or expansion. The in-memory ISR is only
    /// updated once the controller confirms.
    async fn propose_isr_change(
        &self,
        stream: &StreamId,
        epoch: Epoch,
        new_isr: Vec<NodeId>,
    ) -> Result<IsrChange>;

    /// Follower-initiated election hint.
    async fn report_unreachable_leader(&self, stream: &StreamId, epoch: Epoch) -> Result<()>;
}

struct NodeHandle {
    tx: mpsc::UnboundedSender<ControllerEvent>,
    online: bool,
}

struct StreamMeta {
    replicas: Vec<NodeId>,
    isr: Vec<NodeId>,
    leader: NodeId,
    epoch: Epoch,
}

#[derive(Default)]
struct ControllerInner {
    nodes: HashMap<NodeId, NodeHandle>,
    streams: HashMap<StreamId, StreamMeta>,
}

/// In-process metadata authority.
#[derive(Default)]
pub struct LocalController {
    inner: Mutex<ControllerInner>,
}

impl LocalController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register, after a restart) a node's observer. Current
    /// state for every stream the node replicates is re-delivered, which is
    /// the at-least-once contract observers must tolerate.
    pub fn register_node(&self, node_id: &NodeId) -> mpsc::UnboundedReceiver<ControllerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.nodes.insert(
            node_id.clone(),
            NodeHandle {
                tx: tx.clone(),
                online: true,
            },
        );
        for (stream, meta) in &inner.streams {
            if meta.replicas.contains(node_id) {
                let _ = tx.send(ControllerEvent::StreamUpdated(StreamUpdate {
                    stream: stream.clone(),
                    leader: meta.leader.clone(),
                    replicas: meta.replicas.clone(),
                    isr: meta.isr.clone(),
                    epoch: meta.epoch,
                }));
            }
        }
        rx
    }

    /// Mark a node reachable or not. Unreachable nodes are skipped by leader
    /// elections and no longer receive events.
    pub fn set_node_online(&self, node_id: &NodeId, online: bool) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.nodes.get_mut(node_id) {
            handle.online = online;
        }
    }

    /// Create a stream with the given replica set. The first replica starts
    /// as leader and the ISR is the full replica set.
    pub fn create_stream(&self, stream: StreamId, replicas: Vec<NodeId>) {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(&stream) {
            warn!(stream = %stream, "Stream already exists");
            return;
        }
        let leader = replicas[0].clone();
        info!(stream = %stream, ?replicas, leader = %leader, "Creating stream");
        inner.streams.insert(
            stream.clone(),
            StreamMeta {
                replicas: replicas.clone(),
                isr: replicas,
                leader,
                epoch: 1,
            },
        );
        Self::broadcast(&mut inner, &stream);
    }

    pub fn delete_stream(&self, stream: &StreamId) {
        let mut inner = self.inner.lock();
        let Some(meta) = inner.streams.remove(stream) else {
            return;
        };
        let replicas = meta.replicas;
        for node_id in &replicas {
            if let Some(handle) = inner.nodes.get(node_id) {
                let _ = handle.tx.send(ControllerEvent::StreamDeleted(stream.clone()));
            }
        }
    }

    /// Elect a new leader among reachable ISR members, bumping the epoch.
    /// Returns the new leader, or `None` when no candidate is reachable.
    pub fn elect_leader(&self, stream: &StreamId) -> Option<NodeId> {
        let mut inner = self.inner.lock();
        let candidate = {
            let meta = inner.streams.get(stream)?;
            meta.isr
                .iter()
                .find(|id| {
                    **id != meta.leader
                        && inner.nodes.get(*id).is_some_and(|h| h.online)
                })
                .cloned()?
        };
        let meta = inner.streams.get_mut(stream)?;
        meta.leader = candidate.clone();
        meta.epoch += 1;
        info!(stream = %stream, leader = %candidate, epoch = meta.epoch, "Elected new leader");
        Self::broadcast(&mut inner, stream);
        Some(candidate)
    }

    /// Current `(leader, epoch)` for a stream, for tests and tooling.
    pub fn stream_leader(&self, stream: &StreamId) -> Option<(NodeId, Epoch)> {
        let inner = self.inner.lock();
        let meta = inner.streams.get(stream)?;
        Some((meta.leader.clone(), meta.epoch))
    }

    pub fn stream_isr(&self, stream: &StreamId) -> Option<Vec<NodeId>> {
        let inner = self.inner.lock();
        Some(inner.streams.get(stream)?.isr.clone())
    }

    fn broadcast(inner: &mut ControllerInner, stream: &StreamId) {
        let Some(meta) = inner.streams.get(stream) else {
            return;
        };
        let update = StreamUpdate {
            stream: stream.clone(),
            leader: meta.leader.clone(),
            replicas: meta.replicas.clone(),
            isr: meta.isr.clone(),
            epoch: meta.epoch,
        };
        for node_id in &meta.replicas {
            if let Some(handle) = inner.nodes.get(node_id) {
                if handle.online {
                    let _ = handle.tx.send(ControllerEvent::StreamUpdated(update.clone()));
                }
            }
        }
    }
}

#[async_trait]
impl Controller for LocalController {
    async fn propose_isr_change(
        &self,
        stream: &StreamId,
        epoch: Epoch,
        new_isr: Vec<NodeId>,
    ) -> Result<IsrChange> {
        let mut inner = self.inner.lock();
        let Some(meta) = inner.streams.get_mut(stream) else {
            return Ok(IsrChange {
                accepted: false,
                epoch: 0,
                isr: Vec::new(),
            });
        };
        let valid = epoch == meta.epoch
            && !new_isr.is_empty()
            && new_isr.contains(&meta.leader)
            && new_isr.iter().all(|id| meta.replicas.contains(id));
        if !valid {
            debug!(stream = %stream, epoch, ?new_isr, "Rejected ISR change");
            return Ok(IsrChange {
                accepted: false,
                epoch: meta.epoch,
                isr: meta.isr.clone(),
            });
        }
        info!(stream = %stream, ?new_isr, "Accepted ISR change");
        meta.isr = new_isr.clone();
        let epoch = meta.epoch;
        Self::broadcast(&mut inner, stream);
        Ok(IsrChange {
            accepted: true,
            epoch,
            isr: new_isr,
        })
    }

    async fn report_unreachable_leader(&self, stream: &StreamId, epoch: Epoch) -> Result<()> {
        {
            let inner = self.inner.lock();
            let Some(meta) = inner.streams.get(stream) else {
                return Ok(());
            };
            // A report against an old epoch raced with an election that
            // already handled it.
            if epoch < meta.epoch {
                return Ok(());
            }
        }
        info!(stream = %stream, epoch, "Leader reported unreachable");
        self.elect_leader(stream);
        Ok(())
    }
}
