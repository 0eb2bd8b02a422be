//! Per-node stream registry.
//!
//! A node hosts one replica per stream it is assigned to. It consumes the
//! controller's event feed, creating replicas (and their on-disk logs) on
//! first sight of a stream, routing updates through each replica's role
//! state machine, and tearing streams down on deletion. A storage failure in
//! one stream's role loop never stops the node from serving its other
//! streams.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use rivulet_common::{NodeId, ReplicationConfig, StartPosition, StreamId};
use rivulet_log::{CommitLog, LogConfig};
use rivulet_transport::bus::MessageBus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::controller::{Controller, ControllerEvent, StreamUpdate};
use crate::error::{ReplicaError, Result};
use crate::replica::{MessageStream, StreamReplica};

pub struct Node {
    node_id: NodeId,
    data_dir: PathBuf,
    config: ReplicationConfig,
    bus: Arc<dyn MessageBus>,
    controller: Arc<dyn Controller>,
    streams: DashMap<StreamId, Arc<StreamReplica>>,
    events_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Start a node consuming `events` from the controller.
    pub fn start(
        node_id: NodeId,
        data_dir: impl Into<PathBuf>,
        config: ReplicationConfig,
        bus: Arc<dyn MessageBus>,
        controller: Arc<dyn Controller>,
        events: mpsc::UnboundedReceiver<ControllerEvent>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            node_id,
            data_dir: data_dir.into(),
            config,
            bus,
            controller,
            streams: DashMap::new(),
            events_task: parking_lot::Mutex::new(None),
        });
        let task = tokio::spawn(events_loop(Arc::clone(&node), events));
        *node.events_task.lock() = Some(task);
        node
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The replica this node hosts for `stream`, if any.
    pub fn stream(&self, stream: &StreamId) -> Option<Arc<StreamReplica>> {
        self.streams.get(stream).map(|r| Arc::clone(&r))
    }

    /// Subscribe to committed messages from this node's replica of `stream`.
    pub fn subscribe(&self, stream: &StreamId, start: StartPosition) -> Result<MessageStream> {
        let replica = self.stream(stream).ok_or(ReplicaError::NoSuchStream)?;
        replica.subscribe(start)
    }

    async fn handle_update(&self, update: StreamUpdate) -> Result<()> {
        if !update.replicas.contains(&self.node_id) {
            if let Some((_, replica)) = self.streams.remove(&update.stream) {
                info!(stream = %update.stream, "Removed from replica set, stopping replica");
                replica.stop().await;
            }
            return Ok(());
        }

        let replica = match self.stream(&update.stream) {
            Some(replica) => replica,
            None => {
                let replica = self.open_replica(&update.stream)?;
                self.streams
                    .insert(update.stream.clone(), Arc::clone(&replica));
                replica
            }
        };
        replica.apply_update(&update).await
    }

    fn open_replica(&self, stream: &StreamId) -> Result<Arc<StreamReplica>> {
        let dir = self.stream_dir(stream);
        let log_config = LogConfig {
            max_segment_bytes: self.config.max_segment_bytes,
        };
        let log = Arc::new(CommitLog::open(dir, log_config)?);
        info!(stream = %stream, node = %self.node_id, "Opened stream replica");
        Ok(Arc::new(StreamReplica::new(
            stream.clone(),
            self.node_id.clone(),
            self.config.clone(),
            log,
            Arc::clone(&self.bus),
            Arc::clone(&self.controller),
        )))
    }

    fn stream_dir(&self, stream: &StreamId) -> PathBuf {
        self.data_dir.join(&stream.subject).join(&stream.name)
    }

    async fn handle_delete(&self, stream: &StreamId) {
        let Some((_, replica)) = self.streams.remove(stream) else {
            return;
        };
        info!(stream = %stream, "Deleting stream");
        replica.stop().await;
        if let Err(e) = std::fs::remove_dir_all(self.stream_dir(stream)) {
            warn!(stream = %stream, error = %e, "Failed to remove stream directory");
        }
    }

    /// Stop consuming controller events and quiesce every replica.
    pub async fn shutdown(&self) {
        let task = self.events_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        let streams: Vec<_> = self
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.streams.clear();
        for replica in streams {
            replica.stop().await;
        }
        info!(node = %self.node_id, "Node shut down");
    }
}

async fn events_loop(node: Arc<Node>, mut events: mpsc::UnboundedReceiver<ControllerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ControllerEvent::StreamUpdated(update) => {
                let stream = update.stream.clone();
                if let Err(e) = node.handle_update(update).await {
                    error!(
                        node = %node.node_id,
                        stream = %stream,
                        error = %e,
                        "Failed to apply stream update"
                    );
                }
            }
            ControllerEvent::StreamDeleted(stream) => node.handle_delete(&stream).await,
        }
    }
}
