//! Per-stream replica: role state machine and subscription surface.
//!
//! A replica's role is a tagged variant — leader, follower, or idle — and
//! transitions replace the variant atomically under the role lock, quiescing
//! the prior role's background workers before the next role starts. Updates
//! are applied in controller order and filtered by epoch, so a replica is
//! never leader and follower for the same stream at once.

use std::sync::Arc;

use rivulet_common::{
    Epoch, Message, NodeId, Offset, ReplicationConfig, StartPosition, StreamId,
};
use rivulet_log::{CommitLog, LogError, ReadMode};
use rivulet_transport::bus::MessageBus;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::controller::{Controller, StreamUpdate};
use crate::error::{ReplicaError, Result};
use crate::follower::Follower;
use crate::leader::{Leader, StopReason};

/// Per-batch byte budget for subscription reads.
const SUBSCRIBE_BATCH_BYTES: usize = 64 * 1024;

enum Role {
    Idle,
    Leader(Leader),
    Follower(Follower),
}

struct RoleState {
    role: Role,
    epoch: Epoch,
}

pub struct StreamReplica {
    stream: StreamId,
    node_id: NodeId,
    config: ReplicationConfig,
    log: Arc<CommitLog>,
    bus: Arc<dyn MessageBus>,
    controller: Arc<dyn Controller>,
    role: Mutex<RoleState>,
    checkpointer: parking_lot::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl StreamReplica {
    pub fn new(
        stream: StreamId,
        node_id: NodeId,
        config: ReplicationConfig,
        log: Arc<CommitLog>,
        bus: Arc<dyn MessageBus>,
        controller: Arc<dyn Controller>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let checkpoint_task = log.start_checkpointer(config.hw_checkpoint_interval(), shutdown_rx);
        Self {
            stream,
            node_id,
            config,
            log,
            bus,
            controller,
            role: Mutex::new(RoleState {
                role: Role::Idle,
                epoch: 0,
            }),
            checkpointer: parking_lot::Mutex::new(Some((shutdown_tx, checkpoint_task))),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn log(&self) -> &Arc<CommitLog> {
        &self.log
    }

    pub fn high_watermark(&self) -> Offset {
        self.log.high_watermark()
    }

    pub fn newest_offset(&self) -> Offset {
        self.log.newest_offset()
    }

    pub async fn is_leader(&self) -> bool {
        matches!(self.role.lock().await.role, Role::Leader(_))
    }

    /// ISR size as tracked by this replica; `None` unless it is the leader.
    pub async fn isr_size(&self) -> Option<usize> {
        match &self.role.lock().await.role {
            Role::Leader(leader) => Some(leader.isr_size()),
            _ => None,
        }
    }

    pub async fn epoch(&self) -> Epoch {
        self.role.lock().await.epoch
    }

    /// Apply an authoritative controller update. Stale epochs are ignored; a
    /// same-epoch update to the current leader carries a confirmed ISR
    /// change; anything else is a role transition.
    pub async fn apply_update(&self, update: &StreamUpdate) -> Result<()> {
        let mut state = self.role.lock().await;
        if update.epoch < state.epoch {
            debug!(
                stream = %self.stream,
                known = state.epoch,
                received = update.epoch,
                "Ignoring stale stream update"
            );
            return Ok(());
        }

        let leads = update.leader == self.node_id;
        let replicates = update.replicas.contains(&self.node_id);
        if update.epoch == state.epoch {
            match &state.role {
                Role::Leader(leader) if leads => {
                    debug_assert_eq!(leader.epoch(), update.epoch);
                    leader.apply_isr(&update.isr).await;
                    return Ok(());
                }
                Role::Follower(follower) if !leads && replicates => {
                    debug_assert_eq!(follower.epoch(), update.epoch);
                    return Ok(());
                }
                Role::Idle if !replicates => return Ok(()),
                _ => {}
            }
        }

        match std::mem::replace(&mut state.role, Role::Idle) {
            Role::Leader(leader) => {
                let new_leader = (!leads).then(|| update.leader.clone());
                leader.stop(StopReason::Demoted { new_leader }).await;
            }
            Role::Follower(follower) => follower.stop().await,
            Role::Idle => {}
        }

        state.epoch = update.epoch;
        state.role = if leads {
            let leader = Leader::start(
                self.stream.clone(),
                self.node_id.clone(),
                update.epoch,
                &update.replicas,
                &update.isr,
                self.config.clone(),
                Arc::clone(&self.log),
                Arc::clone(&self.bus),
                Arc::clone(&self.controller),
            )
            .await?;
            Role::Leader(leader)
        } else if replicates {
            Role::Follower(Follower::start(
                self.stream.clone(),
                self.node_id.clone(),
                update.epoch,
                self.config.clone(),
                Arc::clone(&self.log),
                Arc::clone(&self.bus),
                Arc::clone(&self.controller),
            ))
        } else {
            info!(stream = %self.stream, "No longer in replica set");
            Role::Idle
        };
        Ok(())
    }

    /// Subscribe to committed messages from this replica's local log.
    ///
    /// Dropping the returned stream cancels the read promptly.
    pub fn subscribe(&self, start: StartPosition) -> Result<MessageStream> {
        let start_offset = match start {
            StartPosition::Earliest => self.log.oldest_offset(),
            StartPosition::Latest => self.log.newest_offset().max(self.log.oldest_offset()),
            StartPosition::Offset(offset) => offset,
            StartPosition::Timestamp(ts) => self.log.offset_for_timestamp(ts),
            StartPosition::NewOnly => self.log.newest_offset() + 1,
        };
        let oldest = self.log.oldest_offset();
        if start_offset < oldest {
            return Err(ReplicaError::OffsetOutOfRange {
                offset: start_offset,
                oldest,
                newest: self.log.newest_offset(),
            });
        }

        let mut reader = self.log.new_reader(start_offset, ReadMode::Committed);
        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = tx.closed() => return,
                    batch = reader.next_batch(SUBSCRIBE_BATCH_BYTES) => batch,
                };
                match batch {
                    Ok(messages) => {
                        for message in messages {
                            if tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(LogError::OffsetOutOfRange { offset, .. }) => {
                        let _ = tx.send(Err(ReplicaError::Truncated(offset))).await;
                        return;
                    }
                    Err(LogError::Closed) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });
        Ok(MessageStream { rx })
    }

    /// Quiesce the current role, stop checkpointing, and close the log.
    pub async fn stop(&self) {
        let mut state = self.role.lock().await;
        match std::mem::replace(&mut state.role, Role::Idle) {
            Role::Leader(leader) => leader.stop(StopReason::Shutdown).await,
            Role::Follower(follower) => follower.stop().await,
            Role::Idle => {}
        }
        drop(state);

        let checkpointer = self.checkpointer.lock().take();
        if let Some((shutdown_tx, task)) = checkpointer {
            let _ = shutdown_tx.send(true);
            let _ = task.await;
        }
        if let Err(e) = self.log.close() {
            debug!(stream = %self.stream, error = %e, "Error closing log");
        }
    }
}

/// Ordered stream of committed messages; ends on error or cancellation.
pub struct MessageStream {
    rx: mpsc::Receiver<Result<Message>>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Result<Message>> {
        self.rx.recv().await
    }
}
