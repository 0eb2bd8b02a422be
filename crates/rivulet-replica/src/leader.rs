//! Leader role for a stream replica.
//!
//! The leader owns the stream's authoritative log. It accepts publishes on
//! the stream subject, serves follower fetches on the epoch-scoped
//! replication inbox, answers epoch handshakes, tracks per-follower progress,
//! advances the high watermark, and maintains the ISR through the controller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rivulet_common::{AckPolicy, Epoch, NodeId, Offset, ReplicationConfig, StreamId};
use rivulet_log::{CommitLog, LogError, NewEntry};
use rivulet_transport::bus::{BusMessage, MessageBus};
use rivulet_transport::frames::{
    self, ErrorKind, FetchReply, LeaderEpochRequest, LeaderEpochResponse, Publish, PublishReply,
    ReplicationError, ReplicationRequest, ReplicationResponse,
};
use rivulet_transport::subject;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::error::ReplicaError;
use crate::pending::{AckTarget, PendingAcks};

/// How long a fetch with no available data is parked before replying empty.
/// Doubles as the idle heartbeat carrying the high watermark to followers.
fn fetch_park_time(config: &ReplicationConfig) -> Duration {
    (config.replica_fetch_timeout() / 2).min(Duration::from_millis(500))
}

/// Pending ALL-policy publishes older than this many lag windows are failed
/// with a timeout error; by then the ISR checker has had ample opportunity to
/// shrink the ISR and commit them.
const PENDING_REAP_LAG_WINDOWS: u32 = 4;

/// Why a leader role is being torn down; decides how outstanding publishes
/// are failed.
pub(crate) enum StopReason {
    /// Another node took over; pending publishes fail with a routing hint.
    Demoted { new_leader: Option<NodeId> },
    /// The replica is shutting down or the stream was deleted.
    Shutdown,
}

struct FollowerStatus {
    last_fetched_offset: Offset,
    last_fetch_time: Instant,
    lagging_since: Option<Instant>,
}

struct LeaderState {
    isr: HashSet<NodeId>,
    followers: HashMap<NodeId, FollowerStatus>,
    isr_proposal_in_flight: bool,
}

struct LeaderCtx {
    stream: StreamId,
    node_id: NodeId,
    epoch: Epoch,
    config: ReplicationConfig,
    log: Arc<CommitLog>,
    bus: Arc<dyn MessageBus>,
    controller: Arc<dyn Controller>,
    state: Mutex<LeaderState>,
    pending: PendingAcks,
}

pub(crate) struct Leader {
    ctx: Arc<LeaderCtx>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Leader {
    /// Promote this replica to leader for `epoch`.
    ///
    /// The epoch's start offset is durably recorded before any subscription
    /// is opened, so no publish can be appended under an unrecorded epoch.
    pub(crate) async fn start(
        stream: StreamId,
        node_id: NodeId,
        epoch: Epoch,
        replicas: &[NodeId],
        isr: &[NodeId],
        config: ReplicationConfig,
        log: Arc<CommitLog>,
        bus: Arc<dyn MessageBus>,
        controller: Arc<dyn Controller>,
    ) -> crate::error::Result<Self> {
        log.record_epoch_start(epoch, log.newest_offset() + 1)?;

        let now = Instant::now();
        let followers = replicas
            .iter()
            .filter(|id| **id != node_id)
            .map(|id| {
                (
                    id.clone(),
                    FollowerStatus {
                        last_fetched_offset: -1,
                        last_fetch_time: now,
                        lagging_since: None,
                    },
                )
            })
            .collect();

        let ctx = Arc::new(LeaderCtx {
            stream: stream.clone(),
            node_id,
            epoch,
            config,
            log,
            bus,
            controller,
            state: Mutex::new(LeaderState {
                isr: isr.iter().cloned().collect(),
                followers,
                isr_proposal_in_flight: false,
            }),
            pending: PendingAcks::new(),
        });

        let replication_sub = ctx
            .bus
            .subscribe(&subject::replication_inbox(&stream, epoch))
            .await?;
        let epoch_sub = ctx.bus.subscribe(&subject::epoch_inbox(&stream)).await?;
        let publish_sub = ctx
            .bus
            .subscribe(&subject::publish_subject(&stream.subject))
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(replication_loop(
                Arc::clone(&ctx),
                replication_sub,
                shutdown_rx.clone(),
            )),
            tokio::spawn(epoch_loop(Arc::clone(&ctx), epoch_sub, shutdown_rx.clone())),
            tokio::spawn(publish_loop(
                Arc::clone(&ctx),
                publish_sub,
                shutdown_rx.clone(),
            )),
            tokio::spawn(isr_loop(Arc::clone(&ctx), shutdown_rx)),
        ];

        info!(stream = %stream, epoch, "Became stream leader");
        Ok(Self {
            ctx,
            shutdown_tx,
            tasks,
        })
    }

    /// Adopt a controller-confirmed ISR for the current epoch.
    pub(crate) async fn apply_isr(&self, isr: &[NodeId]) {
        {
            let mut state = self.ctx.state.lock();
            state.isr = isr.iter().cloned().collect();
        }
        let resolved = self.ctx.advance_high_watermark();
        self.ctx.deliver_acks(resolved).await;
    }

    pub(crate) fn epoch(&self) -> Epoch {
        self.ctx.epoch
    }

    pub(crate) fn isr_size(&self) -> usize {
        self.ctx.state.lock().isr.len()
    }

    /// Quiesce all loops and fail outstanding publishes: demotion points
    /// callers at the new leader when known, shutdown cancels them.
    pub(crate) async fn stop(self, reason: StopReason) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        let failed = self.ctx.pending.fail_all();
        if !failed.is_empty() {
            info!(
                stream = %self.ctx.stream,
                count = failed.len(),
                "Failing pending publishes on leader stop"
            );
            let (kind, message) = match &reason {
                StopReason::Demoted { new_leader } => (
                    ErrorKind::NotLeader {
                        leader: new_leader.clone(),
                    },
                    "no longer leader".to_string(),
                ),
                StopReason::Shutdown => {
                    (ErrorKind::Cancelled, "replica shutting down".to_string())
                }
            };
            for (_, target) in failed {
                self.ctx
                    .send_reply(
                        &target.inbox,
                        &PublishReply::Error {
                            kind: kind.clone(),
                            message: message.clone(),
                            correlation_id: target.correlation_id,
                        },
                    )
                    .await;
            }
        }
        info!(stream = %self.ctx.stream, epoch = self.ctx.epoch, "Stepped down as leader");
    }
}

impl LeaderCtx {
    /// Recompute the high watermark: the highest offset replicated to every
    /// ISR member, the leader's own contribution being its newest offset.
    /// Never moves backwards. Returns the publishes the advance committed.
    fn advance_high_watermark(&self) -> Vec<(Offset, AckTarget)> {
        let state = self.state.lock();
        let mut candidate = self.log.newest_offset();
        for (id, follower) in &state.followers {
            if state.isr.contains(id) {
                candidate = candidate.min(follower.last_fetched_offset);
            }
        }
        let current = self.log.high_watermark();
        if candidate <= current {
            return Vec::new();
        }
        if let Err(e) = self.log.set_high_watermark(candidate) {
            error!(stream = %self.stream, error = %e, "Failed to advance high watermark");
            return Vec::new();
        }
        debug!(stream = %self.stream, from = current, to = candidate, "High watermark advanced");
        drop(state);
        self.pending.resolve_up_to(candidate)
    }

    async fn deliver_acks(&self, resolved: Vec<(Offset, AckTarget)>) {
        for (offset, target) in resolved {
            self.send_reply(
                &target.inbox,
                &PublishReply::Ack {
                    offset,
                    correlation_id: target.correlation_id,
                },
            )
            .await;
        }
    }

    async fn send_reply(&self, inbox: &str, reply: &PublishReply) {
        match frames::encode(reply) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(inbox, payload).await {
                    debug!(stream = %self.stream, inbox, error = %e, "Dropped publish reply");
                }
            }
            Err(e) => error!(stream = %self.stream, error = %e, "Failed to encode publish reply"),
        }
    }

    /// Propose replacing the ISR. On acceptance the in-memory ISR is updated
    /// and the watermark re-evaluated: shrinking the ISR removes a term from
    /// the min, so previously-pending publishes may become committable. A
    /// controller refusal surfaces as [`ReplicaError::IsrChangeRejected`].
    async fn propose_isr(&self, new_isr: HashSet<NodeId>) -> crate::error::Result<()> {
        {
            let mut state = self.state.lock();
            if state.isr_proposal_in_flight || state.isr == new_isr {
                return Ok(());
            }
            state.isr_proposal_in_flight = true;
        }

        let proposal: Vec<NodeId> = new_isr.iter().cloned().collect();
        let result = self
            .controller
            .propose_isr_change(&self.stream, self.epoch, proposal)
            .await;

        let outcome = match result {
            Ok(change) if change.accepted => {
                info!(stream = %self.stream, isr = ?change.isr, "ISR change confirmed");
                let mut state = self.state.lock();
                state.isr = change.isr.into_iter().collect();
                Ok(())
            }
            Ok(_) => Err(ReplicaError::IsrChangeRejected),
            Err(e) => Err(e),
        };
        self.state.lock().isr_proposal_in_flight = false;

        if outcome.is_ok() {
            let resolved = self.advance_high_watermark();
            self.deliver_acks(resolved).await;
        }
        outcome
    }

    async fn handle_fetch(self: Arc<Self>, message: BusMessage) {
        let request: ReplicationRequest = match frames::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(stream = %self.stream, error = %e, "Undecodable replication request");
                return;
            }
        };
        let Some(reply_inbox) = message.reply else {
            debug!(stream = %self.stream, "Replication request without reply inbox");
            return;
        };

        if request.leader_epoch != self.epoch {
            // Stale sender; reject with the current epoch so it re-reads
            // metadata and re-handshakes.
            self.send_fetch_error(
                &reply_inbox,
                ErrorKind::StaleEpoch,
                format!(
                    "requested epoch {}, current is {}",
                    request.leader_epoch, self.epoch
                ),
            )
            .await;
            return;
        }

        let caught_up_to_hw = {
            let mut state = self.state.lock();
            let Some(follower) = state.followers.get_mut(&request.replica_id) else {
                warn!(
                    stream = %self.stream,
                    replica = %request.replica_id,
                    "Replication request from unknown replica"
                );
                return;
            };
            follower.last_fetched_offset = request.fetch_offset - 1;
            follower.last_fetch_time = Instant::now();
            let in_isr = state.isr.contains(&request.replica_id);
            !in_isr && request.fetch_offset - 1 >= self.log.high_watermark()
        };

        let resolved = self.advance_high_watermark();
        self.deliver_acks(resolved).await;

        // A caught-up follower outside the ISR rejoins as soon as it fetches
        // at the committed frontier.
        if caught_up_to_hw {
            let mut new_isr = self.state.lock().isr.clone();
            new_isr.insert(request.replica_id.clone());
            if let Err(e) = self.propose_isr(new_isr).await {
                debug!(
                    stream = %self.stream,
                    replica = %request.replica_id,
                    error = %e,
                    "ISR expansion not applied"
                );
            }
        }

        // Park the fetch briefly when the follower is already at the tail,
        // rather than replying empty immediately.
        if request.fetch_offset > self.log.newest_offset() {
            self.log
                .wait_for_newest_at_least(request.fetch_offset, fetch_park_time(&self.config))
                .await;
        }

        let batch = match self
            .log
            .read_uncommitted(request.fetch_offset, self.config.max_batch_bytes as usize)
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    stream = %self.stream,
                    fetch_offset = request.fetch_offset,
                    error = %e,
                    "Failed to read batch for follower"
                );
                let kind = match e {
                    LogError::OffsetOutOfRange { .. } => ErrorKind::OffsetOutOfRange,
                    _ => ErrorKind::Internal,
                };
                self.send_fetch_error(&reply_inbox, kind, e.to_string()).await;
                return;
            }
        };
        self.send_fetch_reply(&reply_inbox, batch).await;
    }

    async fn send_fetch_reply(&self, inbox: &str, batch: Vec<rivulet_common::Message>) {
        let reply = FetchReply::Batch(ReplicationResponse {
            leader_epoch: self.epoch,
            leader_hw: self.log.high_watermark(),
            batch,
        });
        self.publish_fetch_reply(inbox, &reply).await;
    }

    async fn send_fetch_error(&self, inbox: &str, kind: ErrorKind, message: String) {
        let reply = FetchReply::Error(ReplicationError {
            kind,
            message,
            leader_epoch: self.epoch,
        });
        self.publish_fetch_reply(inbox, &reply).await;
    }

    async fn publish_fetch_reply(&self, inbox: &str, reply: &FetchReply) {
        match frames::encode(reply) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(inbox, payload).await {
                    debug!(stream = %self.stream, error = %e, "Dropped replication response");
                }
            }
            Err(e) => {
                error!(stream = %self.stream, error = %e, "Failed to encode replication response")
            }
        }
    }

    async fn handle_epoch_request(&self, message: BusMessage) {
        let request: LeaderEpochRequest = match frames::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(stream = %self.stream, error = %e, "Undecodable epoch request");
                return;
            }
        };
        let Some(reply_inbox) = message.reply else {
            return;
        };
        let last_offset_in_epoch = self.log.last_offset_for_epoch(request.follower_epoch);
        debug!(
            stream = %self.stream,
            replica = %request.replica_id,
            follower_epoch = request.follower_epoch,
            last_offset_in_epoch,
            "Answering epoch handshake"
        );
        let response = LeaderEpochResponse {
            last_offset_in_epoch,
        };
        match frames::encode(&response) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&reply_inbox, payload).await {
                    debug!(stream = %self.stream, error = %e, "Dropped epoch response");
                }
            }
            Err(e) => error!(stream = %self.stream, error = %e, "Failed to encode epoch response"),
        }
    }

    /// Returns false on a storage-fatal error, which stops the publish loop.
    async fn handle_publish(&self, message: BusMessage) -> bool {
        let publish: Publish = match frames::decode(&message.payload) {
            Ok(publish) => publish,
            Err(e) => {
                debug!(stream = %self.stream, error = %e, "Undecodable publish");
                return true;
            }
        };
        let ack_inbox = publish.ack_inbox.clone().or(message.reply);

        let isr_size = self.state.lock().isr.len();
        if isr_size < self.config.min_isr {
            if let Some(inbox) = &ack_inbox {
                self.send_reply(
                    inbox,
                    &PublishReply::Error {
                        kind: ErrorKind::TransientUnavailable,
                        message: format!(
                            "ISR size {isr_size} below minimum {}",
                            self.config.min_isr
                        ),
                        correlation_id: publish.correlation_id,
                    },
                )
                .await;
            }
            return true;
        }

        let entry = NewEntry {
            key: publish.key,
            value: publish.value,
            headers: publish.headers,
        };
        let offset = match self.log.append(vec![entry]) {
            Ok(offset) => offset,
            Err(e) => {
                error!(
                    stream = %self.stream,
                    error = %e,
                    "Append failed, leader no longer accepting publishes"
                );
                if let Some(inbox) = &ack_inbox {
                    self.send_reply(
                        inbox,
                        &PublishReply::Error {
                            kind: ErrorKind::Internal,
                            message: "storage failure".to_string(),
                            correlation_id: publish.correlation_id,
                        },
                    )
                    .await;
                }
                return !matches!(e, LogError::Io(_) | LogError::Closed);
            }
        };

        match publish.ack_policy {
            AckPolicy::None => {}
            AckPolicy::Leader => {
                if let Some(inbox) = &ack_inbox {
                    self.send_reply(
                        inbox,
                        &PublishReply::Ack {
                            offset,
                            correlation_id: publish.correlation_id,
                        },
                    )
                    .await;
                }
            }
            AckPolicy::All => {
                if let Some(inbox) = ack_inbox {
                    self.pending.register(offset, publish.correlation_id, inbox);
                }
            }
        }

        // With no followers in the ISR the append itself commits.
        let resolved = self.advance_high_watermark();
        self.deliver_acks(resolved).await;
        true
    }

    /// One pass of the ISR liveness check.
    async fn check_isr(&self) {
        let lag_time = self.config.replica_max_lag_time();
        let newest = self.log.newest_offset();
        let high_watermark = self.log.high_watermark();
        let now = Instant::now();

        let (to_remove, to_add) = {
            let mut state = self.state.lock();
            let isr = state.isr.clone();
            let mut to_remove = Vec::new();
            let mut to_add = Vec::new();
            for (id, follower) in &mut state.followers {
                let silent = now.duration_since(follower.last_fetch_time) > lag_time;
                let behind = newest - follower.last_fetched_offset
                    > self.config.replica_max_lag_messages as i64;
                let sustained_lag = if behind {
                    let since = follower.lagging_since.get_or_insert(now);
                    now.duration_since(*since) > lag_time
                } else {
                    follower.lagging_since = None;
                    false
                };

                if isr.contains(id) {
                    if silent || sustained_lag {
                        to_remove.push(id.clone());
                    }
                } else if !silent && follower.last_fetched_offset >= high_watermark {
                    to_add.push(id.clone());
                }
            }
            (to_remove, to_add)
        };

        if !to_remove.is_empty() {
            warn!(stream = %self.stream, replicas = ?to_remove, "Removing followers from ISR");
            let mut new_isr = self.state.lock().isr.clone();
            for id in &to_remove {
                new_isr.remove(id);
            }
            if let Err(e) = self.propose_isr(new_isr).await {
                warn!(stream = %self.stream, error = %e, "ISR shrink not applied");
            }
        } else if !to_add.is_empty() {
            let mut new_isr = self.state.lock().isr.clone();
            for id in to_add {
                new_isr.insert(id);
            }
            if let Err(e) = self.propose_isr(new_isr).await {
                warn!(stream = %self.stream, error = %e, "ISR expansion not applied");
            }
        }

        let expired = self
            .pending
            .reap_older_than(lag_time * PENDING_REAP_LAG_WINDOWS);
        for (offset, target) in expired {
            warn!(
                stream = %self.stream,
                offset,
                "Pending publish expired before commit"
            );
            self.send_reply(
                &target.inbox,
                &PublishReply::Error {
                    kind: ErrorKind::Timeout,
                    message: format!("offset {offset} did not commit in time"),
                    correlation_id: target.correlation_id,
                },
            )
            .await;
        }
    }
}

async fn replication_loop(
    ctx: Arc<LeaderCtx>,
    mut sub: rivulet_transport::Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            message = sub.next() => {
                let Some(message) = message else { return };
                // Handle each fetch independently so one parked fetch does
                // not delay the other followers.
                tokio::spawn(Arc::clone(&ctx).handle_fetch(message));
            }
        }
    }
}

async fn epoch_loop(
    ctx: Arc<LeaderCtx>,
    mut sub: rivulet_transport::Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            message = sub.next() => {
                let Some(message) = message else { return };
                ctx.handle_epoch_request(message).await;
            }
        }
    }
}

async fn publish_loop(
    ctx: Arc<LeaderCtx>,
    mut sub: rivulet_transport::Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            message = sub.next() => {
                let Some(message) = message else { return };
                if !ctx.handle_publish(message).await {
                    return;
                }
            }
        }
    }
}

async fn isr_loop(ctx: Arc<LeaderCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ctx.config.isr_check_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => ctx.check_isr().await,
        }
    }
}
