//! Follower role for a stream replica.
//!
//! A follower first negotiates a safe truncation point with the leader via
//! the epoch handshake, then fetches batches from its newest offset forward,
//! appending in strict order and tracking the leader's high watermark. A
//! leader that stays silent past the configured budget is reported to the
//! controller, which may start an election.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rivulet_common::{Epoch, NodeId, ReplicationConfig, StreamId};
use rivulet_log::{CommitLog, LogError};
use rivulet_transport::bus::MessageBus;
use rivulet_transport::frames::{
    self, ErrorKind, FetchReply, LeaderEpochRequest, LeaderEpochResponse, ReplicationRequest,
};
use rivulet_transport::subject;
use rivulet_transport::TransportError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ReplicaError;

/// Pause between retries of a failed handshake or transport error.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

struct FollowerCtx {
    stream: StreamId,
    node_id: NodeId,
    config: ReplicationConfig,
    log: Arc<CommitLog>,
    bus: Arc<dyn MessageBus>,
    controller: Arc<dyn crate::controller::Controller>,
}

pub(crate) struct Follower {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    epoch: Epoch,
}

impl Follower {
    pub(crate) fn start(
        stream: StreamId,
        node_id: NodeId,
        epoch: Epoch,
        config: ReplicationConfig,
        log: Arc<CommitLog>,
        bus: Arc<dyn MessageBus>,
        controller: Arc<dyn crate::controller::Controller>,
    ) -> Self {
        let ctx = FollowerCtx {
            stream: stream.clone(),
            node_id,
            config,
            log,
            bus,
            controller,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(stream = %ctx.stream, epoch, "Following stream leader");
            run(ctx, epoch, shutdown_rx).await;
        });
        Self {
            shutdown_tx,
            task,
            epoch,
        }
    }

    pub(crate) fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run(ctx: FollowerCtx, mut epoch: Epoch, mut shutdown: watch::Receiver<bool>) {
    let mut last_contact = Instant::now();

    'reconcile: loop {
        // Epoch handshake: find the last offset the leader still considers
        // valid for our history and cut everything past it.
        let safe_offset = loop {
            if *shutdown.borrow() {
                return;
            }
            match epoch_handshake(&ctx, epoch, &mut shutdown).await {
                HandshakeOutcome::Safe(offset) => {
                    last_contact = Instant::now();
                    break offset;
                }
                HandshakeOutcome::Shutdown => return,
                HandshakeOutcome::Retry => {
                    maybe_report_unreachable(&ctx, epoch, &mut last_contact).await;
                    if sleep_or_shutdown(RETRY_BACKOFF, &mut shutdown).await {
                        return;
                    }
                }
            }
        };

        let newest = ctx.log.newest_offset();
        if safe_offset < newest {
            warn!(
                stream = %ctx.stream,
                epoch,
                safe_offset,
                newest,
                "Truncating uncommitted suffix after leader change"
            );
            if let Err(e) = ctx.log.truncate(safe_offset) {
                error!(stream = %ctx.stream, error = %e, "Truncation failed, follower exiting");
                return;
            }
        }
        // Everything appended from here on belongs to the leader's epoch;
        // record that durably before the first such append.
        if let Err(e) = ctx.log.record_epoch_start(epoch, ctx.log.newest_offset() + 1) {
            error!(stream = %ctx.stream, error = %e, "Epoch record failed, follower exiting");
            return;
        }

        // Fetch loop.
        loop {
            if *shutdown.borrow() {
                return;
            }
            let fetch_offset = ctx.log.newest_offset() + 1;
            let request = ReplicationRequest {
                replica_id: ctx.node_id.clone(),
                fetch_offset,
                leader_epoch: epoch,
            };
            let payload = match frames::encode(&request) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(stream = %ctx.stream, error = %e, "Failed to encode fetch request");
                    return;
                }
            };
            let inbox = subject::replication_inbox(&ctx.stream, epoch);

            let result = tokio::select! {
                _ = shutdown.changed() => return,
                result = ctx.bus.request(&inbox, payload, ctx.config.replica_fetch_timeout()) => result,
            };

            match result {
                Ok(reply) => {
                    let response = match frames::decode::<FetchReply>(&reply.payload) {
                        Ok(FetchReply::Batch(response)) => response,
                        Ok(FetchReply::Error(error)) => {
                            last_contact = Instant::now();
                            match error.kind {
                                ErrorKind::StaleEpoch => {
                                    let stale = ReplicaError::StaleEpoch {
                                        request: epoch,
                                        current: error.leader_epoch,
                                    };
                                    warn!(stream = %ctx.stream, error = %stale, "Fetch rejected, reconciling");
                                    if error.leader_epoch > epoch {
                                        epoch = error.leader_epoch;
                                    }
                                }
                                _ => {
                                    warn!(
                                        stream = %ctx.stream,
                                        kind = ?error.kind,
                                        message = %error.message,
                                        "Fetch rejected, reconciling"
                                    );
                                }
                            }
                            if sleep_or_shutdown(RETRY_BACKOFF, &mut shutdown).await {
                                return;
                            }
                            continue 'reconcile;
                        }
                        Err(e) => {
                            debug!(stream = %ctx.stream, error = %e, "Undecodable replication response");
                            continue;
                        }
                    };
                    last_contact = Instant::now();

                    if response.leader_epoch > epoch {
                        info!(
                            stream = %ctx.stream,
                            old_epoch = epoch,
                            new_epoch = response.leader_epoch,
                            "Leader epoch advanced, reconciling"
                        );
                        epoch = response.leader_epoch;
                        continue 'reconcile;
                    }
                    if response.leader_epoch < epoch {
                        continue;
                    }

                    if let Some(first) = response.batch.first() {
                        if first.offset != fetch_offset {
                            debug!(
                                stream = %ctx.stream,
                                expected = fetch_offset,
                                actual = first.offset,
                                "Discarding out-of-range batch"
                            );
                            continue;
                        }
                        match ctx.log.append_replicated(&response.batch) {
                            Ok(()) => {}
                            Err(LogError::NonContiguousAppend { .. }) => continue,
                            Err(e) => {
                                error!(
                                    stream = %ctx.stream,
                                    error = %e,
                                    "Replicated append failed, follower exiting"
                                );
                                return;
                            }
                        }
                    }

                    // Track the leader's committed frontier, clamped to what
                    // we hold locally. Stale duplicates must not move it
                    // backwards; only reconciliation may do that.
                    let target = response.leader_hw.min(ctx.log.newest_offset());
                    if target > ctx.log.high_watermark() {
                        if let Err(e) = ctx.log.set_high_watermark(target) {
                            error!(stream = %ctx.stream, error = %e, "High watermark update failed");
                            return;
                        }
                    }
                }
                Err(TransportError::RequestTimeout { .. }) => {
                    debug!(stream = %ctx.stream, epoch, fetch_offset, "Fetch timed out");
                    maybe_report_unreachable(&ctx, epoch, &mut last_contact).await;
                }
                Err(e) => {
                    debug!(stream = %ctx.stream, error = %e, "Fetch failed");
                    maybe_report_unreachable(&ctx, epoch, &mut last_contact).await;
                    if sleep_or_shutdown(RETRY_BACKOFF, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }
}

enum HandshakeOutcome {
    Safe(i64),
    Retry,
    Shutdown,
}

async fn epoch_handshake(
    ctx: &FollowerCtx,
    epoch: Epoch,
    shutdown: &mut watch::Receiver<bool>,
) -> HandshakeOutcome {
    // The largest epoch we hold history for, at or below the leader's; a
    // fresh log asks with epoch 0 and gets -1 back, a no-op truncation.
    let follower_epoch = ctx.log.max_epoch_at_most(epoch).unwrap_or(0);
    let request = LeaderEpochRequest {
        replica_id: ctx.node_id.clone(),
        follower_epoch,
    };
    let payload = match frames::encode(&request) {
        Ok(payload) => payload,
        Err(e) => {
            error!(stream = %ctx.stream, error = %e, "Failed to encode epoch request");
            return HandshakeOutcome::Retry;
        }
    };

    let epoch_inbox = subject::epoch_inbox(&ctx.stream);
    let result = tokio::select! {
        _ = shutdown.changed() => return HandshakeOutcome::Shutdown,
        result = ctx.bus.request(
            &epoch_inbox,
            payload,
            ctx.config.replica_fetch_timeout(),
        ) => result,
    };
    match result {
        Ok(reply) => match frames::decode::<LeaderEpochResponse>(&reply.payload) {
            Ok(response) => {
                debug!(
                    stream = %ctx.stream,
                    follower_epoch,
                    safe_offset = response.last_offset_in_epoch,
                    "Epoch handshake complete"
                );
                HandshakeOutcome::Safe(response.last_offset_in_epoch)
            }
            Err(e) => {
                debug!(stream = %ctx.stream, error = %e, "Undecodable epoch response");
                HandshakeOutcome::Retry
            }
        },
        Err(e) => {
            debug!(stream = %ctx.stream, error = %e, "Epoch handshake failed");
            HandshakeOutcome::Retry
        }
    }
}

/// Report the leader unreachable once the silence budget is exhausted, then
/// re-arm so the report is not repeated while the election is in flight.
async fn maybe_report_unreachable(ctx: &FollowerCtx, epoch: Epoch, last_contact: &mut Instant) {
    if last_contact.elapsed() < ctx.config.replica_max_leader_timeout() {
        return;
    }
    warn!(
        stream = %ctx.stream,
        epoch,
        silent_for = ?last_contact.elapsed(),
        "Leader unreachable, hinting controller"
    );
    if let Err(e) = ctx.controller.report_unreachable_leader(&ctx.stream, epoch).await {
        debug!(stream = %ctx.stream, error = %e, "Failed to report unreachable leader");
    }
    *last_contact = Instant::now();
}

/// Returns true when shutdown fired during the sleep.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}
