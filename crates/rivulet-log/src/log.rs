//! Segmented commit log.
//!
//! An ordered sequence of messages keyed by a dense, monotonic offset. The
//! log tracks three derived offsets: the oldest retained offset, the newest
//! appended offset (-1 while empty), and the high watermark — the committed
//! frontier readers of committed data never pass.
//!
//! Exactly one role loop writes the log at a time; readers run concurrently
//! and take the inner read lock while copying messages out, which pins the
//! tail against truncation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rivulet_common::{Epoch, Message, Offset, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{LogError, Result};
use crate::epoch::LeaderEpochMap;
use crate::reader::{LogReader, ReadMode};
use crate::segment::{parse_segment_base, Segment};
use crate::state::{ReplicationState, StateFile};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum segment size before rolling to a new segment.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
        }
    }
}

fn default_max_segment_bytes() -> u64 {
    256 * 1024 * 1024
}

/// A message to be appended, before the leader assigns its offset.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

pub struct CommitLog {
    dir: PathBuf,
    config: LogConfig,
    inner: RwLock<LogInner>,
    high_watermark: AtomicI64,
    hw_tx: watch::Sender<Offset>,
    tail_tx: watch::Sender<Offset>,
    state_file: StateFile,
}

struct LogInner {
    segments: Vec<Segment>,
    epoch_map: LeaderEpochMap,
    closed: bool,
}

impl CommitLog {
    /// Open (or create) the log in `dir`, recovering any existing segments.
    ///
    /// Recovery scans every segment in base-offset order, verifying record
    /// checksums and cutting torn tails; segments past a break in the offset
    /// chain are discarded. The effective high watermark is the persisted
    /// value clamped to the recovered newest offset.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut bases: Vec<Offset> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                parse_segment_base(entry.file_name().to_str()?)
            })
            .collect();
        bases.sort_unstable();

        let mut segments: Vec<Segment> = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            let segment = Segment::open(&dir, base)?;
            if let Some(prev) = segments.last() {
                if segment.base_offset() != prev.next_offset() {
                    warn!(
                        dir = %dir.display(),
                        expected = prev.next_offset(),
                        actual = segment.base_offset(),
                        "Offset chain broken during recovery, discarding later segments"
                    );
                    segment.remove()?;
                    continue;
                }
            }
            // A tail cut in an earlier segment invalidates everything after it.
            if segment.is_empty() && !segments.is_empty() {
                segment.remove()?;
                continue;
            }
            segments.push(segment);
        }
        if segments.is_empty() {
            segments.push(Segment::create(&dir, 0)?);
        }

        let newest = segments
            .last()
            .map_or(-1, |s: &Segment| s.next_offset() - 1);

        let state_file = StateFile::new(&dir);
        let state = state_file.load()?.unwrap_or_default();
        let mut epoch_map = state.epoch_map;
        epoch_map.truncate_from(newest);
        let high_watermark = state.high_watermark.clamp(-1, newest);

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            newest_offset = newest,
            high_watermark,
            "Commit log opened"
        );

        let (hw_tx, _) = watch::channel(high_watermark);
        let (tail_tx, _) = watch::channel(newest);

        Ok(Self {
            dir,
            config,
            inner: RwLock::new(LogInner {
                segments,
                epoch_map,
                closed: false,
            }),
            high_watermark: AtomicI64::new(high_watermark),
            hw_tx,
            tail_tx,
            state_file,
        })
    }

    /// Append entries, assigning each the next offset and the current wall
    /// clock. Returns the offset of the first appended entry.
    pub fn append(&self, entries: Vec<NewEntry>) -> Result<Offset> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let first_offset = inner.segments.last().map_or(0, Segment::next_offset);
        let messages: Vec<Message> = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| Message {
                offset: first_offset + i as i64,
                timestamp,
                key: entry.key,
                value: entry.value,
                headers: entry.headers,
            })
            .collect();
        self.append_locked(&mut inner, &messages)?;
        Ok(first_offset)
    }

    /// Append messages replicated from the leader, verbatim. The first
    /// message must carry exactly the next offset; anything else is rejected
    /// so duplicated or reordered batches are discarded by the caller.
    pub fn append_replicated(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let expected = inner.segments.last().map_or(0, Segment::next_offset);
        if messages[0].offset != expected {
            return Err(LogError::NonContiguousAppend {
                expected,
                actual: messages[0].offset,
            });
        }
        self.append_locked(&mut inner, messages)
    }

    fn append_locked(&self, inner: &mut LogInner, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if inner
            .segments
            .last()
            .is_some_and(|s| s.is_full(self.config.max_segment_bytes))
        {
            let base = inner.segments.last().map_or(0, Segment::next_offset);
            debug!(dir = %self.dir.display(), base, "Rolling to new segment");
            inner.segments.push(Segment::create(&self.dir, base)?);
        }
        let active = inner
            .segments
            .last_mut()
            .ok_or_else(|| LogError::InvalidFormat("log has no active segment".to_string()))?;
        active.append(messages)?;
        let newest = active.next_offset() - 1;
        self.tail_tx.send_replace(newest);
        Ok(())
    }

    /// Offset of the first retained message.
    pub fn oldest_offset(&self) -> Offset {
        self.inner.read().segments[0].base_offset()
    }

    /// Offset of the last appended message, -1 while the log is empty.
    pub fn newest_offset(&self) -> Offset {
        *self.tail_tx.borrow()
    }

    /// The committed frontier. Lock-free.
    pub fn high_watermark(&self) -> Offset {
        self.high_watermark.load(Ordering::Acquire)
    }

    /// Move the high watermark. The caller is responsible for monotonicity on
    /// a leader; a follower may move it down only while reconciling, which
    /// happens through [`CommitLog::truncate`].
    pub fn set_high_watermark(&self, offset: Offset) -> Result<()> {
        let newest = self.newest_offset();
        if offset > newest {
            return Err(LogError::WatermarkOutOfRange {
                watermark: offset,
                newest,
            });
        }
        self.high_watermark.store(offset, Ordering::Release);
        self.hw_tx.send_replace(offset);
        Ok(())
    }

    /// Remove all messages with offset greater than `to_offset` and clamp the
    /// high watermark. Truncating at or past the newest offset is a no-op.
    pub fn truncate(&self, to_offset: Offset) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let newest = self.newest_offset();
        if to_offset >= newest {
            return Ok(());
        }

        while inner
            .segments
            .last()
            .is_some_and(|s| s.base_offset() > to_offset && inner.segments.len() > 1)
        {
            if let Some(segment) = inner.segments.pop() {
                segment.remove()?;
            }
        }
        if let Some(active) = inner.segments.last_mut() {
            active.truncate(to_offset)?;
        }
        inner.epoch_map.truncate_from(to_offset);

        let newest = inner.segments.last().map_or(-1, |s| s.next_offset() - 1);
        self.tail_tx.send_replace(newest);
        if self.high_watermark() > newest {
            self.high_watermark.store(newest, Ordering::Release);
            self.hw_tx.send_replace(newest);
        }

        let state = ReplicationState {
            epoch_map: inner.epoch_map.clone(),
            high_watermark: self.high_watermark(),
        };
        self.state_file.store(&state)?;
        info!(dir = %self.dir.display(), to_offset, newest, "Log truncated");
        Ok(())
    }

    /// Durably record the first offset of a new leader epoch. Must complete
    /// before the first append under that epoch.
    pub fn record_epoch_start(&self, epoch: Epoch, start_offset: Offset) -> Result<()> {
        let mut inner = self.inner.write();
        inner.epoch_map.record(epoch, start_offset);
        let state = ReplicationState {
            epoch_map: inner.epoch_map.clone(),
            high_watermark: self.high_watermark(),
        };
        self.state_file.store(&state)
    }

    /// The greatest offset in the log whose leader epoch is at most `epoch`.
    pub fn last_offset_for_epoch(&self, epoch: Epoch) -> Offset {
        self.inner
            .read()
            .epoch_map
            .last_offset_for(epoch, self.newest_offset())
    }

    /// The largest locally known epoch that is at most `epoch`.
    pub fn max_epoch_at_most(&self, epoch: Epoch) -> Option<Epoch> {
        self.inner.read().epoch_map.max_epoch_at_most(epoch)
    }

    /// Read committed messages in offset order starting at `start`.
    pub fn read_committed(&self, start: Offset, max_bytes: usize) -> Result<Vec<Message>> {
        self.read_up_to(start, self.high_watermark(), max_bytes)
    }

    /// Read messages up to the newest offset, past the committed frontier.
    /// Used by the leader to serve follower fetches, since followers must
    /// receive uncommitted messages for the high watermark to advance.
    pub fn read_uncommitted(&self, start: Offset, max_bytes: usize) -> Result<Vec<Message>> {
        self.read_up_to(start, self.newest_offset(), max_bytes)
    }

    fn read_up_to(&self, start: Offset, up_to: Offset, max_bytes: usize) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let oldest = inner.segments[0].base_offset();
        if start < oldest {
            return Err(LogError::OffsetOutOfRange {
                offset: start,
                oldest,
                newest: self.newest_offset(),
            });
        }
        if start > up_to {
            return Ok(Vec::new());
        }

        let mut idx = inner
            .segments
            .partition_point(|s| s.base_offset() <= start)
            .saturating_sub(1);
        let mut messages = Vec::new();
        let mut cursor = start;
        let mut remaining = max_bytes;
        while idx < inner.segments.len() && cursor <= up_to && remaining > 0 {
            let batch = inner.segments[idx].read_from(cursor, up_to, remaining)?;
            if batch.is_empty() {
                idx += 1;
                continue;
            }
            let bytes: usize = batch.iter().map(Message::size).sum();
            remaining = remaining.saturating_sub(bytes);
            cursor = batch.last().map_or(cursor, |m| m.offset + 1);
            messages.extend(batch);
        }
        Ok(messages)
    }

    /// First offset with a timestamp at or after `ts`; `newest + 1` when no
    /// retained message is that recent.
    pub fn offset_for_timestamp(&self, ts: Timestamp) -> Offset {
        let inner = self.inner.read();
        for segment in &inner.segments {
            if segment.last_timestamp().is_some_and(|last| last >= ts) {
                if let Some(offset) = segment.offset_for_timestamp(ts) {
                    return offset;
                }
            }
        }
        self.newest_offset() + 1
    }

    pub fn new_reader(self: &Arc<Self>, start: Offset, mode: ReadMode) -> LogReader {
        LogReader::new(Arc::clone(self), start, mode)
    }

    pub fn watch_high_watermark(&self) -> watch::Receiver<Offset> {
        self.hw_tx.subscribe()
    }

    pub fn watch_newest(&self) -> watch::Receiver<Offset> {
        self.tail_tx.subscribe()
    }

    /// Wait until the newest offset reaches at least `offset`. Returns false
    /// on timeout. Lets the leader hold follower fetches briefly instead of
    /// replying empty immediately.
    pub async fn wait_for_newest_at_least(&self, offset: Offset, timeout: Duration) -> bool {
        let mut rx = self.watch_newest();
        let wait = async {
            loop {
                if *rx.borrow_and_update() >= offset {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Persist the high watermark and epoch map and sync the active segment.
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Some(active) = inner.segments.last() {
            active.sync()?;
        }
        let state = ReplicationState {
            epoch_map: inner.epoch_map.clone(),
            high_watermark: self.high_watermark(),
        };
        self.state_file.store(&state)
    }

    /// Spawn a background task checkpointing the log at `interval`.
    pub fn start_checkpointer(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = log.checkpoint() {
                            error!(dir = %log.dir.display(), error = %e, "Checkpoint failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = log.checkpoint() {
                            error!(dir = %log.dir.display(), error = %e, "Final checkpoint failed");
                        }
                        return;
                    }
                }
            }
        })
    }

    /// Checkpoint and refuse further writes.
    pub fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.closed = true;
        }
        self.checkpoint()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
