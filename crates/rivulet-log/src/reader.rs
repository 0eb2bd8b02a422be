//! Ordered log readers.

use std::sync::Arc;

use rivulet_common::{Message, Offset};
use tokio::sync::watch;

use crate::error::{LogError, Result};
use crate::log::CommitLog;

/// How far a reader may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Only committed messages; waits while the cursor is past the high
    /// watermark.
    Committed,
    /// Up to the newest appended message. Used to serve follower fetches.
    Uncommitted,
}

/// Streams messages strictly in offset order, waiting for data as needed.
///
/// Cancellation is the caller's: wrap [`LogReader::next_batch`] in a
/// `tokio::select!` with whatever signal applies; the future holds no lock
/// while waiting.
pub struct LogReader {
    log: Arc<CommitLog>,
    next_offset: Offset,
    mode: ReadMode,
    limit_rx: watch::Receiver<Offset>,
}

impl LogReader {
    pub(crate) fn new(log: Arc<CommitLog>, start: Offset, mode: ReadMode) -> Self {
        let limit_rx = match mode {
            ReadMode::Committed => log.watch_high_watermark(),
            ReadMode::Uncommitted => log.watch_newest(),
        };
        Self {
            log,
            next_offset: start,
            mode,
            limit_rx,
        }
    }

    /// Offset of the next message this reader will yield.
    pub fn next_offset(&self) -> Offset {
        self.next_offset
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Return the next non-empty batch, at most `max_bytes` large, waiting
    /// until the log's limit (high watermark or newest offset) reaches the
    /// cursor.
    pub async fn next_batch(&mut self, max_bytes: usize) -> Result<Vec<Message>> {
        loop {
            let limit = *self.limit_rx.borrow_and_update();
            if limit >= self.next_offset {
                let batch = match self.mode {
                    ReadMode::Committed => self.log.read_committed(self.next_offset, max_bytes)?,
                    ReadMode::Uncommitted => {
                        self.log.read_uncommitted(self.next_offset, max_bytes)?
                    }
                };
                if let Some(last) = batch.last() {
                    self.next_offset = last.offset + 1;
                    return Ok(batch);
                }
            }
            self.limit_rx
                .changed()
                .await
                .map_err(|_| LogError::Closed)?;
        }
    }
}
