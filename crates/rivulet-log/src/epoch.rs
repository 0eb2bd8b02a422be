//! Leader epoch map.
//!
//! Records, for each leader epoch, the first offset produced under that
//! epoch. A follower joining a leader asks "what is the last offset in my
//! epoch E that you consider valid?" and truncates its log to the answer,
//! which prevents divergent histories after rapid leader turnover.

use rivulet_common::{Epoch, Offset};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEntry {
    pub epoch: Epoch,
    pub start_offset: Offset,
}

/// Ordered list of `(epoch, start_offset)` pairs, ascending in both fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderEpochMap {
    entries: Vec<EpochEntry>,
}

impl LeaderEpochMap {
    /// Record the first offset of a new epoch.
    ///
    /// Re-recording an epoch already present with an earlier start is a
    /// no-op, so a leader re-promoted under the same epoch keeps its history.
    /// Entries made obsolete by the assignment (a later epoch, or a start
    /// offset at or past the new one, as happens after truncation) are
    /// dropped first, keeping the map ascending in both fields.
    pub fn record(&mut self, epoch: Epoch, start_offset: Offset) {
        if let Some(last) = self.entries.last() {
            if last.epoch == epoch && last.start_offset <= start_offset {
                return;
            }
        }
        self.entries
            .retain(|e| e.epoch < epoch && e.start_offset < start_offset);
        self.entries.push(EpochEntry {
            epoch,
            start_offset,
        });
    }

    /// The greatest offset whose epoch is at most `epoch`, given the log's
    /// current newest offset. Returns -1 when the log holds nothing produced
    /// at or before `epoch`.
    pub fn last_offset_for(&self, epoch: Epoch, newest_offset: Offset) -> Offset {
        let idx = self.entries.partition_point(|e| e.epoch <= epoch);
        if idx == 0 {
            return -1;
        }
        match self.entries.get(idx) {
            Some(next) => (next.start_offset - 1).min(newest_offset),
            None => newest_offset,
        }
    }

    /// The largest recorded epoch that is at most `epoch`.
    pub fn max_epoch_at_most(&self, epoch: Epoch) -> Option<Epoch> {
        let idx = self.entries.partition_point(|e| e.epoch <= epoch);
        idx.checked_sub(1).map(|i| self.entries[i].epoch)
    }

    pub fn latest_epoch(&self) -> Option<Epoch> {
        self.entries.last().map(|e| e.epoch)
    }

    /// Drop entries whose start offset lies past `to_offset`, after the log
    /// itself was truncated there.
    pub fn truncate_from(&mut self, to_offset: Offset) {
        self.entries.retain(|e| e.start_offset <= to_offset);
    }

    pub fn entries(&self) -> &[EpochEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
