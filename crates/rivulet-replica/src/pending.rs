//! Pending publish table on the leader.
//!
//! Publishes with the ALL ack policy are acked only once their offset is at
//! or below the high watermark. Until then they are parked here, keyed by
//! offset. Entries are resolved on every watermark advance, failed wholesale
//! on demotion, and reaped by the ISR checker when the watermark stalls past
//! their deadline.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rivulet_common::Offset;

/// Where and how to deliver one publish's ack.
#[derive(Debug, Clone)]
pub struct AckTarget {
    pub correlation_id: String,
    pub inbox: String,
    pub registered_at: Instant,
}

#[derive(Default)]
pub struct PendingAcks {
    inner: Mutex<BTreeMap<Offset, Vec<AckTarget>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, offset: Offset, correlation_id: String, inbox: String) {
        self.inner.lock().entry(offset).or_default().push(AckTarget {
            correlation_id,
            inbox,
            registered_at: Instant::now(),
        });
    }

    /// Remove and return all entries with offset at or below `offset`.
    pub fn resolve_up_to(&self, offset: Offset) -> Vec<(Offset, AckTarget)> {
        let mut inner = self.inner.lock();
        let keep = inner.split_off(&(offset + 1));
        let resolved = std::mem::replace(&mut *inner, keep);
        resolved
            .into_iter()
            .flat_map(|(off, targets)| targets.into_iter().map(move |t| (off, t)))
            .collect()
    }

    /// Remove and return entries older than `age`, for timeout errors.
    pub fn reap_older_than(&self, age: Duration) -> Vec<(Offset, AckTarget)> {
        let Some(cutoff) = Instant::now().checked_sub(age) else {
            return Vec::new();
        };
        let mut inner = self.inner.lock();
        let mut reaped = Vec::new();
        inner.retain(|offset, targets| {
            targets.retain(|t| {
                if t.registered_at < cutoff {
                    reaped.push((*offset, t.clone()));
                    false
                } else {
                    true
                }
            });
            !targets.is_empty()
        });
        reaped
    }

    /// Remove entries registered under `correlation_id`.
    pub fn reap_correlation(&self, correlation_id: &str) {
        let mut inner = self.inner.lock();
        inner.retain(|_, targets| {
            targets.retain(|t| t.correlation_id != correlation_id);
            !targets.is_empty()
        });
    }

    /// Drain everything, for demotion.
    pub fn fail_all(&self) -> Vec<(Offset, AckTarget)> {
        let drained = std::mem::take(&mut *self.inner.lock());
        drained
            .into_iter()
            .flat_map(|(off, targets)| targets.into_iter().map(move |t| (off, t)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
