//! Anti-entropy scheduling.
//!
//! Each `(partition, replica index)` has at most one scheduled request; a new
//! request for the same key supersedes the old one. Due requests move to the
//! ongoing set while a [`ReplicaSyncer`] works on them, and a key that is
//! ongoing is never handed out a second time.
//!
//! # Backoff
//!
//! Retry `n` waits `base_delay * 2^n`, capped at `max_delay`. Retries are
//! unbounded; a request is only dropped when its target stops holding the
//! replica.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use corelib::{Address, PartitionId};
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use tokio::sync::Notify;

use crate::error::Result;

/// Identifies the replica a sync request repairs.
pub type SyncKey = (PartitionId, usize);

/// An outstanding or scheduled anti-entropy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSyncInfo {
    /// Increases with every request; a newer id for the same key supersedes.
    pub request_id: u64,
    pub partition_id: PartitionId,
    pub replica_index: usize,
    pub target_address: Address,
    /// Owner version the target is brought up to.
    pub owner_version: i64,
    pub requested_at: Instant,
    pub retry_count: u32,
}

impl ReplicaSyncInfo {
    pub fn key(&self) -> SyncKey {
        (self.partition_id, self.replica_index)
    }
}

/// Performs one replica repair.
///
/// Implementations copy the owner's state for the partition to the target
/// and return once the target has confirmed it. They must be safe to call
/// again for the same request.
#[async_trait]
pub trait ReplicaSyncer: Send + Sync + 'static {
    async fn sync_replica(&self, info: &ReplicaSyncInfo) -> Result<()>;
}

/// Delay for the given retry, doubling from `base` and capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let factor = 1u32.checked_shl(retry_count.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

#[derive(Default)]
struct SchedulerState {
    queue: PriorityQueue<SyncKey, Reverse<Instant>>,
    scheduled: HashMap<SyncKey, ReplicaSyncInfo>,
    ongoing: HashMap<SyncKey, ReplicaSyncInfo>,
}

/// Keyed delay queue of sync requests.
#[derive(Default)]
pub struct SyncScheduler {
    state: Mutex<SchedulerState>,
    next_request: AtomicU64,
    wakeup: Notify,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a request to run after `delay`, replacing any scheduled
    /// request for the same key.
    pub fn schedule(
        &self,
        partition_id: PartitionId,
        replica_index: usize,
        target_address: Address,
        owner_version: i64,
        retry_count: u32,
        delay: Duration,
    ) -> ReplicaSyncInfo {
        let now = Instant::now();
        let info = ReplicaSyncInfo {
            request_id: self.next_request.fetch_add(1, Ordering::Relaxed) + 1,
            partition_id,
            replica_index,
            target_address,
            owner_version,
            requested_at: now,
            retry_count,
        };
        {
            let mut state = self.state.lock();
            state.queue.push(info.key(), Reverse(now + delay));
            state.scheduled.insert(info.key(), info.clone());
        }
        self.wakeup.notify_one();
        info
    }

    /// Moves up to `limit - ongoing` due requests to the ongoing set and
    /// returns them.
    pub fn take_due(&self, now: Instant, limit: usize) -> Vec<ReplicaSyncInfo> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();
        let mut busy = Vec::new();
        while state.ongoing.len() < limit {
            match state.queue.peek() {
                Some((_, Reverse(due))) if *due <= now => {}
                _ => break,
            }
            let Some((key, due)) = state.queue.pop() else {
                break;
            };
            if state.ongoing.contains_key(&key) {
                busy.push((key, due));
                continue;
            }
            if let Some(info) = state.scheduled.remove(&key) {
                state.ongoing.insert(key, info.clone());
                taken.push(info);
            }
        }
        // keys still in flight wait for the current attempt to finish
        for (key, due) in busy {
            state.queue.push(key, due);
        }
        taken
    }

    /// Removes `info` from the ongoing set. Returns true if a newer request
    /// for the same key is already scheduled.
    pub fn finish(&self, info: &ReplicaSyncInfo) -> bool {
        let newer = {
            let mut state = self.state.lock();
            if state
                .ongoing
                .get(&info.key())
                .is_some_and(|o| o.request_id == info.request_id)
            {
                state.ongoing.remove(&info.key());
            }
            state
                .scheduled
                .get(&info.key())
                .is_some_and(|s| s.request_id > info.request_id)
        };
        self.wakeup.notify_one();
        newer
    }

    /// Drops scheduled requests targeting `address`. In-flight requests are
    /// left to finish and are not rescheduled. Returns the number dropped.
    pub fn cancel_for(&self, address: &Address) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<SyncKey> = state
            .scheduled
            .values()
            .filter(|info| &info.target_address == address)
            .map(ReplicaSyncInfo::key)
            .collect();
        for key in &keys {
            state.scheduled.remove(key);
            state.queue.remove(key);
        }
        keys.len()
    }

    /// Earliest due time of any scheduled request.
    pub fn next_due(&self) -> Option<Instant> {
        self.state.lock().queue.peek().map(|(_, Reverse(due))| *due)
    }

    pub fn scheduled(&self) -> Vec<ReplicaSyncInfo> {
        let mut infos: Vec<_> = self.state.lock().scheduled.values().cloned().collect();
        infos.sort_by_key(ReplicaSyncInfo::key);
        infos
    }

    pub fn ongoing(&self) -> Vec<ReplicaSyncInfo> {
        let mut infos: Vec<_> = self.state.lock().ongoing.values().cloned().collect();
        infos.sort_by_key(ReplicaSyncInfo::key);
        infos
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.scheduled.is_empty() && state.ongoing.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.scheduled.clear();
        state.ongoing.clear();
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wakeup
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncScheduler")
            .field("scheduled", &state.scheduled.len())
            .field("ongoing", &state.ongoing.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> Address {
        Address::new(host, 5701)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, max, 0), base);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, max, 4), max);
        assert_eq!(backoff_delay(base, max, 200), max);
    }

    #[test]
    fn newer_request_supersedes() {
        let scheduler = SyncScheduler::new();
        let first = scheduler.schedule(PartitionId(1), 1, addr("a"), 0, 0, Duration::ZERO);
        let second = scheduler.schedule(PartitionId(1), 1, addr("b"), 0, 0, Duration::ZERO);
        assert!(second.request_id > first.request_id);

        let scheduled = scheduler.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].target_address, addr("b"));
    }

    #[test]
    fn only_due_requests_are_taken() {
        let scheduler = SyncScheduler::new();
        scheduler.schedule(PartitionId(0), 1, addr("a"), 0, 0, Duration::ZERO);
        scheduler.schedule(PartitionId(1), 1, addr("a"), 0, 0, Duration::from_secs(60));

        let due = scheduler.take_due(Instant::now(), 8);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].partition_id, PartitionId(0));
        assert_eq!(scheduler.ongoing().len(), 1);
        assert_eq!(scheduler.scheduled().len(), 1);
    }

    #[test]
    fn in_flight_key_is_not_handed_out_twice() {
        let scheduler = SyncScheduler::new();
        let first = scheduler.schedule(PartitionId(0), 1, addr("a"), 0, 0, Duration::ZERO);
        assert_eq!(scheduler.take_due(Instant::now(), 8).len(), 1);

        scheduler.schedule(PartitionId(0), 1, addr("a"), 0, 0, Duration::ZERO);
        assert!(scheduler.take_due(Instant::now(), 8).is_empty());

        assert!(scheduler.finish(&first));
        assert_eq!(scheduler.take_due(Instant::now(), 8).len(), 1);
    }

    #[test]
    fn parallelism_limit_is_respected() {
        let scheduler = SyncScheduler::new();
        for p in 0..5 {
            scheduler.schedule(PartitionId(p), 1, addr("a"), 0, 0, Duration::ZERO);
        }
        assert_eq!(scheduler.take_due(Instant::now(), 2).len(), 2);
        assert!(scheduler.take_due(Instant::now(), 2).is_empty());
    }

    #[test]
    fn cancel_drops_requests_for_departed_target() {
        let scheduler = SyncScheduler::new();
        scheduler.schedule(PartitionId(0), 1, addr("a"), 0, 0, Duration::from_secs(5));
        scheduler.schedule(PartitionId(1), 1, addr("b"), 0, 0, Duration::from_secs(5));
        scheduler.schedule(PartitionId(2), 2, addr("a"), 0, 0, Duration::from_secs(5));

        assert_eq!(scheduler.cancel_for(&addr("a")), 2);
        let left = scheduler.scheduled();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].target_address, addr("b"));
        assert!(scheduler.next_due().is_some());
    }
}
