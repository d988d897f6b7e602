//! Planned migrations waiting for a worker.

use std::collections::{HashSet, VecDeque};

use corelib::{MigrationInfo, PartitionId};
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<MigrationInfo>,
    active: HashSet<PartitionId>,
}

/// FIFO of planned migrations.
///
/// [`take_next`](Self::take_next) hands out the oldest entry whose partition
/// has no active migration, so entries for one partition run in plan order
/// and never overlap, while entries for other partitions can overtake a
/// partition that is busy.
#[derive(Debug, Default)]
pub struct MigrationQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl MigrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_all(&self, migrations: impl IntoIterator<Item = MigrationInfo>) -> usize {
        let added = {
            let mut state = self.state.lock();
            let before = state.pending.len();
            state.pending.extend(migrations);
            state.pending.len() - before
        };
        if added > 0 {
            self.available.notify_waiters();
            self.available.notify_one();
        }
        added
    }

    /// Removes and returns the next runnable entry, marking its partition
    /// active.
    pub fn take_next(&self) -> Option<MigrationInfo> {
        let mut state = self.state.lock();
        let pos = state
            .pending
            .iter()
            .position(|m| !state.active.contains(&m.partition_id))?;
        let info = state.pending.remove(pos)?;
        state.active.insert(info.partition_id);
        Some(info)
    }

    /// Marks the partition's active migration as finished.
    pub fn complete(&self, partition_id: PartitionId) {
        self.state.lock().active.remove(&partition_id);
        self.available.notify_one();
    }

    /// Drops every entry that has not started yet and returns them.
    pub fn clear_pending(&self) -> Vec<MigrationInfo> {
        self.state.lock().pending.drain(..).collect()
    }

    /// Planned entries not yet started.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// True if nothing is planned or running.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.active.is_empty()
    }

    /// Waits until an entry is runnable and takes it.
    pub(crate) async fn next(&self) -> MigrationInfo {
        loop {
            // registered before the check so a push in between still wakes us
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(info) = self.take_next() {
                return info;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::Address;

    fn planned(pid: u32, index: usize) -> MigrationInfo {
        MigrationInfo::new(PartitionId(pid), index, None, Address::new("a", 1))
    }

    #[test]
    fn busy_partition_is_skipped_not_reordered() {
        let queue = MigrationQueue::new();
        queue.push_all([planned(1, 1), planned(1, 0), planned(2, 0)]);

        let first = queue.take_next().unwrap();
        assert_eq!((first.partition_id, first.replica_index), (PartitionId(1), 1));

        // partition 1 is active, so partition 2 overtakes its second move
        let second = queue.take_next().unwrap();
        assert_eq!(second.partition_id, PartitionId(2));
        assert!(queue.take_next().is_none());

        queue.complete(PartitionId(1));
        let third = queue.take_next().unwrap();
        assert_eq!((third.partition_id, third.replica_index), (PartitionId(1), 0));
    }

    #[test]
    fn idle_only_when_nothing_pending_or_active() {
        let queue = MigrationQueue::new();
        assert!(queue.is_idle());
        queue.push_all([planned(0, 0)]);
        assert!(!queue.is_idle());
        let info = queue.take_next().unwrap();
        assert!(!queue.is_idle());
        assert_eq!(queue.active_count(), 1);
        queue.complete(info.partition_id);
        assert!(queue.is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiting_worker_sees_every_push() {
        let queue = std::sync::Arc::new(MigrationQueue::new());
        for round in 0..200 {
            let waiter = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.next().await })
            };
            tokio::task::yield_now().await;
            queue.push_all([planned(round, 0)]);
            let info = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
                .await
                .expect("push was not observed")
                .unwrap();
            assert_eq!(info.partition_id, PartitionId(round));
            queue.complete(info.partition_id);
        }
    }

    #[test]
    fn clear_pending_keeps_active() {
        let queue = MigrationQueue::new();
        queue.push_all([planned(0, 0), planned(1, 0), planned(2, 0)]);
        queue.take_next();
        assert_eq!(queue.clear_pending().len(), 2);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.active_count(), 1);
    }
}
