//! Wait-notify registry.
//!
//! Blocking operations that must wait are parked here under their
//! [`WaitKey`], in FIFO order per key. Parking never holds a thread: the
//! entry keeps the operation and the reply channel, and the worker that
//! parked it moves on.
//!
//! An entry leaves the registry exactly once, through one of:
//! - `notify`, when the operation no longer needs to wait and runs
//! - expiry, resolved with the operation's `on_wait_expire`
//! - a purge (member departure, partition migration, merge)
//!
//! Removal happens under the key's lock, so whichever path removes an entry
//! first is the only one that resolves it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use corelib::{Address, PartitionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::OperationError;
use crate::operation::{CallId, Operation, OperationContext, Response, WaitKey};
use crate::transport::{Reply, ReplySender};

/// One parked operation.
pub struct ParkedEntry {
    pub wait_key: WaitKey,
    pub context: OperationContext,
    pub operation: Arc<dyn Operation>,
    pub expires_at: Option<Instant>,
    reply: ReplySender,
}

impl ParkedEntry {
    pub fn new(
        wait_key: WaitKey,
        context: OperationContext,
        operation: Arc<dyn Operation>,
        wait_timeout: Option<Duration>,
        reply: ReplySender,
    ) -> Self {
        Self {
            wait_key,
            context,
            operation,
            expires_at: wait_timeout.map(|t| Instant::now() + t),
            reply,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.context.call_id
    }

    pub fn caller(&self) -> &Address {
        &self.context.caller
    }

    /// True once the invoker stopped listening.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Sends the final reply, consuming the entry.
    pub fn resolve(self, result: Result<Response, OperationError>) {
        // the invoker may be gone; nothing to do then
        let _ = self.reply.send(Reply::Done(result));
    }

    pub(crate) fn expire(self) {
        let error = self.operation.on_wait_expire(&self.context);
        self.resolve(Err(error));
    }
}

impl std::fmt::Debug for ParkedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedEntry")
            .field("wait_key", &self.wait_key)
            .field("call_id", &self.context.call_id)
            .field("caller", &self.context.caller)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Parked operations of one member.
#[derive(Default)]
pub struct WaitNotifyRegistry {
    queues: DashMap<WaitKey, VecDeque<ParkedEntry>>,
    parked: AtomicUsize,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl WaitNotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry at the back of its key's queue.
    pub fn park(&self, entry: ParkedEntry) {
        debug!(
            call_id = %entry.call_id(),
            wait_key = %entry.wait_key,
            caller = %entry.caller(),
            "operation parked"
        );
        let mut queue = self.queues.entry(entry.wait_key.clone()).or_default();
        // counted before it becomes visible, so the count never trails the queues
        self.adjust(1, 0);
        queue.push_back(entry);
    }

    /// Wakes entries waiting on `key`, oldest first.
    ///
    /// Each head entry is asked `should_wait` again: if it still has to wait
    /// the scan stops and it keeps its place; otherwise it is removed and
    /// handed to `run`. Entries whose invoker is gone are dropped. Returns the
    /// number of entries handed to `run`.
    ///
    /// `should_wait` is evaluated without holding the queue lock. The head is
    /// only removed if it is still the same entry afterwards.
    pub fn notify<F>(&self, key: &WaitKey, mut run: F) -> usize
    where
        F: FnMut(ParkedEntry),
    {
        let mut woken = 0;
        loop {
            let head = match self.queues.get(key) {
                Some(queue) => queue.front().map(|head| {
                    (
                        head.is_abandoned(),
                        Arc::clone(&head.operation),
                        head.context.clone(),
                    )
                }),
                None => break,
            };
            let Some((abandoned, operation, context)) = head else {
                self.queues.remove_if(key, |_, q| q.is_empty());
                break;
            };
            if !abandoned && operation.should_wait(&context) {
                break;
            }

            let next = {
                let Some(mut queue) = self.queues.get_mut(key) else {
                    break;
                };
                let same = queue
                    .front()
                    .is_some_and(|h| h.call_id() == context.call_id && h.caller() == &context.caller);
                if !same {
                    // purged or expired meanwhile; look at the new head
                    continue;
                }
                let entry = queue.pop_front();
                if entry.is_some() {
                    self.adjust(0, 1);
                }
                entry
            };
            let Some(entry) = next else {
                break;
            };
            if entry.is_abandoned() {
                debug!(call_id = %entry.call_id(), "dropping abandoned parked operation");
                continue;
            }
            woken += 1;
            run(entry);
        }
        woken
    }

    /// Resolves every entry whose deadline passed. Returns how many expired.
    pub fn expire_due(&self, now: Instant) -> usize {
        let expired = self.take_where(|e| e.expires_at.is_some_and(|at| at <= now));
        let count = expired.len();
        for entry in expired {
            debug!(call_id = %entry.call_id(), wait_key = %entry.wait_key, "parked operation expired");
            entry.expire();
        }
        count
    }

    /// Fails every entry invoked by `address` with `MemberLeft`.
    pub fn purge_for_member(&self, address: &Address) -> usize {
        let purged = self.take_where(|e| e.caller() == address);
        let count = purged.len();
        for entry in purged {
            entry.resolve(Err(OperationError::MemberLeft(address.clone())));
        }
        if count > 0 {
            info!(member = %address, purged = count, "parked operations purged");
        }
        count
    }

    /// Fails entries of a partition that moved away so their invokers retry
    /// against the new owner.
    pub fn on_partition_migrated(&self, partition_id: PartitionId) -> usize {
        let moved = self.take_where(|e| e.context.partition_id == Some(partition_id));
        let count = moved.len();
        for entry in moved {
            entry.resolve(Err(OperationError::PartitionMigrating(partition_id)));
        }
        count
    }

    /// Fails entries whose invoker is not in `members`.
    pub fn purge_absent_callers(&self, members: &[Address]) -> usize {
        let purged = self.take_where(|e| !members.contains(e.caller()));
        let count = purged.len();
        for entry in purged {
            let caller = entry.caller().clone();
            entry.resolve(Err(OperationError::MemberLeft(caller)));
        }
        count
    }

    /// Fails everything, e.g. on shutdown.
    pub fn clear(&self, error: OperationError) -> usize {
        let all = self.take_where(|_| true);
        let count = all.len();
        for entry in all {
            entry.resolve(Err(error.clone()));
        }
        count
    }

    pub fn get_total_parked_operation_count(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Parked entries under one key.
    pub fn parked_count(&self, key: &WaitKey) -> usize {
        self.queues.get(key).map_or(0, |q| q.len())
    }

    /// Starts the periodic expiry scan. Must be called inside a tokio runtime.
    pub fn start_expiry_task(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.expire_due(Instant::now());
            }
        });
        if let Some(previous) = self.expiry_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.expiry_task.lock().take() {
            handle.abort();
        }
        self.clear(OperationError::ShuttingDown);
    }

    fn take_where<P>(&self, mut predicate: P) -> Vec<ParkedEntry>
    where
        P: FnMut(&ParkedEntry) -> bool,
    {
        let mut taken = Vec::new();
        for mut queue in self.queues.iter_mut() {
            let before = taken.len();
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if predicate(&entry) {
                    taken.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
            // uncounted while the shard is still locked
            self.adjust(0, taken.len() - before);
        }
        self.queues.retain(|_, q| !q.is_empty());
        taken
    }

    fn adjust(&self, added: usize, removed: usize) {
        if added > 0 {
            self.parked.fetch_add(added, Ordering::AcqRel);
        }
        if removed > 0 {
            self.parked.fetch_sub(removed, Ordering::AcqRel);
        }
        metrics::gauge!("grid_parked_operations").set(self.parked.load(Ordering::Relaxed) as f64);
    }
}

impl std::fmt::Debug for WaitNotifyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNotifyRegistry")
            .field("keys", &self.queues.len())
            .field("parked", &self.get_total_parked_operation_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    struct Gate {
        open: Arc<AtomicBool>,
    }

    impl Operation for Gate {
        fn service_name(&self) -> &str {
            "gate"
        }

        fn run(&self, _: &OperationContext) -> Result<Response, OperationError> {
            Ok(Response::from_static(b"passed"))
        }

        fn wait_key(&self) -> Option<WaitKey> {
            Some(WaitKey::new("gate", "g"))
        }

        fn should_wait(&self, _: &OperationContext) -> bool {
            !self.open.load(Ordering::SeqCst)
        }
    }

    fn ctx(call: u64, caller: &str) -> OperationContext {
        OperationContext {
            call_id: CallId(call),
            caller: Address::new(caller, 5701),
            local: Address::new("local", 5701),
            partition_id: Some(PartitionId(0)),
        }
    }

    fn park(
        registry: &WaitNotifyRegistry,
        open: &Arc<AtomicBool>,
        call: u64,
        caller: &str,
        timeout: Option<Duration>,
    ) -> mpsc::UnboundedReceiver<Reply> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.park(ParkedEntry::new(
            WaitKey::new("gate", "g"),
            ctx(call, caller),
            Arc::new(Gate { open: open.clone() }),
            timeout,
            tx,
        ));
        rx
    }

    #[test]
    fn notify_is_fifo_and_stops_at_first_waiter() {
        let registry = WaitNotifyRegistry::new();
        let open = Arc::new(AtomicBool::new(false));
        let _rx1 = park(&registry, &open, 1, "a", None);
        let _rx2 = park(&registry, &open, 2, "a", None);
        assert_eq!(registry.get_total_parked_operation_count(), 2);

        let key = WaitKey::new("gate", "g");
        assert_eq!(registry.notify(&key, |_| {}), 0);
        assert_eq!(registry.get_total_parked_operation_count(), 2);

        open.store(true, Ordering::SeqCst);
        let mut order = Vec::new();
        let woken = registry.notify(&key, |entry| order.push(entry.call_id()));
        assert_eq!(woken, 2);
        assert_eq!(order, vec![CallId(1), CallId(2)]);
        assert_eq!(registry.get_total_parked_operation_count(), 0);
        assert_eq!(registry.parked_count(&key), 0);
    }

    #[test]
    fn run_can_close_the_gate_for_later_entries() {
        let registry = WaitNotifyRegistry::new();
        let open = Arc::new(AtomicBool::new(true));
        let _rx1 = park(&registry, &open, 1, "a", None);
        let _rx2 = park(&registry, &open, 2, "a", None);

        // the first woken operation takes the only permit
        let gate = open.clone();
        let woken = registry.notify(&WaitKey::new("gate", "g"), |_| {
            gate.store(false, Ordering::SeqCst);
        });
        assert_eq!(woken, 1);
        assert_eq!(registry.get_total_parked_operation_count(), 1);
    }

    #[test]
    fn expiry_resolves_with_wait_timeout_once() {
        let registry = WaitNotifyRegistry::new();
        let open = Arc::new(AtomicBool::new(false));
        let mut rx = park(&registry, &open, 1, "a", Some(Duration::ZERO));
        let _keep = park(&registry, &open, 2, "a", None);

        assert_eq!(registry.expire_due(Instant::now()), 1);
        assert_eq!(registry.expire_due(Instant::now()), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            Reply::Done(Err(OperationError::WaitTimeout))
        );
        assert_eq!(registry.get_total_parked_operation_count(), 1);
    }

    #[test]
    fn purge_fails_entries_of_departed_caller() {
        let registry = WaitNotifyRegistry::new();
        let open = Arc::new(AtomicBool::new(false));
        let mut from_c = park(&registry, &open, 1, "c", None);
        let _from_a = park(&registry, &open, 2, "a", None);

        let c = Address::new("c", 5701);
        assert_eq!(registry.purge_for_member(&c), 1);
        assert_eq!(
            from_c.try_recv().unwrap(),
            Reply::Done(Err(OperationError::MemberLeft(c)))
        );
        assert_eq!(registry.get_total_parked_operation_count(), 1);

        // expiry after purge is a no-op for the purged entry
        assert_eq!(registry.expire_due(Instant::now() + Duration::from_secs(60)), 0);
    }

    #[test]
    fn abandoned_entries_are_dropped_on_notify() {
        let registry = WaitNotifyRegistry::new();
        let open = Arc::new(AtomicBool::new(false));
        drop(park(&registry, &open, 1, "a", None));
        let woken = registry.notify(&WaitKey::new("gate", "g"), |_| panic!("must not run"));
        assert_eq!(woken, 0);
        assert_eq!(registry.get_total_parked_operation_count(), 0);
    }

    #[test]
    fn migrated_partition_entries_are_released() {
        let registry = WaitNotifyRegistry::new();
        let open = Arc::new(AtomicBool::new(false));
        let mut rx = park(&registry, &open, 1, "a", None);
        assert_eq!(registry.on_partition_migrated(PartitionId(0)), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Reply::Done(Err(OperationError::PartitionMigrating(PartitionId(0))))
        );
    }

    struct Inspecting {
        registry: Arc<WaitNotifyRegistry>,
        seen: Arc<AtomicUsize>,
    }

    impl Operation for Inspecting {
        fn service_name(&self) -> &str {
            "gate"
        }

        fn run(&self, _: &OperationContext) -> Result<Response, OperationError> {
            Ok(Response::new())
        }

        fn wait_key(&self) -> Option<WaitKey> {
            Some(WaitKey::new("gate", "g"))
        }

        fn should_wait(&self, _: &OperationContext) -> bool {
            let parked = self.registry.parked_count(&WaitKey::new("gate", "g"));
            self.seen.store(parked, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn should_wait_may_read_the_registry() {
        let registry = Arc::new(WaitNotifyRegistry::new());
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.park(ParkedEntry::new(
            WaitKey::new("gate", "g"),
            ctx(1, "a"),
            Arc::new(Inspecting {
                registry: Arc::clone(&registry),
                seen: Arc::clone(&seen),
            }),
            None,
            tx,
        ));

        let woken = registry.notify(&WaitKey::new("gate", "g"), |_| {});
        assert_eq!(woken, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get_total_parked_operation_count(), 0);
    }

    #[test]
    fn count_never_runs_ahead_of_parks_under_concurrent_purge() {
        let registry = Arc::new(WaitNotifyRegistry::new());
        let open = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let parking = {
            let (registry, open, started, done) =
                (registry.clone(), open.clone(), started.clone(), done.clone());
            std::thread::spawn(move || {
                let mut replies = Vec::new();
                for call in 0..2_000 {
                    started.fetch_add(1, Ordering::SeqCst);
                    replies.push(park(&registry, &open, call, "c", None));
                }
                done.store(true, Ordering::SeqCst);
                replies
            })
        };
        let purging = {
            let (registry, done) = (registry.clone(), done.clone());
            std::thread::spawn(move || {
                let c = Address::new("c", 5701);
                while !done.load(Ordering::SeqCst) {
                    registry.purge_for_member(&c);
                }
            })
        };

        while !done.load(Ordering::SeqCst) {
            let count = registry.get_total_parked_operation_count();
            assert!(count <= started.load(Ordering::SeqCst), "count {count} ran ahead");
        }
        let _replies = parking.join().unwrap();
        purging.join().unwrap();

        let key = WaitKey::new("gate", "g");
        let remaining = registry.parked_count(&key);
        assert_eq!(registry.get_total_parked_operation_count(), remaining);
        registry.purge_for_member(&Address::new("c", 5701));
        assert_eq!(registry.get_total_parked_operation_count(), 0);
        assert_eq!(registry.parked_count(&key), 0);
    }
}
