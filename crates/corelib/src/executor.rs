//! Actor-per-partition executor.
//!
//! A fixed set of OS threads, each draining its own crossbeam channel.
//! Partition `p` always runs on thread `p % threads`, so work for one
//! partition executes one task at a time in submission order while other
//! partitions proceed in parallel. A panicking task is logged and the worker
//! moves on to its next task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::partition::PartitionId;

/// A unit of work bound to one partition's serialization domain.
pub trait PartitionRunnable: Send + 'static {
    fn partition_id(&self) -> PartitionId;

    fn run(self: Box<Self>);
}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run { partition_id: PartitionId, task: Task },
    Stop,
}

#[derive(Debug, Default)]
struct ExecutorStats {
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed pool of partition worker threads.
pub struct PartitionExecutor {
    senders: Vec<Sender<Job>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<ExecutorStats>,
    running: AtomicBool,
}

impl PartitionExecutor {
    /// Starts `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Configuration(
                "partition executor needs at least one thread".into(),
            ));
        }
        let stats = Arc::new(ExecutorStats::default());
        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for worker in 0..threads {
            let (tx, rx) = channel::unbounded();
            let stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("partition-worker-{worker}"))
                .spawn(move || worker_loop(worker, rx, stats))
                .map_err(|e| Error::Configuration(format!("spawn partition worker: {e}")))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            senders,
            handles: Mutex::new(handles),
            stats,
            running: AtomicBool::new(true),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.senders.len()
    }

    /// Worker index that serves `partition_id`.
    pub fn worker_of(&self, partition_id: PartitionId) -> usize {
        partition_id.index() % self.senders.len()
    }

    /// Queues a partition-affine runnable. Fire-and-forget: a panic inside
    /// it is logged, never returned.
    pub fn execute(&self, runnable: Box<dyn PartitionRunnable>) -> Result<()> {
        let partition_id = runnable.partition_id();
        self.execute_fn(partition_id, move || runnable.run())
    }

    /// Queues a closure on the worker owning `partition_id`.
    pub fn execute_fn<F>(&self, partition_id: PartitionId, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::invalid_state("partition executor is shut down"));
        }
        let worker = self.worker_of(partition_id);
        self.senders[worker]
            .send(Job::Run {
                partition_id,
                task: Box::new(f),
            })
            .map_err(|_| Error::invalid_state("partition worker has stopped"))
    }

    /// Tasks that ran to completion (panicked ones excluded).
    pub fn completed_count(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    pub fn panicked_count(&self) -> u64 {
        self.stats.panicked.load(Ordering::Relaxed)
    }

    /// Stops accepting work, lets queued tasks finish and joins the workers.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for tx in &self.senders {
            let _ = tx.send(Job::Stop);
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("partition worker exited abnormally");
            }
        }
        debug!(threads = self.senders.len(), "partition executor stopped");
    }
}

impl Drop for PartitionExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PartitionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionExecutor")
            .field("threads", &self.senders.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_loop(worker: usize, rx: Receiver<Job>, stats: Arc<ExecutorStats>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run { partition_id, task } => {
                if catch_unwind(AssertUnwindSafe(task)).is_ok() {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(worker, partition_id = %partition_id, "partition task panicked");
                }
            }
            Job::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Record {
        partition: PartitionId,
        seq: u32,
        out: mpsc::Sender<(PartitionId, u32, std::thread::ThreadId)>,
    }

    impl PartitionRunnable for Record {
        fn partition_id(&self) -> PartitionId {
            self.partition
        }

        fn run(self: Box<Self>) {
            let _ = self
                .out
                .send((self.partition, self.seq, std::thread::current().id()));
        }
    }

    #[test]
    fn same_partition_runs_in_order_on_one_thread() {
        let executor = PartitionExecutor::new(3).unwrap();
        let (tx, rx) = mpsc::channel();
        for seq in 0..50 {
            executor
                .execute(Box::new(Record {
                    partition: PartitionId(4),
                    seq,
                    out: tx.clone(),
                }))
                .unwrap();
        }
        let seen: Vec<_> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));
        assert!(seen.iter().all(|s| s.2 == seen[0].2));
        assert_eq!(executor.worker_of(PartitionId(4)), 1);
    }

    #[test]
    fn panic_does_not_kill_worker() {
        let executor = PartitionExecutor::new(1).unwrap();
        executor
            .execute_fn(PartitionId(0), || panic!("boom"))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        executor
            .execute_fn(PartitionId(1), move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        executor.shutdown();
        assert_eq!(executor.panicked_count(), 1);
        assert_eq!(executor.completed_count(), 1);
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let executor = PartitionExecutor::new(2).unwrap();
        executor.shutdown();
        assert!(executor.execute_fn(PartitionId(0), || {}).is_err());
    }

    #[test]
    fn zero_threads_is_a_config_error() {
        assert!(matches!(
            PartitionExecutor::new(0),
            Err(Error::Configuration(_))
        ));
    }
}
