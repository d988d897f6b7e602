//! Target-side execution of operations.
//!
//! Every request runs on a partition worker of the [`PartitionExecutor`]:
//! partition operations on their partition's worker, member-targeted ones on
//! a lane picked from the call id. Parking, notification and the runs they
//! trigger all happen on that same worker, so an operation and the waiters it
//! wakes never race each other.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corelib::{Address, PartitionExecutor, PartitionId, PartitionRunnable, PartitionTable};
use replication::ReplicaVersionManager;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::OperationError;
use crate::operation::{OperationContext, Response, WaitKey};
use crate::parker::{ParkedEntry, WaitNotifyRegistry};
use crate::transport::{OperationRequest, Reply, ReplyReceiver, ReplySender};

/// Runs operations received by the local member.
pub struct OperationRunner {
    local: Address,
    table: Arc<PartitionTable>,
    versions: Arc<ReplicaVersionManager>,
    parker: Arc<WaitNotifyRegistry>,
    executor: Arc<PartitionExecutor>,
    accepting: AtomicBool,
}

impl OperationRunner {
    pub fn new(
        local: Address,
        table: Arc<PartitionTable>,
        versions: Arc<ReplicaVersionManager>,
        parker: Arc<WaitNotifyRegistry>,
        executor: Arc<PartitionExecutor>,
    ) -> Self {
        Self {
            local,
            table,
            versions,
            parker,
            executor,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn parker(&self) -> &Arc<WaitNotifyRegistry> {
        &self.parker
    }

    /// Accepts a request and returns the stream its replies arrive on.
    pub fn submit(self: &Arc<Self>, request: OperationRequest) -> ReplyReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.accepting.load(Ordering::Acquire) {
            let _ = tx.send(Reply::Done(Err(OperationError::ShuttingDown)));
            return rx;
        }
        let lane = self.lane_of(&request);
        let runner = Arc::clone(self);
        let rejected = tx.clone();
        if let Err(e) = self
            .executor
            .execute_fn(lane, move || runner.run_request(request, tx))
        {
            debug!(error = %e, "executor rejected operation");
            let _ = rejected.send(Reply::Done(Err(OperationError::ShuttingDown)));
        }
        rx
    }

    /// Runs partition-affine work on its partition's worker.
    pub fn execute(&self, runnable: Box<dyn PartitionRunnable>) -> corelib::Result<()> {
        self.executor.execute(runnable)
    }

    /// Releases operations parked on a partition that is no longer owned
    /// here. Runs on the partition's worker.
    pub fn on_partition_migrated(self: &Arc<Self>, partition_id: PartitionId) {
        let parker = Arc::clone(&self.parker);
        let result = self.executor.execute_fn(partition_id, move || {
            let released = parker.on_partition_migrated(partition_id);
            if released > 0 {
                debug!(%partition_id, released, "parked operations released after migration");
            }
        });
        if let Err(e) = result {
            warn!(%partition_id, error = %e, "could not release parked operations");
        }
    }

    /// Stops accepting requests. Requests arriving later are answered with
    /// `ShuttingDown`.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    fn lane_of(&self, request: &OperationRequest) -> PartitionId {
        match request.partition_id {
            Some(pid) => pid,
            None => {
                let lanes = u64::from(self.table.partition_count().max(1));
                PartitionId((request.call_id.0 % lanes) as u32)
            }
        }
    }

    fn run_request(&self, request: OperationRequest, reply: ReplySender) {
        let ctx = OperationContext {
            call_id: request.call_id,
            caller: request.caller.clone(),
            local: self.local.clone(),
            partition_id: request.partition_id,
        };

        if let Some(pid) = request.partition_id {
            if let Err(e) = self.check_target(pid) {
                trace!(call_id = %ctx.call_id, error = %e, "operation rejected");
                let _ = reply.send(Reply::Done(Err(e)));
                return;
            }
        }

        let operation = request.operation;
        if let Some(key) = operation.wait_key() {
            if operation.should_wait(&ctx) {
                let _ = reply.send(Reply::Parked);
                self.parker.park(ParkedEntry::new(
                    key,
                    ctx,
                    operation,
                    request.wait_timeout,
                    reply,
                ));
                return;
            }
        }

        let notified = operation.notified_key();
        let outcome = self.run_once(&ctx, operation.as_ref());
        let succeeded = outcome.is_ok();
        let _ = reply.send(Reply::Done(outcome));
        if succeeded {
            if let Some(key) = notified {
                self.wake(key);
            }
        }
    }

    fn check_target(&self, partition_id: PartitionId) -> Result<(), OperationError> {
        let partition = self
            .table
            .get_partition(partition_id)
            .map_err(|e| OperationError::Application(e.to_string()))?;
        if !partition.is_local(&self.local) {
            return Err(OperationError::WrongTarget {
                partition_id,
                target: self.local.clone(),
            });
        }
        let migrating = self
            .table
            .active_migration(partition_id)
            .ok()
            .flatten()
            .is_some_and(|m| m.replica_index == 0);
        if migrating {
            return Err(OperationError::PartitionMigrating(partition_id));
        }
        Ok(())
    }

    /// Runs an operation and bumps the owner version when it mutated the
    /// partition. The bump happens before the caller sends the response.
    /// A panic inside the operation becomes an `Application` error.
    fn run_once(
        &self,
        ctx: &OperationContext,
        operation: &dyn crate::operation::Operation,
    ) -> Result<Response, OperationError> {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| operation.run(ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(call_id = %ctx.call_id, %message, "operation panicked");
                Err(OperationError::Application(format!("operation panicked: {message}")))
            }
        };
        if outcome.is_ok() && operation.is_mutating() {
            if let Some(pid) = ctx.partition_id {
                if let Err(e) = self.versions.bump_owner_version(pid) {
                    warn!(partition_id = %pid, error = %e, "owner version not bumped");
                }
            }
        }
        outcome
    }

    /// Notifies `key` and keeps notifying the keys the woken operations
    /// notify in turn.
    fn wake(&self, key: WaitKey) {
        let mut pending = VecDeque::from([key]);
        while let Some(key) = pending.pop_front() {
            self.parker.notify(&key, |entry| {
                let notified = entry.operation.notified_key();
                let outcome = self.run_once(&entry.context, entry.operation.as_ref());
                let succeeded = outcome.is_ok();
                trace!(call_id = %entry.call_id(), wait_key = %key, "parked operation resumed");
                entry.resolve(outcome);
                if succeeded {
                    pending.extend(notified);
                }
            });
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRunner")
            .field("local", &self.local)
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}
