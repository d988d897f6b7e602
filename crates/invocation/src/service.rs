//! Invoker side of operation dispatch.
//!
//! Each invocation gets a record and a driver task. The driver resolves the
//! target, sends, follows the reply stream and retries recoverable failures.
//! The record owns the single resolver of the caller's future: whoever takes
//! it first (the driver, a member departure or shutdown) decides the outcome,
//! and later attempts are no-ops.
//!
//! States: `Pending -> OnWire -> {Completed, Failed, Waiting}` and
//! `Waiting -> {Completed, Failed}`. A retry returns the record to `Pending`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use corelib::config::InvocationConfig;
use corelib::{Address, MembershipService, PartitionId, PartitionRunnable, PartitionTable};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{InvocationError, OperationError, TransportError};
use crate::operation::{CallId, Operation, Response};
use crate::runner::OperationRunner;
use crate::transport::{OperationRequest, Reply, Transport};

type Outcome = Result<Response, InvocationError>;

/// Lifecycle state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Pending,
    OnWire,
    Waiting,
    Completed,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::OnWire => "on-wire",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Destination {
    Partition(PartitionId),
    Member(Address),
}

struct Progress {
    state: InvocationState,
    target: Option<Address>,
}

struct InvocationRecord {
    call_id: CallId,
    progress: Mutex<Progress>,
    resolver: Mutex<Option<oneshot::Sender<Outcome>>>,
    driver: Mutex<Option<AbortHandle>>,
}

impl InvocationRecord {
    fn new(call_id: CallId, resolver: oneshot::Sender<Outcome>) -> Self {
        Self {
            call_id,
            progress: Mutex::new(Progress {
                state: InvocationState::Pending,
                target: None,
            }),
            resolver: Mutex::new(Some(resolver)),
            driver: Mutex::new(None),
        }
    }

    fn state(&self) -> InvocationState {
        self.progress.lock().state
    }

    fn target(&self) -> Option<Address> {
        self.progress.lock().target.clone()
    }

    fn transition(&self, state: InvocationState, target: Option<&Address>) {
        let mut progress = self.progress.lock();
        if progress.state.is_terminal() {
            return;
        }
        progress.state = state;
        if let Some(target) = target {
            progress.target = Some(target.clone());
        }
    }

    /// Resolves the future. Returns false if it was already resolved.
    fn resolve(&self, outcome: Outcome) -> bool {
        let Some(resolver) = self.resolver.lock().take() else {
            return false;
        };
        let state = if outcome.is_ok() {
            InvocationState::Completed
        } else {
            InvocationState::Failed
        };
        self.progress.lock().state = state;
        // the caller may have dropped the future
        let _ = resolver.send(outcome);
        true
    }

    fn abort_driver(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// Resolves once with the invocation's result.
pub struct InvocationFuture {
    call_id: CallId,
    record: Arc<InvocationRecord>,
    rx: oneshot::Receiver<Outcome>,
}

impl InvocationFuture {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn state(&self) -> InvocationState {
        self.record.state()
    }

    /// Member the invocation was last sent to.
    pub fn target(&self) -> Option<Address> {
        self.record.target()
    }

    fn failed(call_id: CallId, error: InvocationError) -> Self {
        let (tx, rx) = oneshot::channel();
        let record = Arc::new(InvocationRecord::new(call_id, tx));
        record.resolve(Err(error));
        Self {
            call_id,
            record,
            rx,
        }
    }
}

impl Future for InvocationFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(InvocationError::Shutdown)))
    }
}

impl fmt::Debug for InvocationFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationFuture")
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Dispatches operations to partition owners or explicit members.
pub struct OperationInvocationService {
    local: Address,
    table: Arc<PartitionTable>,
    membership: Arc<dyn MembershipService>,
    transport: Arc<dyn Transport>,
    runner: Arc<OperationRunner>,
    config: InvocationConfig,
    next_call_id: AtomicU64,
    invocations: DashMap<CallId, Arc<InvocationRecord>>,
    running: AtomicBool,
}

impl OperationInvocationService {
    pub fn new(
        table: Arc<PartitionTable>,
        membership: Arc<dyn MembershipService>,
        transport: Arc<dyn Transport>,
        runner: Arc<OperationRunner>,
        config: InvocationConfig,
    ) -> Self {
        Self {
            local: membership.local_address(),
            table,
            membership,
            transport,
            runner,
            config,
            next_call_id: AtomicU64::new(1),
            invocations: DashMap::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Sends `operation` to the current owner of `partition_id`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn invoke_on_partition(
        self: &Arc<Self>,
        service_name: &str,
        operation: Arc<dyn Operation>,
        partition_id: PartitionId,
    ) -> InvocationFuture {
        self.invoke(
            service_name,
            operation,
            Destination::Partition(partition_id),
            None,
        )
    }

    /// Like [`invoke_on_partition`](Self::invoke_on_partition) with an
    /// explicit bound on how long a blocking operation may stay parked.
    pub fn invoke_on_partition_with_wait_timeout(
        self: &Arc<Self>,
        service_name: &str,
        operation: Arc<dyn Operation>,
        partition_id: PartitionId,
        wait_timeout: Duration,
    ) -> InvocationFuture {
        self.invoke(
            service_name,
            operation,
            Destination::Partition(partition_id),
            Some(wait_timeout),
        )
    }

    /// Sends a non-partitioned operation to a specific member.
    pub fn invoke_on_target(
        self: &Arc<Self>,
        service_name: &str,
        operation: Arc<dyn Operation>,
        target: Address,
    ) -> InvocationFuture {
        self.invoke(service_name, operation, Destination::Member(target), None)
    }

    /// Runs partition-affine work on the partition's worker. Failures are
    /// logged, never returned.
    pub fn execute(&self, runnable: Box<dyn PartitionRunnable>) {
        let partition_id = runnable.partition_id();
        if let Err(e) = self.runner.execute(runnable) {
            warn!(%partition_id, error = %e, "partition task rejected");
        }
    }

    fn invoke(
        self: &Arc<Self>,
        service_name: &str,
        operation: Arc<dyn Operation>,
        destination: Destination,
        wait_timeout: Option<Duration>,
    ) -> InvocationFuture {
        let call_id = CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed));

        if !self.running.load(Ordering::Acquire) {
            return InvocationFuture::failed(call_id, InvocationError::Shutdown);
        }
        if operation.service_name() != service_name {
            return InvocationFuture::failed(
                call_id,
                corelib::Error::InvalidArgument(format!(
                    "operation belongs to {}, not {service_name}",
                    operation.service_name()
                ))
                .into(),
            );
        }
        if let Destination::Partition(pid) = &destination {
            if let Err(e) = self.table.get_partition(*pid) {
                return InvocationFuture::failed(call_id, e.into());
            }
        }

        let (tx, rx) = oneshot::channel();
        let record = Arc::new(InvocationRecord::new(call_id, tx));
        self.invocations.insert(call_id, Arc::clone(&record));

        let partition_id = match &destination {
            Destination::Partition(pid) => Some(*pid),
            Destination::Member(_) => None,
        };
        let request = OperationRequest {
            call_id,
            caller: self.local.clone(),
            partition_id,
            operation,
            wait_timeout: Some(wait_timeout.unwrap_or(self.config.call_timeout)),
        };
        trace!(%call_id, service = service_name, ?destination, "invocation created");

        let service = Arc::clone(self);
        let driven = Arc::clone(&record);
        let handle = tokio::spawn(async move {
            let outcome = service.drive(&driven, destination, request).await;
            service.finish(&driven, outcome);
        });
        *record.driver.lock() = Some(handle.abort_handle());
        if record.state().is_terminal() {
            record.abort_driver();
        }

        InvocationFuture {
            call_id,
            record,
            rx,
        }
    }

    async fn drive(
        &self,
        record: &InvocationRecord,
        destination: Destination,
        request: OperationRequest,
    ) -> Outcome {
        let deadline = Instant::now() + self.config.call_timeout;
        let mut retries = 0u32;
        loop {
            let error = match self.attempt(record, &destination, request.clone(), deadline).await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };
            if retries >= self.config.retry_budget || Instant::now() >= deadline {
                warn!(call_id = %record.call_id, retries, error = %error, "invocation gave up");
                return Err(InvocationError::OperationTimeout {
                    call_id: record.call_id,
                    retries,
                    reason: error.to_string(),
                });
            }
            retries += 1;
            metrics::counter!("grid_invocations_retried_total").increment(1);
            debug!(call_id = %record.call_id, retries, error = %error, "retrying invocation");
            record.transition(InvocationState::Pending, None);
            tokio::time::sleep(self.config.retry_pause).await;
            if !self.running.load(Ordering::Acquire) {
                return Err(InvocationError::Shutdown);
            }
        }
    }

    async fn attempt(
        &self,
        record: &InvocationRecord,
        destination: &Destination,
        request: OperationRequest,
        deadline: Instant,
    ) -> Outcome {
        let target = match destination {
            Destination::Partition(pid) => self
                .table
                .owner_of(*pid)?
                .ok_or(InvocationError::PartitionUnassigned(*pid))?,
            Destination::Member(address) => address.clone(),
        };
        if !self.membership.is_member(&target) {
            return match destination {
                // the table has not caught up with the departure yet
                Destination::Partition(_) => Err(TransportError::Unreachable(target).into()),
                Destination::Member(_) => Err(InvocationError::MemberLeft { target }),
            };
        }

        record.transition(InvocationState::OnWire, Some(&target));
        let mut replies = if target == self.local {
            self.runner.submit(request)
        } else {
            self.transport.send(&target, request).await?
        };

        loop {
            let reply = match tokio::time::timeout_at(deadline, replies.recv()).await {
                Ok(reply) => reply,
                Err(_) => {
                    return Err(InvocationError::OperationTimeout {
                        call_id: record.call_id,
                        retries: 0,
                        reason: "call deadline passed".into(),
                    })
                }
            };
            match reply {
                Some(Reply::Parked) => {
                    trace!(call_id = %record.call_id, %target, "operation parked on target");
                    record.transition(InvocationState::Waiting, None);
                }
                Some(Reply::Done(Ok(response))) => return Ok(response),
                Some(Reply::Done(Err(OperationError::WaitTimeout))) => {
                    return Err(InvocationError::WaitTimeout(record.call_id))
                }
                Some(Reply::Done(Err(OperationError::MemberLeft(_)))) => {
                    return Err(InvocationError::MemberLeft { target })
                }
                Some(Reply::Done(Err(e))) => return Err(InvocationError::Operation(e)),
                None => {
                    return Err(InvocationError::ReplyLost {
                        call_id: record.call_id,
                        target,
                    })
                }
            }
        }
    }

    fn finish(&self, record: &InvocationRecord, outcome: Outcome) {
        if let Err(e) = &outcome {
            debug!(call_id = %record.call_id, error = %e, "invocation failed");
        }
        record.resolve(outcome);
        self.invocations.remove(&record.call_id);
    }

    /// Fails every invocation sent to `address` that is on the wire or
    /// parked there. They are not retried: the outcome on that member is
    /// unknown. Returns the number of invocations failed.
    pub fn on_member_removed(&self, address: &Address) -> usize {
        let affected: Vec<Arc<InvocationRecord>> = self
            .invocations
            .iter()
            .filter(|r| {
                let progress = r.progress.lock();
                progress.target.as_ref() == Some(address)
                    && matches!(
                        progress.state,
                        InvocationState::OnWire | InvocationState::Waiting
                    )
            })
            .map(|r| Arc::clone(r.value()))
            .collect();

        let mut failed = 0;
        for record in affected {
            if record.resolve(Err(InvocationError::MemberLeft {
                target: address.clone(),
            })) {
                failed += 1;
            }
            record.abort_driver();
            self.invocations.remove(&record.call_id);
        }
        if failed > 0 {
            info!(member = %address, failed, "invocations failed after member departure");
        }
        failed
    }

    /// Invocations not yet resolved.
    pub fn pending_invocation_count(&self) -> usize {
        self.invocations.len()
    }

    /// State of an unresolved invocation.
    pub fn invocation_state(&self, call_id: CallId) -> Option<InvocationState> {
        self.invocations.get(&call_id).map(|r| r.state())
    }

    pub fn runner(&self) -> &Arc<OperationRunner> {
        &self.runner
    }

    /// Fails all unresolved invocations and rejects new ones.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let records: Vec<_> = self
            .invocations
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        for record in records {
            record.resolve(Err(InvocationError::Shutdown));
            record.abort_driver();
        }
        self.invocations.clear();
        self.runner.stop();
    }
}

impl fmt::Debug for OperationInvocationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationInvocationService")
            .field("local", &self.local)
            .field("pending", &self.invocations.len())
            .finish()
    }
}
