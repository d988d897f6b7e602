//! The operation contract.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use corelib::{Address, PartitionId};

use crate::error::OperationError;

/// Successful operation result. The payload format belongs to the service.
pub type Response = Bytes;

/// Identifier of one invocation, unique per invoking member.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Names the condition a blocking operation waits for, e.g. the permits of
/// one semaphore.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    service: Arc<str>,
    object: Arc<str>,
}

impl WaitKey {
    pub fn new(service: impl AsRef<str>, object: impl AsRef<str>) -> Self {
        Self {
            service: service.as_ref().into(),
            object: object.as_ref().into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn object(&self) -> &str {
        &self.object
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.object)
    }
}

impl fmt::Debug for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaitKey({self})")
    }
}

/// What the executing member knows about the invocation it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub call_id: CallId,
    pub caller: Address,
    pub local: Address,
    pub partition_id: Option<PartitionId>,
}

/// A unit of work sent to a partition owner or an explicit member.
///
/// An operation is immediate unless [`wait_key`](Self::wait_key) returns a
/// key. A blocking operation is asked [`should_wait`](Self::should_wait)
/// before every run attempt; while it answers true it stays parked under its
/// key and is re-evaluated whenever that key is notified.
pub trait Operation: Send + Sync + 'static {
    /// Name of the service the operation belongs to.
    fn service_name(&self) -> &str;

    /// Executes the operation on the target member.
    fn run(&self, ctx: &OperationContext) -> Result<Response, OperationError>;

    /// Condition this operation may block on.
    fn wait_key(&self) -> Option<WaitKey> {
        None
    }

    fn should_wait(&self, _ctx: &OperationContext) -> bool {
        false
    }

    /// Resolution used when the wait expires.
    fn on_wait_expire(&self, _ctx: &OperationContext) -> OperationError {
        OperationError::WaitTimeout
    }

    /// Key to notify after a successful run, waking operations blocked on it.
    fn notified_key(&self) -> Option<WaitKey> {
        None
    }

    /// True if a successful run changes partition data and therefore bumps
    /// the owner's replica version.
    fn is_mutating(&self) -> bool {
        false
    }
}
