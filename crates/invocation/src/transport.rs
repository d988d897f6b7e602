//! The contract that carries operations between members.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corelib::{Address, PartitionId};
use tokio::sync::mpsc;

use crate::error::{OperationError, TransportError};
use crate::operation::{CallId, Operation, Response};

/// An operation on its way to the member that runs it.
#[derive(Clone)]
pub struct OperationRequest {
    pub call_id: CallId,
    pub caller: Address,
    pub partition_id: Option<PartitionId>,
    pub operation: Arc<dyn Operation>,
    /// How long a blocking operation may stay parked on the target.
    pub wait_timeout: Option<Duration>,
}

impl fmt::Debug for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRequest")
            .field("call_id", &self.call_id)
            .field("caller", &self.caller)
            .field("partition_id", &self.partition_id)
            .field("service", &self.operation.service_name())
            .finish()
    }
}

/// Messages the target sends back for one request.
///
/// `Parked` may precede the final `Done`; nothing follows `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Parked,
    Done(Result<Response, OperationError>),
}

pub type ReplySender = mpsc::UnboundedSender<Reply>;
pub type ReplyReceiver = mpsc::UnboundedReceiver<Reply>;

/// Delivers requests to other members.
///
/// A closed reply stream without `Done` means the connection to the target
/// was lost.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        target: &Address,
        request: OperationRequest,
    ) -> Result<ReplyReceiver, TransportError>;
}
