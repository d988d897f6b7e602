//! Invocation error types.
//!
//! [`OperationError`] travels from the executing member back to the invoker.
//! [`InvocationError`] is what an invocation future resolves with.

use corelib::{Address, PartitionId};

use crate::operation::CallId;

/// Failure reported by the member that received an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The receiver does not own the partition.
    #[error("{target} is not the owner of partition {partition_id}")]
    WrongTarget {
        partition_id: PartitionId,
        target: Address,
    },

    /// The partition is being handed to another member.
    #[error("partition {0} is migrating")]
    PartitionMigrating(PartitionId),

    /// A blocking operation's wait expired.
    #[error("wait timed out")]
    WaitTimeout,

    /// The member the operation depends on left the cluster.
    #[error("{0} left the cluster")]
    MemberLeft(Address),

    /// The receiver is shutting down.
    #[error("target is shutting down")]
    ShuttingDown,

    /// Failure raised by the operation itself.
    #[error("{0}")]
    Application(String),
}

impl OperationError {
    /// True if resending to the current owner may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WrongTarget { .. } | Self::PartitionMigrating(_) | Self::ShuttingDown
        )
    }
}

/// Failure to deliver a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{0} is unreachable")]
    Unreachable(Address),

    #[error("transport closed")]
    Closed,
}

/// Terminal failure of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    /// The target left while the operation was on the wire or waiting. The
    /// outcome on that member is unknown, so it is not retried.
    #[error("target {target} left the cluster")]
    MemberLeft { target: Address },

    /// Deadline passed or retry budget exhausted.
    #[error("invocation {call_id} timed out after {retries} retries: {reason}")]
    OperationTimeout {
        call_id: CallId,
        retries: u32,
        reason: String,
    },

    /// A blocking operation's wait expired on the target.
    #[error("invocation {0} wait timed out")]
    WaitTimeout(CallId),

    /// The target accepted the operation but its reply stream closed before
    /// a result arrived. The outcome is unknown, so it is not retried.
    #[error("invocation {call_id} lost its reply from {target}")]
    ReplyLost { call_id: CallId, target: Address },

    /// The partition has no owner yet.
    #[error("partition {0} has no owner")]
    PartitionUnassigned(PartitionId),

    #[error(transparent)]
    Operation(OperationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] corelib::Error),

    #[error("invocation service shut down")]
    Shutdown,
}

impl InvocationError {
    /// True for failures the invoker handles by resending.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PartitionUnassigned(_) | Self::Transport(_) => true,
            Self::Operation(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::OperationTimeout { .. } | Self::WaitTimeout(_))
    }
}
