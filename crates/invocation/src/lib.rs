//! Operation invocation for the partitioned grid.
//!
//! This crate moves operations from the member that invokes them to the
//! member that runs them, and back:
//! - [`Operation`]: the unit of work, immediate or blocking
//! - [`OperationInvocationService`]: target resolution, retries, futures
//! - [`OperationRunner`]: target-side execution on the partition's worker
//! - [`WaitNotifyRegistry`]: parked blocking operations
//! - [`Transport`]: the contract that carries requests between members

pub mod error;
pub mod operation;
pub mod parker;
pub mod runner;
pub mod service;
pub mod transport;

pub use error::{InvocationError, OperationError, TransportError};
pub use operation::{CallId, Operation, OperationContext, Response, WaitKey};
pub use parker::{ParkedEntry, WaitNotifyRegistry};
pub use runner::OperationRunner;
pub use service::{InvocationFuture, InvocationState, OperationInvocationService};
pub use transport::{OperationRequest, Reply, ReplyReceiver, ReplySender, Transport};
