// caller-misuse error type.

use crate::{
    op::OpId,
    registry::ListenerKey,
};
use thiserror::Error;


/// Error for misusing the API
///
/// These indicate a programming mistake at the call site. They are returned synchronously and are
/// never delivered through a [`ResultEnvelope`](crate::ResultEnvelope).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum UsageError {
    /// Blocking on an operation from the execution context that would have to run to complete it
    #[error("blocking on {0} from its own callback context would deadlock")]
    WouldDeadlock(OpId),
    /// Adding a listener under a key that already has a live listener
    #[error("listener {0} is already registered")]
    DuplicateListener(ListenerKey),
    /// Starting an operation that was already started
    #[error("{0} was already started")]
    AlreadyStarted(OpId),
    /// Registering an operation that already belongs to a different registry
    #[error("{0} is already registered with a different registry")]
    ForeignRegistry(OpId),
    /// Passing an empty value for a required argument
    #[error("{0} must not be empty")]
    Empty(&'static str),
}
