//! Asynchronous, cancelable, typed-result completion core for request/response IPC.
//!
//! A caller starts a [`PendingOperation`] whose request crosses a process boundary through some
//! transport. The transport later reports back, on a thread it owns, through the
//! [`CompletionDispatcher`], which completes the operation exactly once and schedules its
//! continuation on the [`ExecutionContext`] the operation recorded. Callers can block on the
//! operation, await it, or just let the continuation run.

#[macro_use]
extern crate tracing;

pub extern crate bundle;
pub use bundle::bytes;

pub mod context;
pub mod envelope;
pub mod shape;
pub mod op;
mod dispatcher;
mod registry;
mod config;
mod error;

pub use crate::{
    config::Config,
    context::{ExecutionContext, Immediate, Looper, Task},
    dispatcher::CompletionDispatcher,
    envelope::{ErrorKind, Failure, ResultEnvelope},
    error::UsageError,
    op::{OpId, OpState, PendingOperation},
    registry::{ListenerKey, Listener, OperationRegistry},
};
pub use bundle::{Bundle, BundleError, Value};
