//! In-flight asynchronous operations.
//!
//! A [`PendingOperation`] moves through these states:
//!
//! ```text
//! Created --dispatch--> Dispatched --complete--> Completed
//!    |                    |   ^  \
//!    |                    |   |   \--cancel/timeout--> Cancelled
//!    |                    \---/
//!    |              redirect/retry
//!    \--------------cancel--------------------------> Cancelled
//! ```
//!
//! The terminal states are final. The transition into one of them is arbitrated by a per-operation
//! write-once slot, so of all the racing `complete` and `cancel` calls exactly one wins, and every
//! reader (blocking, async, or continuation) observes the winner's envelope.

mod polling;

use self::polling::{block_on, Timeout};
use crate::{
    context::{self, ExecutionContext},
    envelope::{ContinuationToken, ErrorKind, RedirectAction, ResultEnvelope},
    error::UsageError,
    registry,
    shape::{AnyShape, ResponseShape},
};
use bundle::{Bundle, BundleError};
use smallvec::SmallVec;
use std::{
    fmt::{self, Formatter, Debug, Display},
    future::Future,
    mem::take,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::{Relaxed, SeqCst}},
        Arc, Mutex, OnceLock, Weak,
    },
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};


/// Process-unique correlation id of an operation
///
/// Assigned when the operation is built and never reused. Stays the same across redirects and
/// retries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpId(u64);

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

impl OpId {
    fn mint() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Lifecycle state of an operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OpState {
    /// Built, but the request was not yet handed to the transport
    Created,
    /// Handed to the transport, awaiting completion
    Dispatched,
    /// Terminal: completed with an envelope
    Completed,
    /// Terminal: cancelled locally, by timeout, or by the remote side
    Cancelled,
}

/// How many times the remote side may ask for a request to be re-issued before the operation fails
pub const MAX_RETRIES: u32 = 8;


/// Work that hands an operation's request to the transport.
///
/// May be invoked more than once, since the remote side can ask for a retry.
pub type Work = Arc<dyn Fn(OpId) -> anyhow::Result<()> + Send + Sync>;

/// Callback that receives an operation's final envelope on its execution context.
pub type Continuation = Box<dyn FnOnce(ResultEnvelope) + Send + 'static>;

/// Request from the remote side for an out-of-band step before the operation can finish
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Redirect {
    /// The operation, whose follow-up result will arrive under this same id
    pub id: OpId,
    pub token: ContinuationToken,
    pub payload: Bundle,
}

/// Performs the out-of-band step a [`Redirect`] asks for
///
/// Runs on the operation's execution context. Once the step is done, the follow-up result is
/// delivered to the dispatcher under the same [`OpId`] as usual.
pub trait RedirectHandler: Send + Sync + 'static {
    fn on_redirect(&self, redirect: Redirect);
}

impl<F> RedirectHandler for F
where
    F: Fn(Redirect) + Send + Sync + 'static,
{
    fn on_redirect(&self, redirect: Redirect) {
        self(redirect)
    }
}


// contents of the completion slot.
struct Terminal {
    cancelled: bool,
    envelope: ResultEnvelope,
}

// operation shared state.
pub(crate) struct Shared {
    id: OpId,
    // write-once. whoever sets it decides the outcome.
    slot: OnceLock<Terminal>,
    // set on dispatch. its presence is what distinguishes Dispatched from Created.
    work: OnceLock<Work>,
    // waiters to wake once the slot is set, one per polling handle. finish sets the slot before
    // locking this, and poll checks the slot while holding this, so no wakeup is lost.
    wakers: Mutex<SmallVec<[(u64, Waker); 2]>>,
    next_waiter: AtomicU64,
    retries: AtomicU32,
    context: Arc<dyn ExecutionContext>,
    // taken by whoever sets the slot.
    continuation: Mutex<Option<Continuation>>,
    redirect_handler: Option<Arc<dyn RedirectHandler>>,
    shape: Arc<dyn ResponseShape>,
    timeout: Option<Duration>,
    registry: OnceLock<Weak<registry::Shared>>,
    // set once the operation no longer needs to be tracked by a registry. set before reading
    // `registry`, and checked by the registry after writing `registry` under its lock.
    released: AtomicBool,
}


/// Builder for a [`PendingOperation`]
pub struct Builder {
    pub(crate) context: Option<Arc<dyn ExecutionContext>>,
    continuation: Option<Continuation>,
    redirect_handler: Option<Arc<dyn RedirectHandler>>,
    shape: Arc<dyn ResponseShape>,
    pub(crate) timeout: Option<Duration>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            context: None,
            continuation: None,
            redirect_handler: None,
            shape: Arc::new(AnyShape),
            timeout: None,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution context continuations and redirect handlers run on
    ///
    /// Defaults to the process-wide main looper.
    pub fn context(mut self, context: impl ExecutionContext) -> Self {
        self.context = Some(Arc::new(context));
        self
    }

    /// Set the continuation to run once the operation reaches a terminal state
    pub fn on_complete(mut self, continuation: impl FnOnce(ResultEnvelope) + Send + 'static) -> Self {
        self.continuation = Some(Box::new(continuation));
        self
    }

    /// Set the handler for redirects that need an out-of-band step
    ///
    /// Without one, such a redirect becomes the operation's final envelope, and the caller has to
    /// perform the step and issue a new request itself.
    pub fn on_redirect(mut self, handler: impl RedirectHandler) -> Self {
        self.redirect_handler = Some(Arc::new(handler));
        self
    }

    /// Set the shape a success payload must have
    pub fn expect(mut self, shape: impl ResponseShape) -> Self {
        self.shape = Arc::new(shape);
        self
    }

    /// Set the timeout [`PendingOperation::get_result`] uses when not given one
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the operation, in the [`OpState::Created`] state.
    pub fn build(self) -> PendingOperation {
        PendingOperation::from_shared(Arc::new(Shared {
            id: OpId::mint(),
            slot: OnceLock::new(),
            work: OnceLock::new(),
            wakers: Mutex::new(SmallVec::new()),
            next_waiter: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            context: self.context
                .unwrap_or_else(|| Arc::new(context::main()) as Arc<dyn ExecutionContext>),
            continuation: Mutex::new(self.continuation),
            redirect_handler: self.redirect_handler,
            shape: self.shape,
            timeout: self.timeout,
            registry: OnceLock::new(),
            released: AtomicBool::new(false),
        }))
    }

    /// Build the operation and immediately dispatch it.
    pub fn start<W>(self, work: W) -> PendingOperation
    where
        W: Fn(OpId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let op = self.build();
        let started = op.dispatch(work);
        debug_assert!(started.is_ok());
        op
    }
}


/// Handle to a single in-flight asynchronous call
///
/// Handles are cheap to clone, and all clones refer to the same operation. The outcome can be
/// observed in three equivalent ways:
///
/// - by blocking, with [`get_result`](Self::get_result).
/// - by awaiting the handle, which is a future resolving to the final envelope.
/// - by the continuation set with [`Builder::on_complete`], which runs on the operation's
///   execution context.
pub struct PendingOperation {
    shared: Arc<Shared>,
    // for implementation of FusedFuture
    observed: bool,
    // key of this handle's entry in the waker list, once it has been polled
    waiter: Option<u64>,
}

impl PendingOperation {
    /// Construct a [`Builder`].
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Shorthand for building with defaults and immediately dispatching.
    pub fn start<W>(work: W) -> Self
    where
        W: Fn(OpId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Builder::new().start(work)
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        PendingOperation { shared, observed: false, waiter: None }
    }

    pub fn id(&self) -> OpId {
        self.shared.id
    }

    pub fn state(&self) -> OpState {
        match self.shared.slot.get() {
            Some(&Terminal { cancelled: true, .. }) => OpState::Cancelled,
            Some(&Terminal { cancelled: false, .. }) => OpState::Completed,
            None if self.shared.work.get().is_some() => OpState::Dispatched,
            None => OpState::Created,
        }
    }

    /// Whether the operation has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.shared.slot.get().is_some()
    }

    /// The final envelope, if the operation has reached a terminal state. Never blocks.
    pub fn outcome(&self) -> Option<ResultEnvelope> {
        self.shared.slot.get().map(|terminal| terminal.envelope.clone())
    }

    /// Hand the request to the transport by invoking `work` with this operation's id.
    ///
    /// If `work` errors or panics, the operation completes with an
    /// [`ErrorKind::RemoteFailure`] failure. Errors if the operation was already dispatched.
    pub fn dispatch<W>(&self, work: W) -> Result<(), UsageError>
    where
        W: Fn(OpId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let work: Work = Arc::new(work);
        if self.shared.work.set(Arc::clone(&work)).is_err() {
            return Err(UsageError::AlreadyStarted(self.id()));
        }
        if self.is_done() {
            trace!(id = %self.id(), "not dispatching operation that already finished");
            return Ok(());
        }
        self.run_work(&work);
        Ok(())
    }

    /// Offer an envelope as this operation's outcome.
    ///
    /// Only the first envelope to reach a terminal state has any effect. Returns whether this call
    /// was it. Redirects are handled rather than stored, if possible:
    ///
    /// - A [`RedirectAction::Retry`] redirect re-invokes the dispatched work, with the same id. After
    ///   [`MAX_RETRIES`] of these the operation fails with [`ErrorKind::RemoteFailure`] instead.
    /// - A [`RedirectAction::Launch`] redirect is posted to the redirect handler, if there is one.
    ///
    /// Either way the operation stays [`OpState::Dispatched`], and this returns false.
    pub fn complete(&self, envelope: ResultEnvelope) -> bool {
        let id = self.id();
        if self.is_done() {
            trace!(%id, "ignoring envelope for operation that already finished");
            return false;
        }
        match envelope.redirect_action() {
            Some(RedirectAction::Retry) => if let Some(work) = self.shared.work.get() {
                let attempt = self.shared.retries.fetch_add(1, SeqCst) + 1;
                if attempt > MAX_RETRIES {
                    warn!(%id, "remote side kept asking for retries, giving up");
                    return self.finish(
                        ResultEnvelope::failure(ErrorKind::RemoteFailure, "too many retries"),
                        false,
                    );
                }
                debug!(%id, attempt, "remote side asked for retry");
                let work = Arc::clone(work);
                self.run_work(&work);
                return false;
            },
            Some(RedirectAction::Launch) => if let Some(handler) = &self.shared.redirect_handler {
                if let ResultEnvelope::Redirect { token, payload } = envelope {
                    debug!(%id, %token, "remote side asked for out-of-band step");
                    let handler = Arc::clone(handler);
                    let redirect = Redirect { id, token, payload };
                    let this = self.clone();
                    self.shared.context.post(Box::new(move || {
                        if catch_unwind(AssertUnwindSafe(|| handler.on_redirect(redirect))).is_err() {
                            error!(%id, "redirect handler panicked");
                            let failure = ResultEnvelope::failure(
                                ErrorKind::RemoteFailure,
                                "redirect handler panicked",
                            );
                            this.finish(failure, false);
                        }
                    }));
                    return false;
                }
            },
            None => (),
        }
        self.finish(envelope, false)
    }

    /// Cancel the operation, unless it already reached a terminal state.
    ///
    /// Returns whether cancellation took effect. This does not stop the remote side. It only
    /// guarantees that no later result is delivered locally.
    pub fn cancel(&self) -> bool {
        self.cancel_with("operation cancelled")
    }

    pub(crate) fn cancel_with(&self, message: impl Into<String>) -> bool {
        let cancelled = self.finish(ResultEnvelope::failure(ErrorKind::Cancelled, message), true);
        if cancelled {
            debug!(id = %self.id(), "operation cancelled");
        }
        cancelled
    }

    /// Block until the operation reaches a terminal state, and return its envelope.
    ///
    /// If `timeout` is none, the operation's default timeout is used, and if that is also none this
    /// may block forever. If the timeout elapses, the operation is cancelled first, so it is always
    /// left in a terminal state.
    ///
    /// Errors without blocking if the calling thread is the operation's execution context and the
    /// operation has not yet finished, since the completion would have to be delivered on this
    /// very thread.
    pub fn get_result(&self, timeout: Option<Duration>) -> Result<ResultEnvelope, UsageError> {
        if !self.is_done() && self.shared.context.is_current() {
            return Err(UsageError::WouldDeadlock(self.id()));
        }
        let timeout = timeout.or(self.shared.timeout)
            .and_then(|timeout| Instant::now().checked_add(timeout))
            .map(Timeout::At)
            .unwrap_or(Timeout::Never);
        let mut wait = self.clone();
        let envelope = match block_on(&mut wait, timeout) {
            Some(envelope) => envelope,
            None => {
                self.cancel_with("timed out waiting for result");
                // whether or not we won, the slot is set once cancel_with returns
                match self.outcome() {
                    Some(envelope) => envelope,
                    None => unreachable!("operation not finished after cancel"),
                }
            }
        };
        self.release();
        Ok(envelope)
    }

    pub(crate) fn check_shape(&self, payload: &Bundle) -> Result<(), BundleError> {
        self.shared.shape.check(payload)
    }

    // associate with a registry. returns whether the registry should track this operation.
    //
    // the caller must hold the registry's lock.
    pub(crate) fn attach(&self, registry: &Arc<registry::Shared>) -> Result<bool, UsageError> {
        let weak = Arc::downgrade(registry);
        let attached = self.shared.registry.get_or_init(|| weak.clone());
        if !Weak::ptr_eq(attached, &weak) {
            return Err(UsageError::ForeignRegistry(self.id()));
        }
        Ok(!self.shared.released.load(SeqCst))
    }

    // invoke the work, converting failure into completion.
    fn run_work(&self, work: &Work) {
        let id = self.id();
        trace!(%id, "dispatching operation");
        let error = match catch_unwind(AssertUnwindSafe(|| work(id))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => "dispatch panicked".to_owned(),
        };
        debug!(%id, %error, "dispatch failed");
        self.finish(ResultEnvelope::failure(ErrorKind::RemoteFailure, error), false);
    }

    // try to move into a terminal state. returns whether we won.
    fn finish(&self, envelope: ResultEnvelope, cancelled: bool) -> bool {
        let id = self.id();
        let terminal = Terminal { cancelled, envelope: envelope.clone() };
        if self.shared.slot.set(terminal).is_err() {
            trace!(%id, "operation already finished, ignoring");
            return false;
        }
        trace!(%id, cancelled, "operation finished");

        // wake blocked and async waiters
        let wakers = take(&mut *self.shared.wakers.lock().unwrap());
        for (_, waker) in wakers {
            waker.wake();
        }

        // schedule continuation, and stop being tracked once it has run, even if it panicked
        let continuation = self.shared.continuation.lock().unwrap().take();
        match continuation {
            Some(continuation) => {
                let this = self.clone();
                self.shared.context.post(Box::new(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| continuation(envelope)));
                    this.release();
                    if result.is_err() {
                        error!(id = %this.id(), "continuation panicked");
                    }
                }));
            }
            None => self.release(),
        }
        true
    }

    // stop being tracked by the registry, if any.
    fn release(&self) {
        self.shared.released.store(true, SeqCst);
        if let Some(registry) = self.shared.registry.get().and_then(Weak::upgrade) {
            registry.remove(self.id());
        }
    }
}

impl Clone for PendingOperation {
    fn clone(&self) -> Self {
        PendingOperation::from_shared(Arc::clone(&self.shared))
    }
}

impl Future for PendingOperation {
    type Output = ResultEnvelope;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<ResultEnvelope> {
        let this = self.get_mut();
        // for implementation of FusedFuture
        if this.observed {
            return Poll::Pending;
        }
        let mut wakers = this.shared.wakers.lock().unwrap();
        if let Some(envelope) = this.outcome() {
            this.observed = true;
            return Poll::Ready(envelope);
        }
        // each handle keeps at most one waker registered, replaced on repoll
        let key = *this.waiter
            .get_or_insert_with(|| this.shared.next_waiter.fetch_add(1, Relaxed));
        match wakers.iter_mut().find(|(k, _)| *k == key) {
            Some((_, waker)) => {
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => wakers.push((key, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if let Some(key) = self.waiter {
            if let Ok(mut wakers) = self.shared.wakers.lock() {
                wakers.retain(|(k, _)| *k != key);
            }
        }
    }
}

#[cfg(feature = "futures")]
impl futures::future::FusedFuture for PendingOperation {
    fn is_terminated(&self) -> bool {
        self.observed
    }
}

impl Debug for PendingOperation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
