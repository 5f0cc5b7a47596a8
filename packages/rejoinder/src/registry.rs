// tracking of outstanding operations and of event listeners for a client session.
//
// all of the registry's mutable state sits behind a single mutex. operations arbitrate their own
// completion without it, and nothing is ever called back while it's held: cancellation,
// continuations, and listener notification all happen after the lock is released.

use crate::{
    config::Config,
    context::ExecutionContext,
    error::UsageError,
    op::{Builder, OpId, PendingOperation},
};
use bundle::Bundle;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt::{self, Formatter, Display},
    sync::{Arc, Mutex, MutexGuard, Weak},
};


/// Opaque identity of a listener
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerKey(pub u64);

impl From<u64> for ListenerKey {
    fn from(key: u64) -> Self {
        ListenerKey(key)
    }
}

impl Display for ListenerKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Subscriber to events broadcast through [`OperationRegistry::notify_all`]
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: &Bundle);
}

impl<F> Listener for F
where
    F: Fn(&Bundle) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Bundle) {
        self(event)
    }
}


/// Registry of a client session's outstanding operations and listeners
///
/// Cheap to clone; clones share the same registry.
///
/// Operations are tracked from registration until they no longer need to be found by id: once
/// their continuation has run, once they finished without one, or once a blocking
/// [`get_result`](PendingOperation::get_result) consumed their result.
///
/// Listeners are held weakly. The registry is never what keeps a listener alive, and a listener
/// whose last strong reference was dropped is skipped and purged. The context a listener is
/// notified on is held only by that listener's entry, so purging the entry releases it too.
#[derive(Clone)]
pub struct OperationRegistry(Arc<Shared>);

pub(crate) struct Shared {
    config: Config,
    lockable: Mutex<Lockable>,
}

struct Lockable {
    // registration sequence number, for deterministic bulk cancellation order.
    next_seq: u64,
    ops: HashMap<OpId, OpEntry>,
    // in registration order.
    listeners: Vec<ListenerEntry>,
}

struct OpEntry {
    seq: u64,
    op: PendingOperation,
}

struct ListenerEntry {
    key: ListenerKey,
    listener: Weak<dyn Listener>,
    // owned by the entry alone. dropped along with it on purge or removal.
    context: Arc<dyn ExecutionContext>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lockable> {
        self.lockable.lock().unwrap()
    }

    // stop tracking an operation.
    pub(crate) fn remove(&self, id: OpId) -> Option<PendingOperation> {
        let removed = self.lock().ops.remove(&id).map(|entry| entry.op);
        if removed.is_some() {
            trace!(%id, "operation released from registry");
        }
        removed
    }
}

impl Lockable {
    // drop entries for listeners that no longer exist. returns how many were dropped.
    fn purge_listeners(&mut self) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|entry| entry.listener.strong_count() > 0);
        let purged = before - self.listeners.len();
        if purged > 0 {
            trace!(purged, "purged dead listeners");
        }
        purged
    }
}

impl OperationRegistry {
    pub fn new(config: Config) -> Self {
        OperationRegistry(Arc::new(Shared {
            config,
            lockable: Mutex::new(Lockable {
                next_seq: 0,
                ops: HashMap::new(),
                listeners: Vec::new(),
            }),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Start tracking an operation, and return its id.
    ///
    /// Registering the same operation twice is harmless. An operation that already finished and
    /// was released is not tracked. Errors if the operation belongs to a different registry.
    pub fn register(&self, op: &PendingOperation) -> Result<OpId, UsageError> {
        let id = op.id();
        let mut lock = self.0.lock();
        if op.attach(&self.0)? {
            let seq = lock.next_seq;
            lock.next_seq += 1;
            lock.ops.entry(id).or_insert_with(|| OpEntry { seq, op: op.clone() });
            trace!(%id, "operation registered");
        } else {
            trace!(%id, "not registering operation that was already released");
        }
        Ok(id)
    }

    /// Build an operation with this registry's defaults, register it, then dispatch it.
    ///
    /// Registering comes first, so a transport that completes the operation synchronously from
    /// within `work` still finds it.
    pub fn start<W>(&self, mut builder: Builder, work: W) -> PendingOperation
    where
        W: Fn(OpId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if builder.context.is_none() {
            builder.context = self.0.config.default_context().cloned();
        }
        if builder.timeout.is_none() {
            builder.timeout = self.0.config.default_timeout();
        }
        let op = builder.build();
        let registered = self.register(&op);
        debug_assert!(registered.is_ok());
        let started = op.dispatch(work);
        debug_assert!(started.is_ok());
        op
    }

    /// Stop tracking an operation. Does not cancel it.
    pub fn unregister(&self, id: OpId) -> Option<PendingOperation> {
        self.0.remove(id)
    }

    pub fn lookup(&self, id: OpId) -> Option<PendingOperation> {
        self.0.lock().ops.get(&id).map(|entry| entry.op.clone())
    }

    /// Number of operations currently tracked.
    pub fn len(&self) -> usize {
        self.0.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every tracked operation, in registration order.
    ///
    /// Used when the owning session is torn down. Returns how many cancellations took effect.
    pub fn cancel_all(&self) -> usize {
        let mut ops = self.0.lock().ops.values()
            .map(|entry| (entry.seq, entry.op.clone()))
            .collect::<Vec<_>>();
        ops.sort_unstable_by_key(|&(seq, _)| seq);
        let cancelled = ops.into_iter().filter(|(_, op)| op.cancel()).count();
        debug!(cancelled, "cancelled all operations");
        cancelled
    }

    /// Add a listener, to be notified on `context`.
    ///
    /// Only a weak reference to `listener` is kept. `context` lives as long as the entry does, which
    /// ends at [`remove_listener`](Self::remove_listener), or at the next listener operation after
    /// `listener` is dropped. Errors if a live listener already has this key.
    pub fn add_listener<L: Listener>(
        &self,
        key: ListenerKey,
        listener: &Arc<L>,
        context: impl ExecutionContext,
    ) -> Result<(), UsageError> {
        let mut lock = self.0.lock();
        lock.purge_listeners();
        if lock.listeners.iter().any(|entry| entry.key == key) {
            return Err(UsageError::DuplicateListener(key));
        }
        let listener: Arc<dyn Listener> = listener.clone();
        lock.listeners.push(ListenerEntry {
            key,
            listener: Arc::downgrade(&listener),
            context: Arc::new(context),
        });
        trace!(%key, "listener added");
        Ok(())
    }

    /// Remove a listener. Returns whether it was present.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let mut lock = self.0.lock();
        lock.purge_listeners();
        let before = lock.listeners.len();
        lock.listeners.retain(|entry| entry.key != key);
        before != lock.listeners.len()
    }

    /// Post `event` to every live listener's context, in registration order.
    ///
    /// Returns how many listeners it was posted to.
    pub fn notify_all(&self, event: Bundle) -> usize {
        let live: SmallVec<[(Arc<dyn Listener>, Arc<dyn ExecutionContext>); 4]> = {
            let mut lock = self.0.lock();
            lock.purge_listeners();
            lock.listeners.iter()
                .filter_map(|entry| Some((entry.listener.upgrade()?, Arc::clone(&entry.context))))
                .collect()
        };
        let event = Arc::new(event);
        for (listener, context) in &live {
            let listener = Arc::clone(listener);
            let event = Arc::clone(&event);
            context.post(Box::new(move || listener.on_event(&event)));
        }
        trace!(notified = live.len(), "notified listeners");
        live.len()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        let mut lock = self.0.lock();
        lock.purge_listeners();
        lock.listeners.len()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        OperationRegistry::new(Config::default())
    }
}
