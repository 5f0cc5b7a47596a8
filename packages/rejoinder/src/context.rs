//! Execution contexts that continuations and listener notifications are posted to.

use std::{
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
};
use tokio::sync::mpsc;


/// Unit of work posted to an [`ExecutionContext`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Place where posted tasks run later, such as a UI loop or an event loop
pub trait ExecutionContext: Send + Sync + 'static {
    /// Arrange for `task` to run on this context. Must not block.
    fn post(&self, task: Task);

    /// Whether the calling thread is the one this context runs tasks on.
    ///
    /// Blocking on an operation from such a thread is refused, because the completion it waits
    /// for would have to be delivered by that same thread.
    fn is_current(&self) -> bool;
}

impl<C: ExecutionContext + ?Sized> ExecutionContext for Arc<C> {
    fn post(&self, task: Task) {
        (**self).post(task)
    }

    fn is_current(&self) -> bool {
        (**self).is_current()
    }
}


/// Context that runs tasks inline, on whichever thread posts them.
///
/// Never current, since nothing ever waits on it.
#[derive(Debug, Copy, Clone, Default)]
pub struct Immediate;

impl ExecutionContext for Immediate {
    fn post(&self, task: Task) {
        task();
    }

    fn is_current(&self) -> bool {
        false
    }
}


/// Single dedicated thread that runs posted tasks one at a time in FIFO order.
///
/// Internally the thread drives a tokio current-thread runtime which drains an unbounded task
/// channel. The thread exits once every handle to the looper has been dropped and the remaining
/// tasks have run. A task that panics is logged and does not take the looper down.
#[derive(Clone)]
pub struct Looper(Arc<LooperShared>);

struct LooperShared {
    name: String,
    thread: ThreadId,
    send: mpsc::UnboundedSender<Task>,
}

impl Looper {
    /// Spawn a new looper thread with the given name.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let (send, mut recv) = mpsc::unbounded_channel::<Task>();
        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async {
                    while let Some(task) = recv.recv().await {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!(looper = %thread_name, "task panicked");
                        }
                    }
                });
                trace!(looper = %thread_name, "looper exiting");
            })?;
        Ok(Looper(Arc::new(LooperShared {
            name,
            thread: join.thread().id(),
            send,
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl ExecutionContext for Looper {
    fn post(&self, task: Task) {
        if self.0.send.send(task).is_err() {
            warn!(looper = %self.0.name, "posted task to stopped looper, dropping it");
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.0.thread
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Looper").field(&self.0.name).finish()
    }
}


static MAIN: OnceLock<Looper> = OnceLock::new();

/// The process-wide main looper, spawned on first use.
///
/// This is the default callback context for operations that don't pick one.
pub fn main() -> Looper {
    MAIN.get_or_init(|| Looper::spawn("rejoinder-main").expect("failed to spawn main looper"))
        .clone()
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::mpsc,
        time::Duration,
    };

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn looper_runs_in_order_on_its_own_thread() {
        let looper = Looper::spawn("test-looper").unwrap();
        assert!(!looper.is_current());
        let (send, recv) = mpsc::channel();
        for i in 0..100 {
            let send = send.clone();
            let inner = looper.clone();
            looper.post(Box::new(move || {
                send.send((i, inner.is_current())).unwrap();
            }));
        }
        for i in 0..100 {
            assert_eq!(recv.recv_timeout(WAIT).unwrap(), (i, true));
        }
    }

    #[test]
    fn looper_survives_panicking_task() {
        let looper = Looper::spawn("test-looper-panic").unwrap();
        looper.post(Box::new(|| panic!("boom")));
        let (send, recv) = mpsc::channel();
        looper.post(Box::new(move || send.send(()).unwrap()));
        recv.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn immediate_runs_inline() {
        let (send, recv) = mpsc::channel();
        Immediate.post(Box::new(move || send.send(thread::current().id()).unwrap()));
        assert_eq!(recv.try_recv().unwrap(), thread::current().id());
        assert!(!Immediate.is_current());
    }

    #[test]
    fn main_looper_is_shared() {
        let a = main();
        let b = main();
        assert_eq!(a.name(), "rejoinder-main");
        let (send, recv) = mpsc::channel();
        a.post(Box::new(move || send.send(b.is_current()).unwrap()));
        assert!(recv.recv_timeout(WAIT).unwrap());
    }
}
