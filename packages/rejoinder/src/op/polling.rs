// blocking on a future from a plain thread.
//
// design based on pollster crate. the waker is an Arc'd mutex + condvar pair rather than a
// pointer to a stack local, so futures are free to hold on to wakers after we return.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};


// timeout for blocking on a future.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
}

// poll the future until it resolves, or return none if the timeout is reached first.
pub(crate) fn block_on<F>(fut: &mut F, timeout: Timeout) -> Option<F::Output>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            return Some(output);
        }

        // otherwise, block until notification or timeout
        let mut lock = signal.state.lock().unwrap();

        // if a notification is already present, skip to the next loop iteration so as to release
        // the lock and try polling again without blocking.
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        debug_assert!(matches!(*lock, State::Empty));
        *lock = State::Waiting;
        match timeout {
            Timeout::Never =>
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                },
            Timeout::At(deadline) =>
                while let State::Waiting = *lock {
                    let Some(duration) = deadline.checked_duration_since(Instant::now())
                        else { return None };
                    let (lock2, wait_result) = signal.cond.wait_timeout(lock, duration).unwrap();
                    lock = lock2;
                    if wait_result.timed_out() && matches!(*lock, State::Waiting) {
                        return None;
                    }
                },
        }
        *lock = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        future::pending,
        sync::atomic::{AtomicBool, Ordering::SeqCst},
        thread,
        time::Duration,
    };

    // resolves once the flag is set, waking through whatever waker it was last polled with.
    struct Flag(Arc<(AtomicBool, Mutex<Option<Waker>>)>);

    impl Future for Flag {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
            let mut waker = self.0.1.lock().unwrap();
            if self.0.0.load(SeqCst) {
                Poll::Ready(())
            } else {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    #[test]
    fn times_out() {
        let start = Instant::now();
        let mut fut = Box::pin(pending::<()>());
        let deadline = start + Duration::from_millis(50);
        assert!(block_on(&mut fut, Timeout::At(deadline)).is_none());
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn woken_from_other_thread() {
        let shared = Arc::new((AtomicBool::new(false), Mutex::new(None::<Waker>)));
        let mut fut = Flag(Arc::clone(&shared));
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let waker = {
                let mut slot = shared.1.lock().unwrap();
                shared.0.store(true, SeqCst);
                slot.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        assert_eq!(block_on(&mut fut, Timeout::Never), Some(()));
        join.join().unwrap();
    }
}
