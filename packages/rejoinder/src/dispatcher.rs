// entry point for completion signals from the transport.
//
// the transport calls in on threads it owns, so nothing here may panic out to the caller or block.
// a signal for an id the registry doesn't know is normal: the operation may have been cancelled,
// timed out, or consumed already.

use crate::{
    envelope::{ErrorKind, Failure, ResultEnvelope},
    op::{OpId, PendingOperation},
    registry::OperationRegistry,
};
use bundle::Bundle;
use std::panic::{catch_unwind, AssertUnwindSafe};


/// Translates completion signals from the transport into operation completions
///
/// Cheap to clone. Each method looks the operation up by correlation id in the registry, completes
/// it at most once, and returns without ever panicking.
#[derive(Clone)]
pub struct CompletionDispatcher {
    registry: OperationRegistry,
}

impl CompletionDispatcher {
    pub fn new(registry: OperationRegistry) -> Self {
        CompletionDispatcher { registry }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Deliver a raw result payload.
    ///
    /// The payload is classified with [`ResultEnvelope::from_raw`]. A success payload that does
    /// not match the operation's expected shape completes it with an
    /// [`ErrorKind::InvalidResponse`] failure.
    pub fn on_result(&self, id: OpId, raw: Bundle) {
        self.guarded(id, |op| deliver(op, ResultEnvelope::from_raw(raw)));
    }

    /// Deliver a failure.
    ///
    /// Failures of a [cancellation kind](ErrorKind::is_cancellation) cancel the operation instead.
    pub fn on_error(&self, id: OpId, kind: ErrorKind, message: impl Into<String>) {
        let failure = Failure::new(kind, message);
        self.guarded(id, |op| deliver(op, ResultEnvelope::Failure(failure)));
    }

    /// Deliver a failure given as an integer wire code.
    pub fn on_error_code(&self, id: OpId, code: i32, message: impl Into<String>) {
        let failure = Failure::from_code(code, message);
        self.guarded(id, |op| deliver(op, ResultEnvelope::Failure(failure)));
    }

    // look up the operation and run f on it, containing any panic. an operation the panic left
    // unfinished is completed as an invalid response, so its waiters don't hang.
    fn guarded<F: FnOnce(&PendingOperation)>(&self, id: OpId, f: F) {
        let Some(op) = self.registry.lookup(id) else {
            debug!(%id, "completion for unknown operation, discarding");
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| f(&op))).is_err() {
            error!(%id, "panic while delivering completion");
            op.complete(ResultEnvelope::failure(
                ErrorKind::InvalidResponse,
                "panic while delivering completion",
            ));
        }
    }
}

fn deliver(op: &PendingOperation, envelope: ResultEnvelope) {
    let id = op.id();
    match envelope {
        ResultEnvelope::Success(payload) => match op.check_shape(&payload) {
            Ok(()) => {
                op.complete(ResultEnvelope::Success(payload));
            }
            Err(e) => {
                debug!(%id, error = %e, "response does not have expected shape");
                op.complete(ResultEnvelope::failure(ErrorKind::InvalidResponse, e.to_string()));
            }
        },
        ResultEnvelope::Failure(failure) if failure.kind.is_cancellation() => {
            debug!(%id, kind = ?failure.kind, "remote side cancelled operation");
            op.cancel_with(failure.message);
        }
        envelope => {
            op.complete(envelope);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        context::{ExecutionContext, Immediate, Looper},
        envelope::{KEY_ERROR_CODE, KEY_INTENT, KEY_RETRY},
        op::{Builder, OpState, Redirect, MAX_RETRIES},
        shape::RequiredKeys,
    };
    use bundle::bundle;
    use std::{
        sync::{mpsc, Arc, Mutex},
        thread,
        time::Duration,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (OperationRegistry, CompletionDispatcher) {
        let registry = OperationRegistry::new(Config::new().with_default_context(Immediate));
        let dispatcher = CompletionDispatcher::new(registry.clone());
        (registry, dispatcher)
    }

    fn idle(_: OpId) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn account_result_scenario() {
        let (registry, dispatcher) = setup();
        let op = PendingOperation::start(idle);
        registry.register(&op).unwrap();

        let payload = bundle! { "accountName" => "a@b.com", "accountType" => "com.example" };
        thread::spawn({
            let dispatcher = dispatcher.clone();
            let payload = payload.clone();
            let id = op.id();
            move || dispatcher.on_result(id, payload)
        }).join().unwrap();

        assert_eq!(op.get_result(Some(WAIT)), Ok(ResultEnvelope::Success(payload)));
        registry.unregister(op.id());
        assert!(registry.lookup(op.id()).is_none());
    }

    #[test]
    fn unknown_id_is_discarded() {
        let (registry, dispatcher) = setup();
        let op = registry.start(Builder::new(), idle);
        op.cancel();
        // released on cancel, so these are late signals
        dispatcher.on_result(op.id(), bundle! { "x" => 1 });
        dispatcher.on_error(op.id(), ErrorKind::NetworkError, "late");
        assert!(op.outcome().unwrap().is_cancelled());
    }

    #[test]
    fn shape_mismatch_is_invalid_response() {
        let (registry, dispatcher) = setup();
        let op = registry.start(
            Builder::new().expect(RequiredKeys(&["authAccount", "accountType"])),
            idle,
        );
        dispatcher.on_result(op.id(), bundle! { "authAccount" => "a@b.com" });
        let failure = op.outcome().unwrap().into_result().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::InvalidResponse);
        assert!(failure.message.contains("accountType"));
    }

    #[test]
    fn errors_complete_or_cancel() {
        let (registry, dispatcher) = setup();

        let op = registry.start(Builder::new(), idle);
        dispatcher.on_error(op.id(), ErrorKind::NetworkError, "offline");
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(op.outcome(), Some(ResultEnvelope::failure(ErrorKind::NetworkError, "offline")));

        for kind in [ErrorKind::Cancelled, ErrorKind::PermissionDenied] {
            let op = registry.start(Builder::new(), idle);
            dispatcher.on_error(op.id(), kind, "stop");
            assert_eq!(op.state(), OpState::Cancelled);
            assert!(op.outcome().unwrap().is_cancelled());
        }

        let op = registry.start(Builder::new(), idle);
        dispatcher.on_error_code(op.id(), 101, "restricted");
        assert_eq!(op.state(), OpState::Cancelled);

        let op = registry.start(Builder::new(), idle);
        dispatcher.on_result(op.id(), bundle! { KEY_ERROR_CODE => 8, "errorMessage" => "bad" });
        assert_eq!(op.outcome(), Some(ResultEnvelope::failure(ErrorKind::BadRequest, "bad")));
    }

    #[test]
    fn duplicate_deliveries_are_absorbed() {
        let (registry, dispatcher) = setup();
        let (send, recv) = mpsc::channel();
        let op = registry.start(
            Builder::new().on_complete(move |envelope| send.send(envelope).unwrap()),
            idle,
        );
        let joins = (0..8)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                let id = op.id();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        dispatcher.on_result(id, bundle! { "i" => i });
                    } else {
                        dispatcher.on_error(id, ErrorKind::RemoteFailure, "crashed");
                    }
                })
            })
            .collect::<Vec<_>>();
        for join in joins {
            join.join().unwrap();
        }
        let delivered = recv.recv_timeout(WAIT).unwrap();
        assert!(recv.try_recv().is_err());
        assert_eq!(op.outcome(), Some(delivered));
    }

    #[test]
    fn redirect_preserves_identity() {
        let (registry, dispatcher) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let looper = Looper::spawn("test-redirect").unwrap();

        // the out-of-band step: runs on the looper, then reports back under the same id
        let op = registry.start(
            Builder::new()
                .context(looper)
                .on_redirect({
                    let dispatcher = dispatcher.clone();
                    let seen = Arc::clone(&seen);
                    move |redirect: Redirect| {
                        seen.lock().unwrap().push(redirect.id);
                        assert_eq!(redirect.token.as_str(), "confirm-credentials");
                        let dispatcher = dispatcher.clone();
                        thread::spawn(move || {
                            dispatcher.on_result(redirect.id, bundle! { "booleanResult" => true });
                        });
                    }
                }),
            idle,
        );
        seen.lock().unwrap().push(op.id());
        dispatcher.on_result(op.id(), bundle! { KEY_INTENT => "confirm-credentials" });

        let envelope = op.get_result(Some(WAIT)).unwrap();
        assert_eq!(envelope, ResultEnvelope::success(bundle! { "booleanResult" => true }));
        assert_eq!(*seen.lock().unwrap(), vec![op.id(), op.id()]);
    }

    #[test]
    fn retry_signal_reissues_request() {
        let (registry, dispatcher) = setup();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let op = registry.start(Builder::new(), {
            let attempts = Arc::clone(&attempts);
            move |id| {
                attempts.lock().unwrap().push(id);
                Ok(())
            }
        });
        dispatcher.on_result(op.id(), bundle! { KEY_RETRY => true });
        assert!(!op.is_done());
        dispatcher.on_result(op.id(), bundle! { "authtoken" => "t" });
        assert!(op.outcome().unwrap().is_success());
        assert_eq!(*attempts.lock().unwrap(), vec![op.id(), op.id()]);
    }

    #[test]
    fn panicking_shape_completes_as_invalid_response() {
        let (registry, dispatcher) = setup();
        let op = registry.start(
            Builder::new().expect(|_: &Bundle| -> Result<(), bundle::BundleError> {
                panic!("shape check blew up")
            }),
            idle,
        );
        dispatcher.on_result(op.id(), bundle! { "k" => 1 });
        assert_eq!(op.state(), OpState::Completed);
        let envelope = op.get_result(Some(WAIT)).unwrap();
        assert_eq!(envelope.failure_kind(), Some(ErrorKind::InvalidResponse));
        assert!(registry.lookup(op.id()).is_none());
    }

    #[test]
    fn panicking_continuation_still_releases() {
        let (registry, dispatcher) = setup();

        // inline, on the transport's thread
        let op = registry.start(Builder::new().on_complete(|_| panic!("callback blew up")), idle);
        dispatcher.on_result(op.id(), bundle! { "k" => 1 });
        assert!(op.outcome().unwrap().is_success());
        assert!(registry.is_empty());

        // on a looper, which keeps going afterwards
        let looper = Looper::spawn("test-panicking-continuation").unwrap();
        let op = registry.start(
            Builder::new().context(looper.clone()).on_complete(|_| panic!("callback blew up")),
            idle,
        );
        dispatcher.on_error(op.id(), ErrorKind::NetworkError, "offline");
        let (send, recv) = mpsc::channel();
        looper.post(Box::new(move || send.send(()).unwrap()));
        recv.recv_timeout(WAIT).unwrap();
        assert!(registry.lookup(op.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_redirect_handler_fails_operation() {
        let (registry, dispatcher) = setup();
        let op = registry.start(
            Builder::new().on_redirect(|_: Redirect| panic!("prompt blew up")),
            idle,
        );
        dispatcher.on_result(op.id(), bundle! { KEY_INTENT => "confirm-credentials" });
        assert_eq!(
            op.get_result(Some(WAIT)).unwrap().failure_kind(),
            Some(ErrorKind::RemoteFailure),
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn endless_synchronous_retries_give_up() {
        let (registry, dispatcher) = setup();
        let attempts = Arc::new(Mutex::new(0u32));
        let op = registry.start(Builder::new(), {
            let attempts = Arc::clone(&attempts);
            move |id| {
                *attempts.lock().unwrap() += 1;
                dispatcher.on_result(id, bundle! { KEY_RETRY => true });
                Ok(())
            }
        });
        assert_eq!(
            op.outcome(),
            Some(ResultEnvelope::failure(ErrorKind::RemoteFailure, "too many retries")),
        );
        assert_eq!(*attempts.lock().unwrap(), MAX_RETRIES + 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn synchronous_transport_completion_is_not_lost() {
        let (registry, dispatcher) = setup();
        let op = registry.start(Builder::new(), move |id| {
            dispatcher.on_result(id, bundle! { "k" => "v" });
            Ok(())
        });
        assert!(op.outcome().unwrap().is_success());
    }
}
