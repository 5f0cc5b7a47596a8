//! The outcome carried back across the process boundary.

use crate::error::UsageError;
use bundle::{Bundle, BundleError};
use std::fmt::{self, Formatter, Display};
use thiserror::Error;


/// Raw payload key carrying an integer error code.
pub const KEY_ERROR_CODE: &str = "errorCode";
/// Raw payload key carrying the message that goes with [`KEY_ERROR_CODE`].
pub const KEY_ERROR_MESSAGE: &str = "errorMessage";
/// Raw payload key carrying the token of an out-of-band step the remote side needs launched.
pub const KEY_INTENT: &str = "intent";
/// Raw payload key which, if true, asks for the request to be issued again.
pub const KEY_RETRY: &str = "retry";


/// Closed set of failure kinds
///
/// Each has a stable integer code, which is how failures are spelled on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ErrorKind {
    /// The remote side failed or died while handling the request
    RemoteFailure,
    /// The remote side could not reach the network
    NetworkError,
    /// The operation was cancelled, locally or by the remote side
    Cancelled,
    /// The response did not have the expected shape
    InvalidResponse,
    /// The remote side does not support the operation
    UnsupportedOperation,
    /// The request carried invalid arguments
    BadArguments,
    /// The request was malformed
    BadRequest,
    /// The remote side rejected the credentials
    BadAuthentication,
    /// The operation is disabled by policy for this caller
    PermissionDenied,
}

const CODE_USER_RESTRICTED: i32 = 101;

impl ErrorKind {
    /// Integer wire code.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::RemoteFailure => 1,
            ErrorKind::NetworkError => 3,
            ErrorKind::Cancelled => 4,
            ErrorKind::InvalidResponse => 5,
            ErrorKind::UnsupportedOperation => 6,
            ErrorKind::BadArguments => 7,
            ErrorKind::BadRequest => 8,
            ErrorKind::BadAuthentication => 9,
            ErrorKind::PermissionDenied => 100,
        }
    }

    /// Parse an integer wire code, if it's known.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::RemoteFailure,
            3 => ErrorKind::NetworkError,
            4 => ErrorKind::Cancelled,
            5 => ErrorKind::InvalidResponse,
            6 => ErrorKind::UnsupportedOperation,
            7 => ErrorKind::BadArguments,
            8 => ErrorKind::BadRequest,
            9 => ErrorKind::BadAuthentication,
            100 | CODE_USER_RESTRICTED => ErrorKind::PermissionDenied,
            _ => return None,
        })
    }

    /// Whether a failure of this kind arriving from the remote side means the operation should be
    /// treated as cancelled rather than failed.
    pub fn is_cancellation(self) -> bool {
        matches!(self, ErrorKind::Cancelled | ErrorKind::PermissionDenied)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::RemoteFailure => "remote failure",
            ErrorKind::NetworkError => "network error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidResponse => "invalid response",
            ErrorKind::UnsupportedOperation => "unsupported operation",
            ErrorKind::BadArguments => "bad arguments",
            ErrorKind::BadRequest => "bad request",
            ErrorKind::BadAuthentication => "bad authentication",
            ErrorKind::PermissionDenied => "permission denied",
        })
    }
}


/// Structured failure outcome
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Failure { kind, message: message.into() }
    }

    /// Construct from an integer wire code. Unknown codes become [`ErrorKind::RemoteFailure`].
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorKind::from_code(code) {
            Some(kind) => Failure { kind, message },
            None => Failure {
                kind: ErrorKind::RemoteFailure,
                message: format!("unknown error code {}: {}", code, message),
            },
        }
    }
}


/// Opaque token naming an out-of-band step (such as a user prompt) that must happen before an
/// operation can finish
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Errors if `token` is empty.
    pub fn new(token: impl Into<String>) -> Result<Self, UsageError> {
        let token = token.into();
        if token.is_empty() {
            return Err(UsageError::Empty("continuation token"));
        }
        Ok(ContinuationToken(token))
    }

    // token used for redirects that only ask for the request to be re-issued.
    pub(crate) fn retry() -> Self {
        ContinuationToken(KEY_RETRY.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContinuationToken {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


/// What a redirect asks the local side to do
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RedirectAction {
    /// Launch the out-of-band step named by the token, then wait for a follow-up result
    Launch,
    /// Issue the same request again, under the same correlation id
    Retry,
}


/// Outcome of an operation, as carried back across the boundary
///
/// Exactly one of a success payload, a structured failure, or a redirect. Immutable once
/// constructed, and compared structurally.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResultEnvelope {
    Success(Bundle),
    Failure(Failure),
    Redirect {
        token: ContinuationToken,
        payload: Bundle,
    },
}

impl ResultEnvelope {
    pub fn success(payload: Bundle) -> Self {
        ResultEnvelope::Success(payload)
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ResultEnvelope::Failure(Failure::new(kind, message))
    }

    pub fn redirect(token: ContinuationToken, payload: Bundle) -> Self {
        ResultEnvelope::Redirect { token, payload }
    }

    /// Classify a raw payload delivered by the transport.
    ///
    /// In order of precedence:
    ///
    /// - [`KEY_ERROR_CODE`] makes it a failure, with [`KEY_ERROR_MESSAGE`] as the message.
    /// - [`KEY_INTENT`] makes it a [`RedirectAction::Launch`] redirect, with that token.
    /// - [`KEY_RETRY`] being true makes it a [`RedirectAction::Retry`] redirect.
    /// - Anything else is a success.
    ///
    /// If one of those keys is present with the wrong type, the result is an
    /// [`ErrorKind::InvalidResponse`] failure.
    pub fn from_raw(raw: Bundle) -> Self {
        match raw.opt_int(KEY_ERROR_CODE) {
            Ok(Some(code)) => {
                let message = match raw.opt_str(KEY_ERROR_MESSAGE) {
                    Ok(message) => message.unwrap_or_default().to_owned(),
                    Err(e) => return Self::failure(ErrorKind::InvalidResponse, e.to_string()),
                };
                return ResultEnvelope::Failure(Failure::from_code(code, message));
            }
            Ok(None) => (),
            Err(e) => return Self::failure(ErrorKind::InvalidResponse, e.to_string()),
        }

        let intent = raw.opt_str(KEY_INTENT).map(|opt| opt.map(str::to_owned));
        match intent {
            Ok(Some(intent)) => return match ContinuationToken::new(intent) {
                Ok(token) => ResultEnvelope::Redirect { token, payload: raw },
                Err(e) => Self::failure(ErrorKind::InvalidResponse, e.to_string()),
            },
            Ok(None) => (),
            Err(e) => return Self::failure(ErrorKind::InvalidResponse, e.to_string()),
        }

        match raw.opt_bool(KEY_RETRY) {
            Ok(Some(true)) => ResultEnvelope::Redirect {
                token: ContinuationToken::retry(),
                payload: raw,
            },
            Ok(_) => ResultEnvelope::Success(raw),
            Err(e) => Self::failure(ErrorKind::InvalidResponse, e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultEnvelope::Success(_))
    }

    /// Whether this is a failure of kind [`ErrorKind::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.failure_kind() == Some(ErrorKind::Cancelled)
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            ResultEnvelope::Failure(failure) => Some(failure.kind),
            _ => None,
        }
    }

    /// The success or redirect payload.
    pub fn payload(&self) -> Option<&Bundle> {
        match self {
            ResultEnvelope::Success(payload) => Some(payload),
            ResultEnvelope::Redirect { payload, .. } => Some(payload),
            ResultEnvelope::Failure(_) => None,
        }
    }

    /// If this is a redirect, what it asks for.
    pub fn redirect_action(&self) -> Option<RedirectAction> {
        match self {
            ResultEnvelope::Redirect { payload, .. } => Some(
                if !payload.contains_key(KEY_INTENT) && payload.opt_bool(KEY_RETRY) == Ok(Some(true)) {
                    RedirectAction::Retry
                } else {
                    RedirectAction::Launch
                }
            ),
            _ => None,
        }
    }

    /// Convert into a `Result`, treating an unresolved redirect as an invalid response.
    pub fn into_result(self) -> Result<Bundle, Failure> {
        match self {
            ResultEnvelope::Success(payload) => Ok(payload),
            ResultEnvelope::Failure(failure) => Err(failure),
            ResultEnvelope::Redirect { token, .. } => Err(unresolved_redirect(&token)),
        }
    }

    /// Decode a success payload into a typed value.
    ///
    /// Decoding errors become [`ErrorKind::InvalidResponse`] failures, as does an unresolved
    /// redirect.
    pub fn decode<T, F>(&self, decode: F) -> Result<T, Failure>
    where
        F: FnOnce(&Bundle) -> Result<T, BundleError>,
    {
        match self {
            ResultEnvelope::Success(payload) => decode(payload)
                .map_err(|e| Failure::new(ErrorKind::InvalidResponse, e.to_string())),
            ResultEnvelope::Failure(failure) => Err(failure.clone()),
            ResultEnvelope::Redirect { token, .. } => Err(unresolved_redirect(token)),
        }
    }
}

fn unresolved_redirect(token: &ContinuationToken) -> Failure {
    Failure::new(ErrorKind::InvalidResponse, format!("unresolved redirect {}", token))
}
