//! The protocol error taxonomy.
//!
//! Three disjoint categories exist on the wire and in memory:
//!
//! 1. [`OperationError`] — the operation itself reached a terminal
//!    non-success state. The call succeeded; the business outcome did not.
//!    Wire: 424 plus a state header.
//! 2. [`HandlerError`] — the handler could not process the request. Wire:
//!    a typed status from the table below.
//! 3. [`TransportError`] — the response could not be parsed or contradicted
//!    the protocol.
//!
//! [`Error::OperationStillRunning`] is a sentinel, not an error kind: it is
//! the normal control-flow signal from get-result meaning "still running,
//! you may ask again". Callers must distinguish it from cancellation.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

use std::fmt;

use http::StatusCode;
use thiserror::Error;

use crate::{
    failure::Failure,
    protocol::{STATUS_UPSTREAM_TIMEOUT_CODE, status_upstream_timeout},
    types::OperationState,
};

// Associated constants can't be imported.
pub const CLIENT_400_BAD_REQUEST: StatusCode = StatusCode::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: StatusCode = StatusCode::UNAUTHORIZED;
pub const CLIENT_403_FORBIDDEN: StatusCode = StatusCode::FORBIDDEN;
pub const CLIENT_404_NOT_FOUND: StatusCode = StatusCode::NOT_FOUND;
pub const CLIENT_429_TOO_MANY_REQUESTS: StatusCode =
    StatusCode::TOO_MANY_REQUESTS;
pub const SERVER_500_INTERNAL_SERVER_ERROR: StatusCode =
    StatusCode::INTERNAL_SERVER_ERROR;
pub const SERVER_501_NOT_IMPLEMENTED: StatusCode = StatusCode::NOT_IMPLEMENTED;
pub const SERVER_503_SERVICE_UNAVAILABLE: StatusCode =
    StatusCode::SERVICE_UNAVAILABLE;

/// What the handler couldn't do. Selects the HTTP status on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum HandlerErrorKind {
    /// The request was malformed or its input failed to deserialize.
    BadRequest,
    /// The caller did not authenticate.
    Unauthenticated,
    /// The caller is not allowed to perform the request.
    Unauthorized,
    /// The service or operation does not exist.
    NotFound,
    /// The handler is out of some resource; back off and retry.
    ResourceExhausted,
    /// The handler hit an unexpected internal condition.
    Internal,
    /// The handler does not implement the requested method.
    NotImplemented,
    /// The handler is temporarily unavailable.
    Unavailable,
    /// A dependency of the handler timed out.
    UpstreamTimeout,
}

impl HandlerErrorKind {
    /// The HTTP status this kind maps to on the wire.
    pub fn to_http_status(self) -> StatusCode {
        use HandlerErrorKind::*;
        match self {
            BadRequest => CLIENT_400_BAD_REQUEST,
            Unauthenticated => CLIENT_401_UNAUTHORIZED,
            Unauthorized => CLIENT_403_FORBIDDEN,
            NotFound => CLIENT_404_NOT_FOUND,
            ResourceExhausted => CLIENT_429_TOO_MANY_REQUESTS,
            Internal => SERVER_500_INTERNAL_SERVER_ERROR,
            NotImplemented => SERVER_501_NOT_IMPLEMENTED,
            Unavailable => SERVER_503_SERVICE_UNAVAILABLE,
            UpstreamTimeout => status_upstream_timeout(),
        }
    }

    /// The kind inferred from an HTTP status, if the status is part of the
    /// handler-error table.
    pub fn from_http_status(status: StatusCode) -> Option<Self> {
        use HandlerErrorKind::*;
        let kind = match status.as_u16() {
            400 => BadRequest,
            401 => Unauthenticated,
            403 => Unauthorized,
            404 => NotFound,
            429 => ResourceExhausted,
            500 => Internal,
            501 => NotImplemented,
            503 => Unavailable,
            STATUS_UPSTREAM_TIMEOUT_CODE => UpstreamTimeout,
            _ => return None,
        };
        Some(kind)
    }

    /// Default retryability when no explicit behavior was pinned.
    pub fn default_retryable(self) -> bool {
        use HandlerErrorKind::*;
        match self {
            BadRequest => false,
            Unauthenticated => false,
            Unauthorized => false,
            NotFound => false,
            NotImplemented => false,

            ResourceExhausted => true,
            Internal => true,
            Unavailable => true,
            UpstreamTimeout => true,
        }
    }
}

/// Explicit retry hint attached to a [`HandlerError`], overriding the
/// default inferred from its kind. Carried on the wire as the
/// `Nexus-Request-Retryable` header.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RetryBehavior {
    /// Fall back to the kind's default.
    #[default]
    Unspecified,
    /// Callers may retry regardless of the kind.
    Retryable,
    /// Callers must not retry regardless of the kind.
    NonRetryable,
}

/// Transport-level failure raised by (or attributed to) the handler.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub struct HandlerError {
    /// What the handler couldn't do.
    pub kind: HandlerErrorKind,
    /// Explicit retry hint; [`RetryBehavior::Unspecified`] defers to the
    /// kind.
    pub retry_behavior: RetryBehavior,
    /// The wire failure. When this error was decoded off the wire, this is
    /// the original record and re-serializes unchanged.
    failure: Failure,
}

impl HandlerError {
    /// A handler error of `kind` carrying just a message.
    pub fn new(kind: HandlerErrorKind, message: impl fmt::Display) -> Self {
        Self::from_failure(kind, Failure::from_message(message.to_string()))
    }

    /// A handler error wrapping an existing wire failure.
    pub fn from_failure(kind: HandlerErrorKind, failure: Failure) -> Self {
        Self {
            kind,
            retry_behavior: RetryBehavior::default(),
            failure,
        }
    }

    /// Pin the retry behavior, overriding the kind's default.
    pub fn with_retry_behavior(mut self, retry_behavior: RetryBehavior) -> Self {
        self.retry_behavior = retry_behavior;
        self
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.failure.message
    }

    /// The wire failure.
    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    /// Unwrap the wire failure.
    pub fn into_failure(self) -> Failure {
        self.failure
    }

    /// Whether callers may retry, folding the explicit behavior over the
    /// kind's default.
    pub fn retryable(&self) -> bool {
        match self.retry_behavior {
            RetryBehavior::Unspecified => self.kind.default_retryable(),
            RetryBehavior::Retryable => true,
            RetryBehavior::NonRetryable => false,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = &self.kind;
        let msg = self.message();
        write!(f, "handler error ({kind}): {msg}")
    }
}

/// Terminal non-success outcome of the operation itself. Distinct from
/// [`HandlerError`]: the call succeeded, the operation did not.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub struct OperationError {
    state: OperationState,
    failure: Failure,
}

impl OperationError {
    /// An operation failure with the given message.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self {
            state: OperationState::Failed,
            failure: Failure::from_message(message.to_string()),
        }
    }

    /// An operation cancelation with the given message.
    pub fn canceled(message: impl fmt::Display) -> Self {
        Self {
            state: OperationState::Canceled,
            failure: Failure::from_message(message.to_string()),
        }
    }

    /// Rebuild from wire parts. Only the two terminal non-success states
    /// are representable.
    pub fn from_parts(
        state: OperationState,
        failure: Failure,
    ) -> Result<Self, TransportError> {
        match state {
            OperationState::Failed | OperationState::Canceled =>
                Ok(Self { state, failure }),
            OperationState::Running | OperationState::Succeeded =>
                Err(TransportError::protocol(format!(
                    "invalid operation error state: {state}"
                ))),
        }
    }

    /// `Failed` or `Canceled`.
    pub fn state(&self) -> OperationState {
        self.state
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.failure.message
    }

    /// The wire failure. When this error was decoded off the wire, this is
    /// the original record and re-serializes unchanged.
    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    /// Unwrap the wire failure.
    pub fn into_failure(self) -> Failure {
        self.failure
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = &self.state;
        let msg = self.message();
        write!(f, "operation {state}: {msg}")
    }
}

/// The response could not be parsed, contradicted the protocol, or never
/// arrived.
#[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
pub struct TransportError {
    /// What went wrong.
    pub message: String,
    /// The response status, when a response was received.
    pub status: Option<StatusCode>,
    /// A wire failure embedded in the response, when one decoded.
    pub failure: Option<Failure>,
}

impl TransportError {
    /// A protocol violation detected without/before a usable response.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// An unexpected response with the given status.
    pub fn from_response(
        status: StatusCode,
        failure: Option<Failure>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            failure,
        }
    }

    /// The caller-side deadline fired before the call completed.
    pub fn deadline_exceeded() -> Self {
        Self::protocol("deadline exceeded")
    }

    /// Whether this is the caller-side deadline firing.
    pub fn is_deadline_exceeded(&self) -> bool {
        self.status.is_none() && self.message == "deadline exceeded"
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = &self.message;
        match self.status {
            Some(status) => write!(f, "transport error ({status}): {msg}"),
            None => write!(f, "transport error: {msg}"),
        }
    }
}

/// The error type for Nexus RPC calls and handler methods.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation reached `failed` or `canceled`.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The handler could not process the request.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The response could not be parsed or contradicted the protocol.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Get-result: the operation has not reached a terminal state yet.
    /// A control-flow signal, not a failure; ask again later.
    #[error("operation still running")]
    OperationStillRunning,

    /// Uncategorized handler-internal error. The handler runtime maps this
    /// to a generic 500, logging the cause without exposing it.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for matching the still-running sentinel.
    pub fn is_still_running(&self) -> bool {
        matches!(self, Self::OperationStillRunning)
    }

    /// A bad-request handler error with the given message.
    pub fn bad_request(message: impl fmt::Display) -> Self {
        Self::Handler(HandlerError::new(HandlerErrorKind::BadRequest, message))
    }

    /// A not-found handler error with the given message.
    pub fn not_found(message: impl fmt::Display) -> Self {
        Self::Handler(HandlerError::new(HandlerErrorKind::NotFound, message))
    }
}
