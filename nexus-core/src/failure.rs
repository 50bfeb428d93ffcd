//! The `Failure` wire record and conversion to and from native errors.
//!
//! `Failure` is the only error structure actually sent across the wire.
//! Every error the protocol can express is converted to / from it, the
//! same way a single serialized error response type backs a whole error
//! taxonomy. The `details` blob is opaque to the runtime and round-trips
//! byte-for-byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::error::{HandlerError, OperationError};

/// Structured error payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,

    /// String metadata, e.g. an error-type discriminator for converters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Opaque JSON blob with additional structured information. The
    /// runtime never inspects it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<RawValue>>,
}

impl Failure {
    /// A failure carrying just a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        let details_eq = match (&self.details, &other.details) {
            (Some(a), Some(b)) => a.get() == b.get(),
            (None, None) => true,
            _ => false,
        };
        self.message == other.message
            && self.metadata == other.metadata
            && details_eq
    }
}

impl Eq for Failure {}

/// An opaque error reconstructed from a wire [`Failure`].
///
/// Its `Display` is the failure message; the full failure is retained so
/// that re-serialization emits the original wire record instead of a lossy
/// re-derivation.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{}", .failure.message)]
pub struct FailureError {
    failure: Failure,
}

impl FailureError {
    /// Wrap a decoded wire failure.
    pub fn new(failure: Failure) -> Self {
        Self { failure }
    }

    /// The retained wire failure.
    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    /// Unwrap the retained wire failure.
    pub fn into_failure(self) -> Failure {
        self.failure
    }
}

/// Maps between native error values and wire [`Failure`] records.
///
/// Install a custom converter to control how native error trees are
/// flattened into failures (e.g. preserving a chain via `details`).
pub trait FailureConverter: Send + Sync {
    /// Flatten a native error into a wire failure.
    fn error_to_failure(&self, err: &(dyn std::error::Error + 'static))
    -> Failure;

    /// Rebuild a native error from a wire failure.
    fn failure_to_error(&self, failure: Failure) -> FailureError;
}

/// The default converter.
///
/// Errors that already carry a wire failure ([`FailureError`],
/// [`HandlerError`], [`OperationError`]) round-trip through their retained
/// snapshot; this keeps chained re-encoding lossless even if a cause
/// message was rewritten in between. Everything else becomes
/// `Failure { message: err.to_string() }`.
pub struct DefaultFailureConverter;

impl FailureConverter for DefaultFailureConverter {
    fn error_to_failure(
        &self,
        err: &(dyn std::error::Error + 'static),
    ) -> Failure {
        if let Some(failure_err) = err.downcast_ref::<FailureError>() {
            return failure_err.failure().clone();
        }
        if let Some(handler_err) = err.downcast_ref::<HandlerError>() {
            return handler_err.failure().clone();
        }
        if let Some(op_err) = err.downcast_ref::<OperationError>() {
            return op_err.failure().clone();
        }
        Failure::from_message(err.to_string())
    }

    fn failure_to_error(&self, failure: Failure) -> FailureError {
        FailureError::new(failure)
    }
}
