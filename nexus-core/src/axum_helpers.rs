//! Axum impls which must live here so both the handler runtime and any
//! embedding server can turn protocol errors into wire responses.

use axum::response::IntoResponse;
use http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
use serde::Serialize;
use tracing::{error, warn};

use crate::{
    error::{Error, HandlerError, OperationError, RetryBehavior},
    failure::Failure,
    protocol::{
        HEADER_OPERATION_STATE, HEADER_REQUEST_RETRYABLE,
        STATUS_OPERATION_RUNNING, STATUS_OPERATION_UNSUCCESSFUL,
    },
};

/// Constructs a JSON [`http::Response<axum::body::Body>`] from the data and
/// status code. If serialization fails for some reason (very unlikely), log
/// and return a generic internal-error [`Failure`] with status 500.
pub fn build_json_response(
    status: StatusCode,
    data: &impl Serialize,
) -> http::Response<axum::body::Body> {
    /// Most of the logic goes in this monomorphic fn to prevent binary
    /// bloat.
    fn inner(
        status: StatusCode,
        try_json_bytes: Result<Vec<u8>, serde_json::Error>,
    ) -> http::Response<axum::body::Body> {
        let (status, json_bytes) = match try_json_bytes {
            Ok(jb) => (status, jb),
            Err(e) => {
                error!("Couldn't serialize response: {e:#}");
                let failure = Failure::from_message("internal server error");
                let json_bytes = serde_json::to_vec(&failure)
                    .expect("Serializing Failure really shouldn't fail");
                (StatusCode::INTERNAL_SERVER_ERROR, json_bytes)
            }
        };

        let bytes = bytes::Bytes::from(json_bytes);
        let http_body = http_body_util::Full::new(bytes);
        let axum_body = axum::body::Body::new(http_body);

        http::Response::builder()
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .status(status)
            .body(axum_body)
            .expect("All operations here should be infallible")
    }

    inner(status, serde_json::to_vec(data))
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> http::Response<axum::body::Body> {
        let status = self.kind.to_http_status();
        // Server-side errors need to be logged here, since the error will
        // have been converted to an `http::Response` by the time any outer
        // layer can access it.
        if status.is_server_error() {
            error!("{self}");
        } else {
            warn!("{self}");
        }

        let retryable = match self.retry_behavior {
            RetryBehavior::Unspecified => None,
            RetryBehavior::Retryable => Some("true"),
            RetryBehavior::NonRetryable => Some("false"),
        };

        let mut response = build_json_response(status, self.failure());
        if let Some(retryable) = retryable {
            response.headers_mut().insert(
                HEADER_REQUEST_RETRYABLE,
                HeaderValue::from_static(retryable),
            );
        }
        response
    }
}

impl IntoResponse for OperationError {
    fn into_response(self) -> http::Response<axum::body::Body> {
        let state = self.state();
        let mut response =
            build_json_response(STATUS_OPERATION_UNSUCCESSFUL, self.failure());
        response.headers_mut().insert(
            HEADER_OPERATION_STATE,
            HeaderValue::try_from(state.to_string())
                .expect("states are static lowercase ascii"),
        );
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> http::Response<axum::body::Body> {
        match self {
            Self::Operation(err) => err.into_response(),
            Self::Handler(err) => err.into_response(),
            Self::OperationStillRunning =>
                STATUS_OPERATION_RUNNING.into_response(),
            // Anything uncategorized maps to a generic 500. The cause is
            // logged, never exposed on the wire.
            Self::Transport(err) => {
                error!("Unexpected transport error in handler: {err:#}");
                internal_server_error_response()
            }
            Self::Internal(err) => {
                error!("Handler failed: {err:#}");
                internal_server_error_response()
            }
        }
    }
}

/// The generic 500 response: the wire message is always the literal
/// `"internal server error"`.
pub fn internal_server_error_response()
-> http::Response<axum::body::Body> {
    build_json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &Failure::from_message("internal server error"),
    )
}
