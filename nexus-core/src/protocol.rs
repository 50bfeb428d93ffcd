//! Protocol constants shared by the client and handler runtimes.
//!
//! Everything here is part of the wire contract: renaming a header or query
//! parameter is a breaking protocol change.

use http::{HeaderName, StatusCode, header};

/// Carries the operation state on async-start (201), unsuccessful (424) and
/// completion-delivery responses/requests.
pub const HEADER_OPERATION_STATE: HeaderName =
    HeaderName::from_static("nexus-operation-state");

/// Carries the operation token on the three non-start verbs and on
/// completion-delivery requests.
pub const HEADER_OPERATION_TOKEN: HeaderName =
    HeaderName::from_static("nexus-operation-token");

/// Caller-minted v4 UUID used by handlers for request deduplication.
/// The client generates one if the caller didn't supply it.
pub const HEADER_REQUEST_ID: HeaderName =
    HeaderName::from_static("nexus-request-id");

/// Deadline propagation. When set, the handler bounds its context to
/// `min(header value, its own deadline)`. Wire format as in
/// [`crate::duration`].
pub const HEADER_REQUEST_TIMEOUT: HeaderName =
    HeaderName::from_static("nexus-request-timeout");

/// `true`/`false` override of the retryability inferred from a handler
/// error's type.
pub const HEADER_REQUEST_RETRYABLE: HeaderName =
    HeaderName::from_static("nexus-request-retryable");

/// RFC 8288-style links; see [`crate::link`]. Re-exported so call sites
/// don't reach into `http::header` for just this one name.
pub const HEADER_LINK: HeaderName = header::LINK;

/// Prefix for caller-provided header fields the handler must attach
/// (prefix stripped) when delivering the completion callback.
pub const CALLBACK_HEADER_PREFIX: &str = "nexus-callback-";

/// Prefix for headers that belong to the payload (`Content-Type`,
/// `Content-Length`, ...). These travel with [`crate::content::Content`]
/// and are stripped from non-payload header maps.
pub const CONTENT_HEADER_PREFIX: &str = "content-";

/// Query parameter: absolute URL to which async completions are delivered.
pub const QUERY_CALLBACK: &str = "callback";

/// Query parameter: how long the caller is willing to long-poll on
/// get-result. Wire format as in [`crate::duration`].
pub const QUERY_WAIT: &str = "wait";

// Associated constants can't be imported, so name the protocol-significant
// statuses here.

/// Async start accepted; body is a JSON `OperationInfo` with state=running.
pub const STATUS_OPERATION_STARTED: StatusCode = StatusCode::CREATED;

/// Cancel accepted.
pub const STATUS_CANCEL_ACCEPTED: StatusCode = StatusCode::ACCEPTED;

/// Get-result long-poll timed out without the operation completing.
pub const STATUS_POLL_TIMEOUT: StatusCode = StatusCode::REQUEST_TIMEOUT;

/// Operation still running (get-result with no wait, or wait exhausted
/// server-side).
pub const STATUS_OPERATION_RUNNING: StatusCode = StatusCode::PRECONDITION_FAILED;

/// Operation reached a terminal non-success state; the state header and a
/// JSON `Failure` body say which and why.
pub const STATUS_OPERATION_UNSUCCESSFUL: StatusCode =
    StatusCode::FAILED_DEPENDENCY;

/// Raw code for the upstream-timeout handler error. `http::StatusCode` has
/// no named constant in the 5xx extension range.
pub const STATUS_UPSTREAM_TIMEOUT_CODE: u16 = 520;

/// The upstream-timeout status as a [`StatusCode`].
pub fn status_upstream_timeout() -> StatusCode {
    StatusCode::from_u16(STATUS_UPSTREAM_TIMEOUT_CODE)
        .expect("520 is within the valid status code range")
}

/// User agent sent on every outbound request: `Nexus-rust-sdk/<version>`.
pub const USER_AGENT: &str =
    concat!("Nexus-rust-sdk/", env!("CARGO_PKG_VERSION"));

/// Whether a header name belongs to the payload rather than the protocol.
pub fn is_content_header(name: &HeaderName) -> bool {
    name.as_str().starts_with(CONTENT_HEADER_PREFIX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upstream_timeout_status_is_valid() {
        assert_eq!(status_upstream_timeout().as_u16(), 520);
    }

    #[test]
    fn user_agent_shape() {
        assert!(USER_AGENT.starts_with("Nexus-rust-sdk/"));
    }

    #[test]
    fn content_header_predicate() {
        assert!(is_content_header(&header::CONTENT_TYPE));
        assert!(is_content_header(&header::CONTENT_LENGTH));
        assert!(!is_content_header(&HEADER_OPERATION_TOKEN));
        assert!(!is_content_header(&header::USER_AGENT));
    }
}
