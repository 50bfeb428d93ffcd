//! Client-side protocol binding.
//!
//! [`Transport`] encodes the four operation verbs into HTTP requests,
//! dispatches on response statuses, and runs the get-result long-poll loop
//! with its deadline arithmetic. Users usually wrap it in a
//! [`crate::service_client::ServiceClient`] rather than calling it
//! directly.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use nexus_core::{
    content::Content,
    duration,
    error::{
        Error, HandlerError, HandlerErrorKind, OperationError, RetryBehavior,
        TransportError,
    },
    failure::Failure,
    link::Link,
    payload::IntoPayload,
    protocol::{
        HEADER_LINK, HEADER_OPERATION_STATE, HEADER_OPERATION_TOKEN,
        HEADER_REQUEST_ID, HEADER_REQUEST_RETRYABLE, HEADER_REQUEST_TIMEOUT,
        QUERY_CALLBACK, QUERY_WAIT, STATUS_CANCEL_ACCEPTED,
        STATUS_OPERATION_RUNNING, STATUS_OPERATION_STARTED,
        STATUS_OPERATION_UNSUCCESSFUL, STATUS_POLL_TIMEOUT, USER_AGENT,
    },
    serializer::{Serializer, SerializerChain},
    types::{OperationInfo, OperationState},
};
use reqwest::Url;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{handle::OperationHandle, lazy::LazyValue};

/// Padding added to the context-deadline cap on the `wait` query parameter
/// so the server-side wait timer fires before the client-side deadline
/// races it. Never exposed to callers.
const RESULT_POLL_PADDING: Duration = Duration::from_secs(5);

// Avoid `Method::` prefix. Associated constants can't be imported.
const GET: Method = Method::GET;
const POST: Method = Method::POST;

/// Caller-supplied per-request headers, lowercase names.
pub type ClientHeader = BTreeMap<String, String>;

/// Options for [`Transport::start_operation`].
#[derive(Clone, Debug, Default)]
pub struct StartOperationOptions {
    /// Request id for handler-side deduplication. A v4 UUID is minted when
    /// absent.
    pub request_id: Option<String>,
    /// Absolute URL to deliver the async completion to.
    pub callback_url: Option<String>,
    /// Header fields to attach to the completion delivery; sent prefixed
    /// as `Nexus-Callback-*`.
    pub callback_header: BTreeMap<String, String>,
    /// Links to attach to the start request.
    pub links: Vec<Link>,
    /// Additional protocol headers.
    pub header: ClientHeader,
    /// Caller deadline. Propagated as `Nexus-Request-Timeout` (unless that
    /// header was set explicitly) and enforced locally.
    pub deadline: Option<Instant>,
}

/// Options for [`Transport::get_operation_result`].
#[derive(Clone, Debug, Default)]
pub struct GetOperationResultOptions {
    /// How long to long-poll for the result. `None` (or zero) asks once.
    pub wait: Option<Duration>,
    /// Additional protocol headers.
    pub header: ClientHeader,
    /// Caller deadline, as in [`StartOperationOptions::deadline`].
    pub deadline: Option<Instant>,
}

/// Options for [`Transport::get_operation_info`].
#[derive(Clone, Debug, Default)]
pub struct GetOperationInfoOptions {
    /// Additional protocol headers.
    pub header: ClientHeader,
    /// Caller deadline, as in [`StartOperationOptions::deadline`].
    pub deadline: Option<Instant>,
}

/// Options for [`Transport::cancel_operation`].
#[derive(Clone, Debug, Default)]
pub struct CancelOperationOptions {
    /// Additional protocol headers.
    pub header: ClientHeader,
    /// Caller deadline, as in [`StartOperationOptions::deadline`].
    pub deadline: Option<Instant>,
}

/// Outcome of a successful start call.
#[derive(Debug)]
pub enum StartOperationResult<'a> {
    /// The operation completed synchronously; decode the result from the
    /// [`LazyValue`].
    Sync(LazyValue),
    /// The operation continues asynchronously; interact with it through
    /// the handle.
    Async(OperationHandle<'a>),
}

/// The client-side protocol binding over one service base URL.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    base_url: Url,
    serializer: Arc<dyn Serializer>,
}

impl Transport {
    /// Build a transport for the given service base URL with the default
    /// serializer chain and failure converter.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, TransportError> {
        fn inner(base_url: &str) -> Result<Transport, TransportError> {
            let client = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .map_err(|err| {
                    TransportError::protocol(format!(
                        "failed to build http client: {err:?}"
                    ))
                })?;
            Transport::from_inner(client, base_url)
        }
        inner(base_url.as_ref())
    }

    /// Build a transport from a preconfigured [`reqwest::Client`], e.g.
    /// one with TLS or proxy settings.
    pub fn from_inner(
        client: reqwest::Client,
        base_url: &str,
    ) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url).map_err(|err| {
            TransportError::protocol(format!(
                "invalid base url {base_url:?}: {err}"
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::protocol(format!(
                "base url cannot carry paths: {base_url}"
            )));
        }
        Ok(Self {
            client,
            base_url,
            serializer: Arc::new(SerializerChain::default()),
        })
    }

    /// Replace the serializer chain.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// The configured serializer chain.
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// A handle to an async operation known by token. No network round
    /// trip; fails only on empty names.
    pub fn operation_handle<'a>(
        &'a self,
        service: &str,
        operation: &str,
        token: &str,
    ) -> Result<OperationHandle<'a>, TransportError> {
        if service.is_empty() || operation.is_empty() {
            return Err(TransportError::protocol(
                "service and operation names must be non-empty",
            ));
        }
        if token.is_empty() {
            return Err(TransportError::protocol(
                "operation token must be non-empty",
            ));
        }
        Ok(OperationHandle::new(self, service, operation, token))
    }

    // --- The four verbs --- //

    /// Start an operation. Exactly one of sync-complete or async-pending
    /// is returned on success; a terminal non-success start surfaces as
    /// [`Error::Operation`].
    pub async fn start_operation<I: IntoPayload>(
        &self,
        service: &str,
        operation: &str,
        input: I,
        options: StartOperationOptions,
    ) -> Result<StartOperationResult<'_>, Error> {
        let content = self.serialize_input(input)?;

        let mut url = self.operation_url(service, operation)?;
        if let Some(callback_url) = &options.callback_url {
            url.query_pairs_mut().append_pair(QUERY_CALLBACK, callback_url);
        }

        let mut headers = HeaderMap::new();
        let request_id = options
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        insert_str(&mut headers, HEADER_REQUEST_ID, &request_id)?;
        for (name, value) in &options.callback_header {
            let name = format!(
                "{}{name}",
                nexus_core::protocol::CALLBACK_HEADER_PREFIX
            );
            insert_raw(&mut headers, &name, value)?;
        }
        append_links(&mut headers, &options.links)?;
        content.apply_to_http(&mut headers);
        apply_client_headers(&mut headers, &options.header, options.deadline)?;

        let request = self
            .client
            .request(POST, url)
            .headers(headers)
            .body(content.data);
        let response = self.send(request, options.deadline).await?;

        let status = response.status();
        if status == StatusCode::OK {
            Ok(StartOperationResult::Sync(LazyValue::from_response(
                self.serializer.clone(),
                response,
            )))
        } else if status == STATUS_OPERATION_STARTED {
            let info =
                response.json::<OperationInfo>().await.map_err(|err| {
                    TransportError::protocol(format!(
                        "invalid operation info in response: {err}"
                    ))
                })?;
            if info.token.is_empty() {
                return Err(TransportError::protocol(
                    "empty operation token in start response",
                )
                .into());
            }
            let handle =
                OperationHandle::new(self, service, operation, &info.token);
            Ok(StartOperationResult::Async(handle))
        } else {
            Err(self.error_from_response(response).await)
        }
    }

    /// Fetch an operation result, long-polling per the options.
    ///
    /// Returns [`Error::OperationStillRunning`] when the operation has not
    /// completed within the requested wait; ask again later.
    pub async fn get_operation_result(
        &self,
        service: &str,
        operation: &str,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<LazyValue, Error> {
        let start = Instant::now();
        let base_wait = options.wait.unwrap_or(Duration::ZERO);
        let mut wait = base_wait;

        let base_url = {
            let mut url = self.operation_url(service, operation)?;
            url.path_segments_mut()
                .expect("base url was checked to be a base")
                .push("result");
            url
        };

        loop {
            let mut url = base_url.clone();
            if wait > Duration::ZERO {
                let effective =
                    effective_wait(wait, options.deadline, Instant::now());
                url.query_pairs_mut()
                    .append_pair(QUERY_WAIT, &duration::format(effective));
            }

            let mut headers = HeaderMap::new();
            insert_str(&mut headers, HEADER_OPERATION_TOKEN, token)?;
            apply_client_headers(
                &mut headers,
                &options.header,
                options.deadline,
            )?;

            let request = self.client.request(GET, url).headers(headers);
            let response = self.send(request, options.deadline).await?;

            let status = response.status();
            if status == StatusCode::OK {
                return Ok(LazyValue::from_response(
                    self.serializer.clone(),
                    response,
                ));
            } else if status == STATUS_POLL_TIMEOUT
                && base_wait > Duration::ZERO
            {
                // The server-side wait budget lapsed. Retry with whatever
                // is left of ours, but only because we asked to wait at
                // all.
                wait = base_wait.saturating_sub(start.elapsed());
                continue;
            } else if status == STATUS_OPERATION_RUNNING {
                return Err(Error::OperationStillRunning);
            } else {
                return Err(self.error_from_response(response).await);
            }
        }
    }

    /// Fetch an operation's status record.
    pub async fn get_operation_info(
        &self,
        service: &str,
        operation: &str,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        let url = self.operation_url(service, operation)?;
        let mut headers = HeaderMap::new();
        insert_str(&mut headers, HEADER_OPERATION_TOKEN, token)?;
        apply_client_headers(&mut headers, &options.header, options.deadline)?;

        let request = self.client.request(GET, url).headers(headers);
        let response = self.send(request, options.deadline).await?;

        if response.status() != StatusCode::OK {
            return Err(self.error_from_response(response).await);
        }
        let info = response.json::<OperationInfo>().await.map_err(|err| {
            TransportError::protocol(format!(
                "invalid operation info in response: {err}"
            ))
        })?;
        Ok(info)
    }

    /// Request cancelation of an operation. Success (202) means the
    /// request was accepted, not that the operation already stopped.
    pub async fn cancel_operation(
        &self,
        service: &str,
        operation: &str,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        let mut url = self.operation_url(service, operation)?;
        url.path_segments_mut()
            .expect("base url was checked to be a base")
            .push("cancel");
        let mut headers = HeaderMap::new();
        insert_str(&mut headers, HEADER_OPERATION_TOKEN, token)?;
        apply_client_headers(&mut headers, &options.header, options.deadline)?;

        let request = self.client.request(POST, url).headers(headers);
        let response = self.send(request, options.deadline).await?;

        if response.status() != STATUS_CANCEL_ACCEPTED {
            return Err(self.error_from_response(response).await);
        }
        Ok(())
    }

    // --- Request plumbing --- //

    /// `{base}/{service}/{operation}`, with both names percent-encoded as
    /// path segments.
    fn operation_url(
        &self,
        service: &str,
        operation: &str,
    ) -> Result<Url, TransportError> {
        if service.is_empty() || operation.is_empty() {
            return Err(TransportError::protocol(
                "service and operation names must be non-empty",
            ));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("base url was checked to be a base")
            .pop_if_empty()
            .push(service)
            .push(operation);
        Ok(url)
    }

    fn serialize_input<I: IntoPayload>(
        &self,
        input: I,
    ) -> Result<Content, TransportError> {
        let payload = input.into_payload().map_err(|err| {
            TransportError::protocol(format!(
                "failed to convert input: {err}"
            ))
        })?;
        self.serializer.serialize(&payload).map_err(|err| {
            TransportError::protocol(format!(
                "failed to serialize input: {err}"
            ))
        })
    }

    /// Send the built request, bounding it by the caller deadline.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        deadline: Option<Instant>,
    ) -> Result<reqwest::Response, TransportError> {
        let request = match deadline {
            Some(deadline) => request
                .timeout(deadline.saturating_duration_since(Instant::now())),
            None => request,
        };
        let request = request.build().map_err(|err| {
            TransportError::protocol(format!(
                "failed to build request: {err:?}"
            ))
        })?;

        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "New nexus client request");

        let response =
            self.client.execute(request).await.map_err(|err| {
                // NOTE: the reqwest Display impl swallows the interesting
                // parts (e.g. TLS failures); log the Debug form.
                warn!(%method, %url, "Request error: {err:?}");
                if err.is_timeout() {
                    TransportError::deadline_exceeded()
                } else {
                    TransportError::protocol(format!(
                        "failed to send request: {err:?}"
                    ))
                }
            })?;

        let status = response.status().as_u16();
        debug!(%method, %url, %status, "Done");
        Ok(response)
    }

    /// Decode a non-success response into the matching error category.
    async fn error_from_response(&self, response: reqwest::Response) -> Error {
        error_from_response(response).await
    }
}

/// Decode a non-success response into the matching error category.
pub(crate) async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status();
    let state_header = response
        .headers()
        .get(&HEADER_OPERATION_STATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let retryable_header = response
        .headers()
        .get(&HEADER_REQUEST_RETRYABLE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) =>
            return TransportError::from_response(
                status,
                None,
                format!("failed to read error response body: {err:?}"),
            )
            .into(),
    };
    let failure = decode_failure(&body);

    if status == STATUS_OPERATION_UNSUCCESSFUL {
        let state = match state_header.as_deref() {
            Some(raw) => match raw.parse::<OperationState>() {
                Ok(state) => state,
                Err(_) =>
                    return TransportError::from_response(
                        status,
                        Some(failure),
                        format!("invalid operation state header: {raw:?}"),
                    )
                    .into(),
            },
            None =>
                return TransportError::from_response(
                    status,
                    Some(failure),
                    "missing operation state header on 424 response",
                )
                .into(),
        };
        return match OperationError::from_parts(state, failure) {
            Ok(err) => err.into(),
            Err(err) => err.into(),
        };
    }

    match HandlerErrorKind::from_http_status(status) {
        Some(kind) => {
            let mut err = HandlerError::from_failure(kind, failure);
            match retryable_header.as_deref() {
                Some("true") =>
                    err = err.with_retry_behavior(RetryBehavior::Retryable),
                Some("false") =>
                    err =
                        err.with_retry_behavior(RetryBehavior::NonRetryable),
                Some(other) =>
                    warn!("Ignoring invalid retryable header value {other:?}"),
                None => (),
            }
            err.into()
        }
        None => TransportError::from_response(
            status,
            Some(failure),
            format!("unexpected response status: {status}"),
        )
        .into(),
    }
}

/// The server wait we may request: `min(wait, remaining deadline +
/// padding)`. The padding keeps the server-side timer ahead of ours so a
/// long poll lapses into a clean 408 instead of a client timeout.
fn effective_wait(
    wait: Duration,
    deadline: Option<Instant>,
    now: Instant,
) -> Duration {
    match deadline {
        Some(deadline) => {
            let cap = deadline.saturating_duration_since(now)
                + RESULT_POLL_PADDING;
            wait.min(cap)
        }
        None => wait,
    }
}

/// Best-effort decode of an error response body into a [`Failure`].
fn decode_failure(body: &[u8]) -> Failure {
    if body.is_empty() {
        return Failure::default();
    }
    match serde_json::from_slice::<Failure>(body) {
        Ok(failure) => failure,
        // Not a protocol failure body; surface the raw text.
        Err(_) =>
            Failure::from_message(String::from_utf8_lossy(body).into_owned()),
    }
}

fn insert_str(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: &str,
) -> Result<(), TransportError> {
    let value = HeaderValue::try_from(value).map_err(|_| {
        TransportError::protocol(format!(
            "invalid value for header {name}: {value:?}"
        ))
    })?;
    headers.insert(name, value);
    Ok(())
}

fn insert_raw(
    headers: &mut HeaderMap,
    name: &str,
    value: &str,
) -> Result<(), TransportError> {
    let name = HeaderName::try_from(name).map_err(|_| {
        TransportError::protocol(format!("invalid header name: {name:?}"))
    })?;
    insert_str(headers, name, value)
}

fn append_links(
    headers: &mut HeaderMap,
    links: &[Link],
) -> Result<(), TransportError> {
    for link in links {
        let value = link.to_header_value().map_err(|err| {
            TransportError::protocol(format!("invalid link: {err}"))
        })?;
        let value = HeaderValue::try_from(value).map_err(|_| {
            TransportError::protocol("link is not a valid header value")
        })?;
        headers.append(HEADER_LINK, value);
    }
    Ok(())
}

/// Fold caller-supplied headers over the derived ones and propagate the
/// deadline. An explicit `Nexus-Request-Timeout` in `header` wins over the
/// one derived from `deadline`.
fn apply_client_headers(
    headers: &mut HeaderMap,
    header: &ClientHeader,
    deadline: Option<Instant>,
) -> Result<(), TransportError> {
    if let Some(deadline) = deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        insert_str(
            headers,
            HEADER_REQUEST_TIMEOUT,
            &duration::format(remaining),
        )?;
    }
    for (name, value) in header {
        insert_raw(headers, name, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn effective_wait_is_capped_by_deadline_plus_padding() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(5);

        // An unbounded wait gets capped to remaining + padding.
        let wait = effective_wait(Duration::MAX, Some(deadline), now);
        assert_eq!(wait, Duration::from_secs(10));

        // A short wait is passed through untouched.
        let wait =
            effective_wait(Duration::from_secs(1), Some(deadline), now);
        assert_eq!(wait, Duration::from_secs(1));

        // No deadline: nothing to cap by.
        let wait = effective_wait(Duration::from_secs(30), None, now);
        assert_eq!(wait, Duration::from_secs(30));

        // A lapsed deadline still leaves the padding, never underflows.
        let wait = effective_wait(
            Duration::MAX,
            Some(now - Duration::from_secs(1)),
            now,
        );
        assert_eq!(wait, RESULT_POLL_PADDING);
    }

    #[test]
    fn operation_urls_are_percent_encoded() {
        let transport = Transport::new("http://localhost:1234/nexus").unwrap();
        let url = transport
            .operation_url("billing/v2", "charge card")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:1234/nexus/billing%2Fv2/charge%20card"
        );
        assert!(transport.operation_url("", "op").is_err());
        assert!(transport.operation_url("svc", "").is_err());
    }

    #[test]
    fn decode_failure_falls_back_to_raw_text() {
        let failure = decode_failure(br#"{"message":"structured"}"#);
        assert_eq!(failure.message, "structured");

        let failure = decode_failure(b"plain text error");
        assert_eq!(failure.message, "plain text error");

        assert_eq!(decode_failure(b""), Failure::default());
    }
}
