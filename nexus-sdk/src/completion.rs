//! Server-initiated async completions.
//!
//! When a caller supplies a `callback` URL at start, the handler delivers
//! the operation's final outcome there as an HTTP POST instead of waiting
//! to be polled. [`CompletionClient`] is the delivering side (run by the
//! operation's handler); [`CompletionHandler`] plus [`router`] is the
//! receiving side (run by the original caller).

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Request, State},
    response::IntoResponse,
    routing::post,
};
use http::{HeaderMap, HeaderValue, StatusCode};
use nexus_core::{
    content,
    error::{Error, OperationError, TransportError},
    failure::{DefaultFailureConverter, Failure, FailureConverter},
    link::Link,
    payload::IntoPayload,
    protocol::{
        HEADER_LINK, HEADER_OPERATION_STATE, HEADER_OPERATION_TOKEN,
        USER_AGENT,
    },
    serializer::{Serializer, SerializerChain},
    types::OperationState,
};
use tracing::debug;

use crate::{
    client,
    handler::RequestHeader,
    lazy::LazyValue,
    server::{decode_links, protocol_header},
};

/// Options for delivering one completion.
#[derive(Clone, Debug, Default)]
pub struct DeliverCompletionOptions {
    /// The operation token, emitted as `Nexus-Operation-Token` when known.
    pub token: Option<String>,
    /// Links to attach to the delivery.
    pub links: Vec<Link>,
    /// Header fields the caller asked for at start time
    /// (`Nexus-Callback-*`, prefix already stripped). Attached verbatim.
    pub header: BTreeMap<String, String>,
}

/// Delivers operation completions to caller-supplied callback URLs.
pub struct CompletionClient {
    client: reqwest::Client,
    serializer: Arc<dyn Serializer>,
    failure_converter: Arc<dyn FailureConverter>,
}

impl CompletionClient {
    /// A completion client with the default serializer chain and failure
    /// converter.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| {
                TransportError::protocol(format!(
                    "failed to build http client: {err:?}"
                ))
            })?;
        Ok(Self {
            client,
            serializer: Arc::new(SerializerChain::default()),
            failure_converter: Arc::new(DefaultFailureConverter),
        })
    }

    /// Replace the serializer chain.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replace the failure converter.
    pub fn with_failure_converter(
        mut self,
        failure_converter: Arc<dyn FailureConverter>,
    ) -> Self {
        self.failure_converter = failure_converter;
        self
    }

    /// Deliver a successful completion carrying `value`.
    pub async fn deliver_success<O: IntoPayload>(
        &self,
        callback_url: &str,
        value: O,
        options: DeliverCompletionOptions,
    ) -> Result<(), Error> {
        let payload = value.into_payload().map_err(|err| {
            TransportError::protocol(format!(
                "failed to convert completion value: {err}"
            ))
        })?;
        let content = self.serializer.serialize(&payload).map_err(|err| {
            TransportError::protocol(format!(
                "failed to serialize completion value: {err}"
            ))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_OPERATION_STATE,
            HeaderValue::from_static("succeeded"),
        );
        content.apply_to_http(&mut headers);
        self.deliver(callback_url, headers, content.data, options).await
    }

    /// Deliver a terminal non-success completion. The error is flattened
    /// through the configured failure converter; `state` must be `failed`
    /// or `canceled`.
    pub async fn deliver_failure(
        &self,
        callback_url: &str,
        state: OperationState,
        error: &(dyn std::error::Error + 'static),
        options: DeliverCompletionOptions,
    ) -> Result<(), Error> {
        if !matches!(
            state,
            OperationState::Failed | OperationState::Canceled
        ) {
            return Err(TransportError::protocol(format!(
                "completion state must be failed or canceled, got {state}"
            ))
            .into());
        }
        let failure = self.failure_converter.error_to_failure(error);
        let body = serde_json::to_vec(&failure).map_err(|err| {
            TransportError::protocol(format!(
                "failed to serialize completion failure: {err}"
            ))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_OPERATION_STATE,
            HeaderValue::try_from(state.to_string())
                .expect("states are static lowercase ascii"),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(content::MEDIA_TYPE_JSON),
        );
        self.deliver(callback_url, headers, body.into(), options).await
    }

    async fn deliver(
        &self,
        callback_url: &str,
        mut headers: HeaderMap,
        body: bytes::Bytes,
        options: DeliverCompletionOptions,
    ) -> Result<(), Error> {
        if let Some(token) = &options.token {
            headers.insert(
                HEADER_OPERATION_TOKEN,
                HeaderValue::try_from(token.as_str()).map_err(|_| {
                    TransportError::protocol("invalid operation token")
                })?,
            );
        }
        for link in &options.links {
            let value = link.to_header_value().map_err(|err| {
                TransportError::protocol(format!("invalid link: {err}"))
            })?;
            let value = HeaderValue::try_from(value).map_err(|_| {
                TransportError::protocol("link is not a valid header value")
            })?;
            headers.append(HEADER_LINK, value);
        }
        for (name, value) in &options.header {
            let name =
                http::HeaderName::try_from(name.as_str()).map_err(|_| {
                    TransportError::protocol(format!(
                        "invalid callback header name: {name:?}"
                    ))
                })?;
            let value =
                HeaderValue::try_from(value.as_str()).map_err(|_| {
                    TransportError::protocol(format!(
                        "invalid callback header value for {name}"
                    ))
                })?;
            headers.insert(name, value);
        }

        debug!(%callback_url, "Delivering operation completion");
        let response = self
            .client
            .post(callback_url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                TransportError::protocol(format!(
                    "failed to deliver completion: {err:?}"
                ))
            })?;

        if !response.status().is_success() {
            return Err(client::error_from_response(response).await);
        }
        Ok(())
    }
}

/// A decoded server-initiated completion.
pub struct CompletionRequest {
    /// The terminal state the operation reached.
    pub state: OperationState,
    /// The operation token, when the delivering handler knew it.
    pub token: Option<String>,
    /// Links attached to the delivery.
    pub links: Vec<Link>,
    /// Remaining protocol headers, including any fields requested via
    /// `Nexus-Callback-*` at start time (delivered unprefixed).
    pub header: RequestHeader,
    /// The outcome payload.
    pub result: CompletionResult,
}

/// The outcome carried by a completion.
pub enum CompletionResult {
    /// The operation succeeded; decode the value from the [`LazyValue`].
    Success(LazyValue),
    /// The operation failed or was canceled.
    Failure(OperationError),
}

/// Receives async completions at the caller's callback URL.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Process one completion. Errors map onto the wire exactly like
    /// handler errors on the operation routes.
    async fn complete_operation(
        &self,
        request: CompletionRequest,
    ) -> Result<(), Error>;
}

#[derive(Clone)]
struct CompletionState {
    handler: Arc<dyn CompletionHandler>,
    serializer: Arc<dyn Serializer>,
}

/// An axum [`Router`] receiving completion deliveries at `/` with the
/// default serializer chain. Mount it at the path your callback URLs point
/// to.
pub fn router(handler: Arc<dyn CompletionHandler>) -> Router {
    router_with_serializer(handler, Arc::new(SerializerChain::default()))
}

/// [`router`] with a custom serializer chain.
pub fn router_with_serializer(
    handler: Arc<dyn CompletionHandler>,
    serializer: Arc<dyn Serializer>,
) -> Router {
    let state = CompletionState {
        handler,
        serializer,
    };
    Router::new().route("/", post(receive_completion)).with_state(state)
}

async fn receive_completion(
    State(state): State<CompletionState>,
    request: Request,
) -> http::Response<axum::body::Body> {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;

    let raw_state =
        match headers.get(&HEADER_OPERATION_STATE).and_then(|v| v.to_str().ok())
        {
            Some(raw) => raw,
            None =>
                return Error::bad_request(
                    "missing operation state header on completion",
                )
                .into_response(),
        };
    let op_state = match raw_state.parse::<OperationState>() {
        Ok(state) if state.is_terminal() => state,
        _ =>
            return Error::bad_request(format!(
                "invalid completion state: {raw_state:?}"
            ))
            .into_response(),
    };

    let links = match decode_links(&headers) {
        Ok(links) => links,
        Err(err) => return err.into_response(),
    };
    let token = headers
        .get(&HEADER_OPERATION_TOKEN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let result = match op_state {
        OperationState::Succeeded => {
            let lazy = LazyValue::from_request_body(
                state.serializer.clone(),
                content::header_from_http(&headers),
                body,
            );
            CompletionResult::Success(lazy)
        }
        OperationState::Failed | OperationState::Canceled => {
            let body = match axum::body::to_bytes(body, usize::MAX).await {
                Ok(body) => body,
                Err(err) =>
                    return Error::bad_request(format!(
                        "failed to read completion body: {err}"
                    ))
                    .into_response(),
            };
            let failure = if body.is_empty() {
                Failure::default()
            } else {
                match serde_json::from_slice::<Failure>(&body) {
                    Ok(failure) => failure,
                    Err(err) =>
                        return Error::bad_request(format!(
                            "invalid completion failure body: {err}"
                        ))
                        .into_response(),
                }
            };
            let op_error = OperationError::from_parts(op_state, failure)
                .expect("state was checked to be terminal non-success");
            CompletionResult::Failure(op_error)
        }
        OperationState::Running => unreachable!("checked terminal above"),
    };

    let completion = CompletionRequest {
        state: op_state,
        token,
        links,
        header: protocol_header(&headers),
        result,
    };

    match state.handler.complete_operation(completion).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}
