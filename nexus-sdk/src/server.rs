//! The axum-based handler runtime.
//!
//! [`router`] binds the four protocol routes over a [`Handler`]:
//!
//! - `POST /{service}/{operation}` — start
//! - `GET  /{service}/{operation}` — get info
//! - `GET  /{service}/{operation}/result` — get result (long-poll aware)
//! - `POST /{service}/{operation}/cancel` — cancel
//!
//! The runtime decodes protocol headers and query parameters into options,
//! derives the handler-visible deadline from `Nexus-Request-Timeout` (and
//! the `wait` budget for get-result), invokes the handler, and writes
//! structured success/failure responses. Unexpected handler errors are
//! logged and surfaced as a generic 500; the original detail never leaves
//! the process.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        Path, Query, Request, State,
        rejection::{PathRejection, QueryRejection},
    },
    response::IntoResponse,
    routing::{get, post},
};
use http::{HeaderMap, HeaderValue, StatusCode};
use nexus_core::{
    axum_helpers::{build_json_response, internal_server_error_response},
    content::{self, Content},
    duration,
    error::{Error, HandlerError, HandlerErrorKind},
    link,
    protocol::{
        CALLBACK_HEADER_PREFIX, HEADER_LINK, HEADER_OPERATION_STATE,
        HEADER_OPERATION_TOKEN, HEADER_REQUEST_ID, HEADER_REQUEST_TIMEOUT,
        QUERY_CALLBACK, QUERY_WAIT, STATUS_CANCEL_ACCEPTED,
        STATUS_OPERATION_STARTED, STATUS_POLL_TIMEOUT,
    },
    serializer::{Serializer, SerializerChain},
    types::{OperationInfo, OperationState},
};
use tokio::time::Instant;
use tracing::warn;

use crate::{
    handler::{
        CancelOperationOptions, GetOperationInfoOptions,
        GetOperationResultOptions, Handler, HandlerContext, HandlerInfo,
        RequestHeader, StartOperationOptions, StartOperationResponse,
    },
    lazy::LazyValue,
};

/// Shared state behind the protocol routes.
#[derive(Clone)]
struct RuntimeState {
    handler: Arc<dyn Handler>,
    serializer: Arc<dyn Serializer>,
}

/// An axum [`Router`] serving the four protocol routes over `handler`
/// with the default serializer chain.
pub fn router(handler: Arc<dyn Handler>) -> Router {
    router_with_serializer(handler, Arc::new(SerializerChain::default()))
}

/// [`router`] with a custom serializer chain.
pub fn router_with_serializer(
    handler: Arc<dyn Handler>,
    serializer: Arc<dyn Serializer>,
) -> Router {
    let state = RuntimeState {
        handler,
        serializer,
    };
    Router::new()
        .route(
            "/{service}/{operation}",
            post(start_operation).get(get_operation_info),
        )
        .route("/{service}/{operation}/result", get(get_operation_result))
        .route("/{service}/{operation}/cancel", post(cancel_operation))
        .with_state(state)
}

/// Serve `router` on the listener until `shutdown` resolves, then drain
/// gracefully.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

// --- Route handlers --- //

async fn start_operation(
    State(state): State<RuntimeState>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    request: Request,
) -> http::Response<axum::body::Body> {
    let (service, operation) = match decode_path(path) {
        Ok(names) => names,
        Err(err) => return err.into_response(),
    };
    let query = match decode_query(query) {
        Ok(query) => query,
        Err(err) => return err.into_response(),
    };

    let (parts, body) = request.into_parts();
    let headers = parts.headers;

    let deadline = match request_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(err) => return err.into_response(),
    };
    let ctx = HandlerContext::new(
        HandlerInfo {
            service,
            operation,
            deadline,
        },
        state.serializer.clone(),
    );

    let links = match decode_links(&headers) {
        Ok(links) => links,
        Err(err) => return err.into_response(),
    };
    let options = StartOperationOptions {
        request_id: header_str(&headers, HEADER_REQUEST_ID.as_str())
            .unwrap_or_default()
            .to_owned(),
        callback_url: query_value(&query, QUERY_CALLBACK),
        callback_header: callback_header(&headers),
        links,
        header: protocol_header(&headers),
    };
    let input = LazyValue::from_request_body(
        state.serializer.clone(),
        content::header_from_http(&headers),
        body,
    );

    let result = invoke(deadline, async {
        state.handler.start_operation(&ctx, input, options).await
    })
    .await;

    match result {
        Ok(StartOperationResponse::Sync { content }) => {
            let mut response = content_response(StatusCode::OK, content);
            append_link_headers(&mut response, &ctx.links());
            response
        }
        Ok(StartOperationResponse::Async {
            token,
            start_time,
            links,
        }) => {
            if token.is_empty() {
                warn!("Handler returned an empty operation token");
                return internal_server_error_response();
            }
            let info = OperationInfo {
                token,
                state: OperationState::Running,
                start_time,
            };
            let mut response =
                build_json_response(STATUS_OPERATION_STARTED, &info);
            response.headers_mut().insert(
                HEADER_OPERATION_STATE,
                HeaderValue::from_static("running"),
            );
            let mut all_links = ctx.links();
            all_links.extend(links);
            append_link_headers(&mut response, &all_links);
            response
        }
        Err(err) => err.into_response(),
    }
}

async fn get_operation_result(
    State(state): State<RuntimeState>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    headers: HeaderMap,
) -> http::Response<axum::body::Body> {
    let (service, operation) = match decode_path(path) {
        Ok(names) => names,
        Err(err) => return err.into_response(),
    };
    let query = match decode_query(query) {
        Ok(query) => query,
        Err(err) => return err.into_response(),
    };
    let token = match operation_token(&headers) {
        Ok(token) => token,
        Err(err) => return err.into_response(),
    };

    let wait = match query_value(&query, QUERY_WAIT) {
        Some(raw) => match duration::parse(&raw) {
            Ok(wait) => wait,
            Err(err) =>
                return Error::bad_request(format!(
                    "invalid wait query parameter: {err}"
                ))
                .into_response(),
        },
        None => Duration::ZERO,
    };

    let request_deadline = match request_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(err) => return err.into_response(),
    };
    // A long poll bounds the handler-visible deadline to the wait budget
    // on top of any propagated request timeout. An astronomically large
    // wait (how "no deadline" travels) simply doesn't bound anything.
    let wait_deadline = if wait > Duration::ZERO {
        Instant::now().checked_add(wait)
    } else {
        None
    };
    let handler_deadline = match (request_deadline, wait_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (deadline, None) | (None, deadline) => deadline,
    };

    let ctx = HandlerContext::new(
        HandlerInfo {
            service,
            operation,
            deadline: handler_deadline,
        },
        state.serializer.clone(),
    );
    let options = GetOperationResultOptions {
        wait,
        header: protocol_header(&headers),
    };

    let result = match handler_deadline {
        Some(deadline) => {
            let fut = state
                .handler
                .get_operation_result(&ctx, &token, options);
            match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                // The wait budget lapsed while the caller is (presumably)
                // still there: that's the long-poll timeout, not an error.
                Err(_elapsed) if wait > Duration::ZERO =>
                    return STATUS_POLL_TIMEOUT.into_response(),
                Err(_elapsed) => Err(handling_timed_out()),
            }
        }
        None =>
            state
                .handler
                .get_operation_result(&ctx, &token, options)
                .await,
    };

    match result {
        Ok(content) => content_response(StatusCode::OK, content),
        Err(err) => err.into_response(),
    }
}

async fn get_operation_info(
    State(state): State<RuntimeState>,
    path: Result<Path<(String, String)>, PathRejection>,
    headers: HeaderMap,
) -> http::Response<axum::body::Body> {
    let (service, operation) = match decode_path(path) {
        Ok(names) => names,
        Err(err) => return err.into_response(),
    };
    let token = match operation_token(&headers) {
        Ok(token) => token,
        Err(err) => return err.into_response(),
    };
    let deadline = match request_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(err) => return err.into_response(),
    };

    let ctx = HandlerContext::new(
        HandlerInfo {
            service,
            operation,
            deadline,
        },
        state.serializer.clone(),
    );
    let options = GetOperationInfoOptions {
        header: protocol_header(&headers),
    };

    let result = invoke(deadline, async {
        state.handler.get_operation_info(&ctx, &token, options).await
    })
    .await;

    match result {
        Ok(info) => build_json_response(StatusCode::OK, &info),
        Err(err) => err.into_response(),
    }
}

async fn cancel_operation(
    State(state): State<RuntimeState>,
    path: Result<Path<(String, String)>, PathRejection>,
    headers: HeaderMap,
) -> http::Response<axum::body::Body> {
    let (service, operation) = match decode_path(path) {
        Ok(names) => names,
        Err(err) => return err.into_response(),
    };
    let token = match operation_token(&headers) {
        Ok(token) => token,
        Err(err) => return err.into_response(),
    };
    let deadline = match request_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(err) => return err.into_response(),
    };

    let ctx = HandlerContext::new(
        HandlerInfo {
            service,
            operation,
            deadline,
        },
        state.serializer.clone(),
    );
    let options = CancelOperationOptions {
        header: protocol_header(&headers),
    };

    let result = invoke(deadline, async {
        state.handler.cancel_operation(&ctx, &token, options).await
    })
    .await;

    match result {
        Ok(()) => STATUS_CANCEL_ACCEPTED.into_response(),
        Err(err) => err.into_response(),
    }
}

// --- Request decoding --- //

fn decode_path(
    path: Result<Path<(String, String)>, PathRejection>,
) -> Result<(String, String), Error> {
    let Path((service, operation)) = path.map_err(|rejection| {
        Error::bad_request(format!("malformed path: {rejection}"))
    })?;
    if service.is_empty() || operation.is_empty() {
        return Err(Error::bad_request(
            "service and operation path segments must be non-empty",
        ));
    }
    Ok((service, operation))
}

fn decode_query(
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Vec<(String, String)>, Error> {
    let Query(query) = query.map_err(|rejection| {
        Error::bad_request(format!("malformed query string: {rejection}"))
    })?;
    Ok(query)
}

fn query_value(query: &[(String, String)], name: &str) -> Option<String> {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The operation token for the three non-start verbs. Only the header form
/// is accepted.
fn operation_token(headers: &HeaderMap) -> Result<String, Error> {
    match header_str(headers, HEADER_OPERATION_TOKEN.as_str()) {
        Some(token) if !token.is_empty() => Ok(token.to_owned()),
        _ => Err(Error::bad_request("missing operation token header")),
    }
}

/// Derive the handler deadline from `Nexus-Request-Timeout`, if present.
fn request_deadline(headers: &HeaderMap) -> Result<Option<Instant>, Error> {
    match header_str(headers, HEADER_REQUEST_TIMEOUT.as_str()) {
        Some(raw) => {
            let timeout = duration::parse(raw).map_err(|err| {
                Error::bad_request(format!(
                    "invalid request timeout header: {err}"
                ))
            })?;
            Ok(Instant::now().checked_add(timeout))
        }
        None => Ok(None),
    }
}

/// Caller-provided `Nexus-Callback-*` headers, prefix stripped.
fn callback_header(
    headers: &HeaderMap,
) -> std::collections::BTreeMap<String, String> {
    let mut callback = std::collections::BTreeMap::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(CALLBACK_HEADER_PREFIX)
        else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            callback.insert(key.to_owned(), value.to_owned());
        }
    }
    callback
}

/// The remaining protocol headers: everything except payload (`Content-*`)
/// and callback-prefixed entries, which travel on their own fields.
pub(crate) fn protocol_header(headers: &HeaderMap) -> RequestHeader {
    let mut header = RequestHeader::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name.starts_with(nexus_core::protocol::CONTENT_HEADER_PREFIX)
            || name.starts_with(CALLBACK_HEADER_PREFIX)
        {
            continue;
        }
        if let Ok(value) = value.to_str() {
            header.insert(name.to_owned(), value.to_owned());
        }
    }
    header
}

pub(crate) fn decode_links(
    headers: &HeaderMap,
) -> Result<Vec<nexus_core::link::Link>, Error> {
    let values = headers
        .get_all(&HEADER_LINK)
        .iter()
        .filter_map(|value| value.to_str().ok());
    link::parse_header_values(values)
        .map_err(|err| Error::bad_request(format!("invalid link header: {err}")))
}

// --- Invocation & response writing --- //

/// Run a handler future, bounding it by the request deadline. A fired
/// deadline maps to the upstream-timeout handler error.
async fn invoke<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(handling_timed_out()),
        },
        None => fut.await,
    }
}

fn handling_timed_out() -> Error {
    Error::Handler(HandlerError::new(
        HandlerErrorKind::UpstreamTimeout,
        "request handling timed out",
    ))
}

/// A success response carrying a serialized payload.
fn content_response(
    status: StatusCode,
    content: Content,
) -> http::Response<axum::body::Body> {
    let mut response = http::Response::builder()
        .status(status)
        .body(axum::body::Body::from(content.data.clone()))
        .expect("building a response from parts is infallible");
    content.apply_to_http(response.headers_mut());
    response
}

/// Emit accumulated links as `Link` response headers. A link the handler
/// built badly is dropped with a warning rather than failing the response.
fn append_link_headers(
    response: &mut http::Response<axum::body::Body>,
    links: &[nexus_core::link::Link],
) {
    for link in links {
        let value = match link.to_header_value() {
            Ok(value) => value,
            Err(err) => {
                warn!("Dropping unencodable link: {err}");
                continue;
            }
        };
        match HeaderValue::try_from(value) {
            Ok(value) => {
                response.headers_mut().append(HEADER_LINK, value);
            }
            Err(_) => warn!("Dropping link with invalid header value"),
        }
    }
}
