//! End-to-end tests driving the real client against the real handler
//! runtime over loopback HTTP.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use nexus_core::{
    error::{Error, HandlerError, HandlerErrorKind, OperationError},
    link::Link,
    payload::Json,
    types::{OperationInfo, OperationState},
};
use nexus_sdk::{
    client::{
        CancelOperationOptions as ClientCancelOptions,
        GetOperationInfoOptions as ClientGetInfoOptions,
        StartOperationOptions as ClientStartOptions, StartOperationResult,
        Transport,
    },
    completion::{
        self, CompletionClient, CompletionHandler, CompletionRequest,
        CompletionResult, DeliverCompletionOptions,
    },
    handler::{
        CancelOperationOptions, GetOperationInfoOptions,
        GetOperationResultOptions, Handler, HandlerContext,
        StartOperationOptions,
    },
    registry::{
        Operation, Service, ServiceRegistry, StartResult, SyncOperation,
    },
    server,
    service_client::{ExecuteOperationOptions, ServiceClient},
};
use tokio::time::Instant;

const SERVICE: &str = "test-service";

/// A handler served on an ephemeral loopback port for one test.
struct TestServer {
    base_url: String,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(router: axum::Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("No local addr");
        let task = tokio::spawn(async move {
            server::serve(listener, router, std::future::pending())
                .await
                .expect("Test server failed");
        });
        Self {
            base_url: format!("http://{addr}"),
            task,
        }
    }

    fn client(&self) -> ServiceClient {
        let transport =
            Transport::new(&self.base_url).expect("Failed to build transport");
        ServiceClient::new(transport, SERVICE)
            .expect("Failed to build service client")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Counts handler invocations so tests can assert on exact request counts.
struct CountingHandler {
    inner: Arc<dyn Handler>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn start_operation(
        &self,
        ctx: &HandlerContext,
        input: nexus_sdk::lazy::LazyValue,
        options: StartOperationOptions,
    ) -> Result<nexus_sdk::handler::StartOperationResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.start_operation(ctx, input, options).await
    }

    async fn get_operation_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<nexus_core::content::Content, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_operation_result(ctx, token, options).await
    }

    async fn get_operation_info(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_operation_info(ctx, token, options).await
    }

    async fn cancel_operation(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel_operation(ctx, token, options).await
    }
}

fn registry_with(service: Service) -> Arc<dyn Handler> {
    let mut registry = ServiceRegistry::new();
    registry.register_service(service).unwrap();
    Arc::new(registry.into_handler().unwrap())
}

// --- S1: sync echo --- //

#[tokio::test]
async fn sync_echo_roundtrip() {
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new(
            "bytes-io",
            |_ctx, input: Bytes| async move {
                let mut out = input.to_vec();
                out.extend_from_slice(b", world");
                Ok::<_, Error>(Bytes::from(out))
            },
        ))
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(CountingHandler {
        inner: registry_with(service),
        calls: calls.clone(),
    });
    let server = TestServer::spawn(server::router(handler)).await;

    let result = server
        .client()
        .execute_operation(
            "bytes-io",
            Bytes::from_static(b"hello"),
            ExecuteOperationOptions::default(),
        )
        .await
        .expect("execute failed");

    let output = result.consume::<Bytes>().await.unwrap();
    assert_eq!(output, Bytes::from_static(b"hello, world"));
    // A sync completion takes exactly one request.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// --- S2: async + long poll --- //

struct AsyncWithResult {
    attempts: Arc<AtomicUsize>,
    waits_seen: Arc<Mutex<Vec<Duration>>>,
}

#[async_trait]
impl Operation for AsyncWithResult {
    type Input = Bytes;
    type Output = Bytes;

    fn name(&self) -> &str {
        "async-op"
    }

    async fn start(
        &self,
        _ctx: &HandlerContext,
        _input: Self::Input,
        _options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error> {
        Ok(StartResult::pending("async"))
    }

    async fn get_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<Self::Output, Error> {
        assert_eq!(token, "async");
        self.waits_seen.lock().unwrap().push(options.wait);
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            // A long-poll handler blocks until its deadline. Oversleep a
            // little so the runtime's wait timer deterministically fires
            // first and produces the 408.
            let deadline =
                ctx.deadline().expect("first poll must carry a deadline");
            tokio::time::sleep_until(deadline + Duration::from_millis(300))
                .await;
            return Err(Error::OperationStillRunning);
        }
        Ok(Bytes::from_static(b"body"))
    }
}

#[tokio::test]
async fn async_long_poll_retries_after_server_timeout() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let waits_seen = Arc::new(Mutex::new(Vec::new()));
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(AsyncWithResult {
            attempts: attempts.clone(),
            waits_seen: waits_seen.clone(),
        })
        .unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let started = Instant::now();
    let result = server
        .client()
        .execute_operation(
            "async-op",
            Bytes::new(),
            ExecuteOperationOptions {
                start: ClientStartOptions {
                    deadline: Some(Instant::now() + Duration::from_secs(5)),
                    ..Default::default()
                },
                wait: Some(Duration::from_secs(1)),
            },
        )
        .await
        .expect("execute failed");
    let output = result.consume::<Bytes>().await.unwrap();

    assert_eq!(output, Bytes::from_static(b"body"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // First poll carried the requested wait; the retry had no budget left.
    let waits = waits_seen.lock().unwrap().clone();
    assert_eq!(waits.len(), 2);
    assert!(
        waits[0] >= Duration::from_millis(900)
            && waits[0] <= Duration::from_millis(1100),
        "unexpected first wait: {:?}",
        waits[0]
    );
    assert_eq!(waits[1], Duration::ZERO);

    // The whole exchange is paced by the 1s server-side wait, well inside
    // the 5s deadline.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "too slow: {elapsed:?}");
}

struct NeverDone;

#[async_trait]
impl Operation for NeverDone {
    type Input = Bytes;
    type Output = Bytes;

    fn name(&self) -> &str {
        "never-done"
    }

    async fn start(
        &self,
        _ctx: &HandlerContext,
        _input: Self::Input,
        _options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error> {
        Ok(StartResult::pending("nd-1"))
    }

    async fn get_result(
        &self,
        _ctx: &HandlerContext,
        _token: &str,
        _options: GetOperationResultOptions,
    ) -> Result<Self::Output, Error> {
        Err(Error::OperationStillRunning)
    }
}

/// A 412 comes back as the still-running sentinel, never as a handler
/// error.
#[tokio::test]
async fn still_running_surfaces_as_the_sentinel() {
    let mut service = Service::new(SERVICE).unwrap();
    service.register(NeverDone).unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let client = server.client();
    let handle = client.operation_handle("never-done", "nd-1").unwrap();
    let err = handle
        .get_result(Default::default())
        .await
        .expect_err("operation is never done");
    assert!(
        matches!(err, Error::OperationStillRunning),
        "expected the sentinel, got {err:?}"
    );
}

// --- S3: request-timeout header overrides the context deadline --- //

#[tokio::test]
async fn request_timeout_header_bounds_handler_deadline() {
    let observed = Arc::new(Mutex::new(None::<Duration>));
    let observed_in_op = observed.clone();

    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new("observe-deadline", {
            move |ctx: HandlerContext, _input: Bytes| {
                let observed = observed_in_op.clone();
                async move {
                    *observed.lock().unwrap() = ctx.time_remaining();
                    Ok::<_, Error>(Bytes::new())
                }
            }
        }))
        .unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let started = Instant::now();
    let mut header = BTreeMap::new();
    header.insert("nexus-request-timeout".to_owned(), "100ms".to_owned());
    server
        .client()
        .start_operation(
            "observe-deadline",
            Bytes::new(),
            ClientStartOptions {
                // The explicit header wins over the 5s derived from here.
                deadline: Some(Instant::now() + Duration::from_secs(5)),
                header,
                ..Default::default()
            },
        )
        .await
        .expect("start failed");

    let remaining = observed
        .lock()
        .unwrap()
        .expect("handler saw no deadline");
    assert!(
        remaining > Duration::from_millis(50)
            && remaining <= Duration::from_millis(105),
        "unexpected remaining budget: {remaining:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn lapsed_handler_deadline_maps_to_upstream_timeout() {
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new(
            "sleepy",
            |_ctx, _input: Bytes| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, Error>(Bytes::new())
            },
        ))
        .unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let mut header = BTreeMap::new();
    header.insert("nexus-request-timeout".to_owned(), "100ms".to_owned());
    let err = server
        .client()
        .start_operation(
            "sleepy",
            Bytes::new(),
            ClientStartOptions {
                header,
                ..Default::default()
            },
        )
        .await
        .expect_err("start should time out server-side");

    match err {
        Error::Handler(err) =>
            assert_eq!(err.kind, HandlerErrorKind::UpstreamTimeout),
        other => panic!("expected handler error, got {other:?}"),
    }
}

// --- S4: unsuccessful operation --- //

#[tokio::test]
async fn canceled_start_surfaces_as_operation_error() {
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new(
            "doomed",
            |_ctx, _input: Bytes| async move {
                Err::<Bytes, Error>(
                    OperationError::canceled("expected message").into(),
                )
            },
        ))
        .unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let err = server
        .client()
        .start_operation(
            "doomed",
            Bytes::new(),
            ClientStartOptions::default(),
        )
        .await
        .expect_err("start should fail");
    match err {
        Error::Operation(err) => {
            assert_eq!(err.state(), OperationState::Canceled);
            assert_eq!(err.message(), "expected message");
        }
        other => panic!("expected operation error, got {other:?}"),
    }

    // Wire exactness: 424 plus the state header.
    let raw = reqwest::Client::new()
        .post(format!("{}/{SERVICE}/doomed", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(raw.status().as_u16(), 424);
    assert_eq!(
        raw.headers().get("nexus-operation-state").unwrap(),
        "canceled"
    );
    let failure: nexus_core::failure::Failure = raw.json().await.unwrap();
    assert_eq!(failure.message, "expected message");
}

// --- S5: cancel propagation --- //

struct Cancelable;

#[async_trait]
impl Operation for Cancelable {
    type Input = Bytes;
    type Output = Bytes;

    fn name(&self) -> &str {
        "cancelable"
    }

    async fn start(
        &self,
        _ctx: &HandlerContext,
        _input: Self::Input,
        _options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error> {
        Ok(StartResult::pending("tok-1"))
    }

    async fn cancel(
        &self,
        _ctx: &HandlerContext,
        _token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        if options.header.get("fail").map(String::as_str) == Some("1") {
            return Err(HandlerError::new(
                HandlerErrorKind::BadRequest,
                "asked to fail",
            )
            .into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn cancel_propagates_headers_and_errors() {
    let mut service = Service::new(SERVICE).unwrap();
    service.register(Cancelable).unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;
    let client = server.client();

    let handle = client.operation_handle("cancelable", "tok-1").unwrap();
    handle
        .cancel(ClientCancelOptions::default())
        .await
        .expect("cancel should be accepted");

    let mut header = BTreeMap::new();
    header.insert("fail".to_owned(), "1".to_owned());
    let err = handle
        .cancel(ClientCancelOptions {
            header,
            ..Default::default()
        })
        .await
        .expect_err("cancel should fail");
    match err {
        Error::Handler(err) => {
            assert_eq!(err.kind, HandlerErrorKind::BadRequest);
            assert_eq!(err.kind.to_string(), "bad_request");
        }
        other => panic!("expected handler error, got {other:?}"),
    }
}

// --- S6: completion delivery --- //

struct CompletionProbe {
    tx: tokio::sync::mpsc::UnboundedSender<(
        OperationState,
        i64,
        Option<String>,
        usize,
    )>,
}

#[async_trait]
impl CompletionHandler for CompletionProbe {
    async fn complete_operation(
        &self,
        request: CompletionRequest,
    ) -> Result<(), Error> {
        let value = match request.result {
            CompletionResult::Success(lazy) => {
                let Json(value) = lazy.consume::<Json<i64>>().await?;
                value
            }
            CompletionResult::Failure(err) =>
                panic!("unexpected failure completion: {err}"),
        };
        self.tx
            .send((
                request.state,
                value,
                request.header.get("foo").cloned(),
                request.links.len(),
            ))
            .expect("probe channel closed");
        Ok(())
    }
}

/// Operation that posts its completion to the caller's callback URL as
/// soon as it "finishes".
struct CompletesViaCallback;

#[async_trait]
impl Operation for CompletesViaCallback {
    type Input = Bytes;
    type Output = Json<i64>;

    fn name(&self) -> &str {
        "callback-op"
    }

    async fn start(
        &self,
        _ctx: &HandlerContext,
        _input: Self::Input,
        options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error> {
        let callback_url = options
            .callback_url
            .clone()
            .ok_or_else(|| Error::bad_request("callback url required"))?;
        let callback_header = options.callback_header.clone();
        tokio::spawn(async move {
            let client =
                CompletionClient::new().expect("completion client");
            client
                .deliver_success(
                    &callback_url,
                    Json(666_i64),
                    DeliverCompletionOptions {
                        token: Some("cb-1".to_owned()),
                        links: vec![Link {
                            url: "https://example.com/ref".to_owned(),
                            r#type: "org.test.Ref".to_owned(),
                        }],
                        header: callback_header,
                    },
                )
                .await
                .expect("completion delivery failed");
        });
        Ok(StartResult::pending("cb-1"))
    }
}

#[tokio::test]
async fn async_completion_reaches_the_callback_url() {
    // The caller side: a completion handler on its own ephemeral port.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let completion_router =
        completion::router(Arc::new(CompletionProbe { tx }));
    let caller = TestServer::spawn(completion_router).await;

    // The handler side.
    let mut service = Service::new(SERVICE).unwrap();
    service.register(CompletesViaCallback).unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let mut callback_header = BTreeMap::new();
    callback_header.insert("foo".to_owned(), "bar".to_owned());
    let client = server.client();
    let result = client
        .start_operation(
            "callback-op",
            Bytes::new(),
            ClientStartOptions {
                callback_url: Some(format!("{}/", caller.base_url)),
                callback_header,
                ..Default::default()
            },
        )
        .await
        .expect("start failed");
    match result {
        StartOperationResult::Async(handle) =>
            assert_eq!(handle.token(), "cb-1"),
        StartOperationResult::Sync(_) => panic!("expected async start"),
    }

    let (state, value, foo, links) = tokio::time::timeout(
        Duration::from_secs(5),
        rx.recv(),
    )
    .await
    .expect("no completion within 5s")
    .expect("probe channel closed");
    assert_eq!(state, OperationState::Succeeded);
    assert_eq!(value, 666);
    assert_eq!(foo.as_deref(), Some("bar"));
    assert!(links >= 1);
}

// --- Invariants --- //

struct InfoEcho;

#[async_trait]
impl Operation for InfoEcho {
    type Input = Bytes;
    type Output = Bytes;

    fn name(&self) -> &str {
        "info-echo"
    }

    async fn start(
        &self,
        _ctx: &HandlerContext,
        _input: Self::Input,
        _options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error> {
        Ok(StartResult::pending("T-123"))
    }

    async fn get_info(
        &self,
        _ctx: &HandlerContext,
        token: &str,
        _options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        Ok(OperationInfo {
            token: token.to_owned(),
            state: OperationState::Running,
            start_time: None,
        })
    }
}

#[tokio::test]
async fn async_start_token_flows_through_get_info() {
    let mut service = Service::new(SERVICE).unwrap();
    service.register(InfoEcho).unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;
    let client = server.client();

    let result = client
        .start_operation(
            "info-echo",
            Bytes::new(),
            ClientStartOptions::default(),
        )
        .await
        .expect("start failed");
    let token = match result {
        StartOperationResult::Async(handle) => handle.token().to_owned(),
        StartOperationResult::Sync(_) => panic!("expected async start"),
    };
    assert_eq!(token, "T-123");

    let handle = client.operation_handle("info-echo", &token).unwrap();
    let info = handle
        .get_info(ClientGetInfoOptions::default())
        .await
        .expect("get_info failed");
    assert_eq!(info.token, token);
    assert_eq!(info.state, OperationState::Running);
}

#[tokio::test]
async fn unknown_routes_map_to_not_found() {
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new(
            "known",
            |_ctx, input: Bytes| async move { Ok::<_, Error>(input) },
        ))
        .unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;
    let client = server.client();

    let err = client
        .start_operation(
            "missing-op",
            Bytes::new(),
            ClientStartOptions::default(),
        )
        .await
        .expect_err("unknown operation should fail");
    match err {
        Error::Handler(err) =>
            assert_eq!(err.kind, HandlerErrorKind::NotFound),
        other => panic!("expected handler error, got {other:?}"),
    }

    let other_service = ServiceClient::new(
        Transport::new(&server.base_url).unwrap(),
        "missing-service",
    )
    .unwrap();
    let err = other_service
        .start_operation("known", Bytes::new(), ClientStartOptions::default())
        .await
        .expect_err("unknown service should fail");
    match err {
        Error::Handler(err) =>
            assert_eq!(err.kind, HandlerErrorKind::NotFound),
        other => panic!("expected handler error, got {other:?}"),
    }
}

#[tokio::test]
async fn internal_errors_are_not_exposed_on_the_wire() {
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new(
            "leaky",
            |_ctx, _input: Bytes| async move {
                Err::<Bytes, Error>(Error::Internal(anyhow::anyhow!(
                    "secret database password is hunter2"
                )))
            },
        ))
        .unwrap();
    let server = TestServer::spawn(server::router(registry_with(service))).await;

    let err = server
        .client()
        .start_operation("leaky", Bytes::new(), ClientStartOptions::default())
        .await
        .expect_err("start should fail");
    match err {
        Error::Handler(err) => {
            assert_eq!(err.kind, HandlerErrorKind::Internal);
            assert_eq!(err.message(), "internal server error");
            assert!(!err.message().contains("hunter2"));
        }
        other => panic!("expected handler error, got {other:?}"),
    }
}

/// Middleware rejects requests without a token header and decorates the
/// ones it lets through with a link.
struct AuthMiddleware;

impl nexus_sdk::registry::Middleware for AuthMiddleware {
    fn intercept(
        &self,
        ctx: &HandlerContext,
        next: Arc<dyn nexus_sdk::registry::OperationHandler>,
    ) -> Result<Arc<dyn nexus_sdk::registry::OperationHandler>, HandlerError>
    {
        if ctx.operation() == "forbidden" {
            return Err(HandlerError::new(
                HandlerErrorKind::Unauthorized,
                "operation is off limits",
            ));
        }
        ctx.add_link(Link {
            url: "https://example.com/audit".to_owned(),
            r#type: "org.test.Audit".to_owned(),
        });
        Ok(next)
    }
}

#[tokio::test]
async fn middleware_can_abort_and_decorate() {
    let mut service = Service::new(SERVICE).unwrap();
    service
        .register(SyncOperation::new(
            "allowed",
            |_ctx, input: Bytes| async move { Ok::<_, Error>(input) },
        ))
        .unwrap();
    service
        .register(SyncOperation::new(
            "forbidden",
            |_ctx, input: Bytes| async move { Ok::<_, Error>(input) },
        ))
        .unwrap();
    let mut registry = ServiceRegistry::new();
    registry.register_service(service).unwrap();
    registry.with_middleware(Arc::new(AuthMiddleware));
    let handler = Arc::new(registry.into_handler().unwrap());
    let server = TestServer::spawn(server::router(handler)).await;

    let err = server
        .client()
        .start_operation(
            "forbidden",
            Bytes::new(),
            ClientStartOptions::default(),
        )
        .await
        .expect_err("middleware should abort");
    match err {
        Error::Handler(err) =>
            assert_eq!(err.kind, HandlerErrorKind::Unauthorized),
        other => panic!("expected handler error, got {other:?}"),
    }

    // The allowed path succeeds and carries the middleware's link on the
    // raw start response.
    let raw = reqwest::Client::new()
        .post(format!("{}/{SERVICE}/allowed", server.base_url))
        .body("x")
        .header("content-type", "application/octet-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(raw.status().as_u16(), 200);
    let link_header = raw
        .headers()
        .get("link")
        .expect("missing link header")
        .to_str()
        .unwrap();
    assert!(link_header.contains("org.test.Audit"));
}
