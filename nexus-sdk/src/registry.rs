//! Typed operations, services, and the registry the handler runtime
//! dispatches through.
//!
//! User code implements the generic [`Operation`] trait (or wraps a
//! function with [`SyncOperation`]). The registry stores operations behind
//! the object-safe [`OperationHandler`] trait; the typed wrapper bridges
//! the two by materializing the input type through its
//! [`FromPayload`](nexus_core::payload::FromPayload) bound and serializing
//! the output through the context's serializer chain. Middleware composes
//! over `OperationHandler`s in registration order, each wrapping the next.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use nexus_core::{
    content::Content,
    error::{Error, HandlerError, HandlerErrorKind},
    link::Link,
    payload::{FromPayload, IntoPayload},
    types::OperationInfo,
};
use thiserror::Error as ThisError;
use time::OffsetDateTime;

use crate::{
    handler::{
        CancelOperationOptions, GetOperationInfoOptions,
        GetOperationResultOptions, Handler, HandlerContext,
        StartOperationOptions, StartOperationResponse,
    },
    lazy::LazyValue,
};

/// Error building a registry.
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum RegistryError {
    /// A service or operation was registered without a name.
    #[error("cannot register with an empty name")]
    EmptyName,
    /// Two operations in a service share a name.
    #[error("duplicate operation {0:?}")]
    DuplicateOperation(String),
    /// Two services in a registry share a name.
    #[error("duplicate service {0:?}")]
    DuplicateService(String),
    /// A handler was requested from a registry with no services.
    #[error("registry has no services")]
    NoServices,
}

/// Typed outcome of a start call.
pub enum StartResult<O> {
    /// The operation completed synchronously with this value.
    Sync(O),
    /// The operation continues asynchronously.
    Async {
        /// Handler-minted token identifying the operation; must be
        /// non-empty.
        token: String,
        /// When the operation started, if tracked.
        start_time: Option<OffsetDateTime>,
        /// Links the handler wants to expose to the caller.
        links: Vec<Link>,
    },
}

impl<O> StartResult<O> {
    /// A synchronous completion.
    pub fn sync(value: O) -> Self {
        Self::Sync(value)
    }

    /// An async-pending result carrying just a token.
    pub fn pending(token: impl Into<String>) -> Self {
        Self::Async {
            token: token.into(),
            start_time: None,
            links: Vec::new(),
        }
    }
}

/// A typed unit of work exposed by a service.
///
/// Only `start` is required. The other verbs default to a
/// `not_implemented` handler error, so operations that complete
/// synchronously don't have to stub them out.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// The input type, materialized from the request payload.
    type Input: FromPayload + Send;
    /// The output type, serialized into the response payload.
    type Output: IntoPayload + Send;

    /// The operation name, unique within its service.
    fn name(&self) -> &str;

    /// Start the operation: respond inline, fail it, or mint a token and
    /// continue asynchronously.
    async fn start(
        &self,
        ctx: &HandlerContext,
        input: Self::Input,
        options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error>;

    /// Fetch the result of an async operation, long-polling up to the
    /// context deadline when `options.wait` is non-zero.
    async fn get_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<Self::Output, Error> {
        let _ = (ctx, token, options);
        Err(not_implemented(self.name(), "get_result"))
    }

    /// Fetch the status of an async operation.
    async fn get_info(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        let _ = (ctx, token, options);
        Err(not_implemented(self.name(), "get_info"))
    }

    /// Request cancelation of an async operation.
    async fn cancel(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        let _ = (ctx, token, options);
        Err(not_implemented(self.name(), "cancel"))
    }
}

fn not_implemented(operation: &str, method: &str) -> Error {
    Error::Handler(HandlerError::new(
        HandlerErrorKind::NotImplemented,
        format!("operation {operation:?} does not implement {method}"),
    ))
}

type StartFn<I, O> = Box<
    dyn Fn(HandlerContext, I) -> BoxFuture<'static, Result<O, Error>>
        + Send
        + Sync,
>;

/// Wraps a single async function as an [`Operation`] whose `start` always
/// completes synchronously.
pub struct SyncOperation<I, O> {
    name: String,
    start_fn: StartFn<I, O>,
}

impl<I, O> SyncOperation<I, O> {
    /// Wrap `f` as the operation `name`.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HandlerContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            start_fn: Box::new(move |ctx, input| f(ctx, input).boxed()),
        }
    }
}

#[async_trait]
impl<I, O> Operation for SyncOperation<I, O>
where
    I: FromPayload + Send + 'static,
    O: IntoPayload + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &self,
        ctx: &HandlerContext,
        input: Self::Input,
        _options: StartOperationOptions,
    ) -> Result<StartResult<Self::Output>, Error> {
        let value = (self.start_fn)(ctx.clone(), input).await?;
        Ok(StartResult::Sync(value))
    }
}

/// Object-safe operation surface: what the dispatcher and middleware see.
///
/// Payloads are erased to [`LazyValue`]/[`Content`]; the blanket typed
/// wrapper created at registration implements this for any [`Operation`].
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// The operation name.
    fn name(&self) -> &str;

    /// Start with an undecoded input payload.
    async fn start(
        &self,
        ctx: &HandlerContext,
        input: LazyValue,
        options: StartOperationOptions,
    ) -> Result<StartOperationResponse, Error>;

    /// Get-result, producing the serialized output.
    async fn get_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<Content, Error>;

    /// Get-info passthrough.
    async fn get_info(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error>;

    /// Cancel passthrough.
    async fn cancel(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error>;
}

/// Middleware composing over operations.
///
/// Applied in registration order on every request. A middleware may
/// inspect the context, authorize, add links, and either return an error
/// to abort or wrap `next` with its own [`OperationHandler`].
pub trait Middleware: Send + Sync {
    /// Wrap (or replace) the next operation in the chain.
    fn intercept(
        &self,
        ctx: &HandlerContext,
        next: Arc<dyn OperationHandler>,
    ) -> Result<Arc<dyn OperationHandler>, HandlerError>;
}

/// The typed-to-erased bridge stored in a [`Service`].
struct TypedOperationHandler<Op> {
    op: Op,
}

#[async_trait]
impl<Op: Operation> OperationHandler for TypedOperationHandler<Op> {
    fn name(&self) -> &str {
        self.op.name()
    }

    async fn start(
        &self,
        ctx: &HandlerContext,
        input: LazyValue,
        options: StartOperationOptions,
    ) -> Result<StartOperationResponse, Error> {
        // Materialize the declared input type. Anything that fails here is
        // the caller's payload, not the handler.
        let input = input.consume::<Op::Input>().await.map_err(|err| {
            HandlerError::new(
                HandlerErrorKind::BadRequest,
                format!("failed to deserialize input: {err}"),
            )
        })?;

        match self.op.start(ctx, input, options).await? {
            StartResult::Sync(value) => {
                let content = serialize_output(ctx, value)?;
                Ok(StartOperationResponse::Sync { content })
            }
            StartResult::Async {
                token,
                start_time,
                links,
            } => {
                if token.is_empty() {
                    return Err(Error::Internal(anyhow!(
                        "operation {:?} returned an empty token",
                        self.op.name(),
                    )));
                }
                Ok(StartOperationResponse::Async {
                    token,
                    start_time,
                    links,
                })
            }
        }
    }

    async fn get_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<Content, Error> {
        let value = self.op.get_result(ctx, token, options).await?;
        serialize_output(ctx, value)
    }

    async fn get_info(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        self.op.get_info(ctx, token, options).await
    }

    async fn cancel(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        self.op.cancel(ctx, token, options).await
    }
}

/// Serialize an operation output through the context's serializer chain.
/// Failures are the handler's fault, never the caller's.
fn serialize_output<O: IntoPayload>(
    ctx: &HandlerContext,
    value: O,
) -> Result<Content, Error> {
    let payload = value
        .into_payload()
        .map_err(|err| anyhow!("failed to convert output: {err}"))?;
    let content = ctx
        .serializer()
        .serialize(&payload)
        .map_err(|err| anyhow!("failed to serialize output: {err}"))?;
    Ok(content)
}

/// A named, immutable-after-registration collection of operations.
pub struct Service {
    name: String,
    operations: BTreeMap<String, Arc<dyn OperationHandler>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// A service named `name`.
    pub fn new(name: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        Ok(Self {
            name,
            operations: BTreeMap::new(),
        })
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a typed operation. Fails on an empty or duplicate name.
    pub fn register<Op: Operation>(
        &mut self,
        op: Op,
    ) -> Result<&mut Self, RegistryError> {
        let name = op.name().to_owned();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.operations.contains_key(&name) {
            return Err(RegistryError::DuplicateOperation(name));
        }
        self.operations
            .insert(name, Arc::new(TypedOperationHandler { op }));
        Ok(self)
    }

    fn operation(&self, name: &str) -> Option<&Arc<dyn OperationHandler>> {
        self.operations.get(name)
    }
}

/// The set of services a handler exposes, plus its middleware chain.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Service>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services)
            .field("middleware_count", &self.middleware.len())
            .finish()
    }
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fully-built service. Fails on a duplicate name.
    pub fn register_service(
        &mut self,
        service: Service,
    ) -> Result<&mut Self, RegistryError> {
        if self.services.contains_key(service.name()) {
            return Err(RegistryError::DuplicateService(
                service.name().to_owned(),
            ));
        }
        self.services.insert(service.name().to_owned(), service);
        Ok(self)
    }

    /// Append a middleware. The chain runs in registration order on every
    /// request.
    pub fn with_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Freeze the registry into a [`Handler`]. Fails when no services were
    /// registered.
    pub fn into_handler(self) -> Result<RegistryHandler, RegistryError> {
        if self.services.is_empty() {
            return Err(RegistryError::NoServices);
        }
        Ok(RegistryHandler { registry: self })
    }
}

/// [`Handler`] implementation dispatching into a frozen
/// [`ServiceRegistry`].
#[derive(Debug)]
pub struct RegistryHandler {
    registry: ServiceRegistry,
}

impl RegistryHandler {
    /// Locate the operation and apply the middleware chain to it.
    fn resolve(
        &self,
        ctx: &HandlerContext,
    ) -> Result<Arc<dyn OperationHandler>, Error> {
        let service = self
            .registry
            .services
            .get(ctx.service())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "service {:?} not found",
                    ctx.service()
                ))
            })?;
        let mut op = service
            .operation(ctx.operation())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "operation {:?} not found in service {:?}",
                    ctx.operation(),
                    ctx.service()
                ))
            })?
            .clone();
        for middleware in &self.registry.middleware {
            op = middleware.intercept(ctx, op)?;
        }
        Ok(op)
    }
}

#[async_trait]
impl Handler for RegistryHandler {
    async fn start_operation(
        &self,
        ctx: &HandlerContext,
        input: LazyValue,
        options: StartOperationOptions,
    ) -> Result<StartOperationResponse, Error> {
        self.resolve(ctx)?.start(ctx, input, options).await
    }

    async fn get_operation_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<Content, Error> {
        self.resolve(ctx)?.get_result(ctx, token, options).await
    }

    async fn get_operation_info(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        self.resolve(ctx)?.get_info(ctx, token, options).await
    }

    async fn cancel_operation(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        self.resolve(ctx)?.cancel(ctx, token, options).await
    }
}
