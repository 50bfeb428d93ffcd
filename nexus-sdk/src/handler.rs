//! The server-side handler contract.
//!
//! The HTTP runtime decodes each request into an options struct plus a
//! [`HandlerContext`] and drives a [`Handler`]. Most users never implement
//! [`Handler`] directly; they register typed operations into a
//! [`crate::registry::ServiceRegistry`] and let it provide the handler.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use nexus_core::{
    content::Content, error::Error, link::Link, serializer::Serializer,
    types::OperationInfo,
};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::lazy::LazyValue;

/// Protocol headers accompanying a request, lowercased, with `Content-*`
/// entries stripped (those travel with the payload).
pub type RequestHeader = BTreeMap<String, String>;

/// Record describing the request being handled. Attached to the
/// [`HandlerContext`] so middleware and operations can inspect it.
#[derive(Clone, Debug)]
pub struct HandlerInfo {
    /// The requested service name (URL-decoded).
    pub service: String,
    /// The requested operation name (URL-decoded).
    pub operation: String,
    /// The handler-visible deadline, when one applies. Derived from the
    /// `Nexus-Request-Timeout` header and, for get-result long polls,
    /// further bounded by the `wait` budget.
    pub deadline: Option<Instant>,
}

/// Context threaded through middleware and operation methods.
///
/// Cheap to clone. The link accumulator is shared: links added here are
/// emitted as `Link` response headers on the start reply.
#[derive(Clone)]
pub struct HandlerContext {
    info: Arc<HandlerInfo>,
    links: Arc<Mutex<Vec<Link>>>,
    serializer: Arc<dyn Serializer>,
}

impl HandlerContext {
    /// Build a context for a request.
    pub fn new(info: HandlerInfo, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            info: Arc::new(info),
            links: Arc::new(Mutex::new(Vec::new())),
            serializer,
        }
    }

    /// The request descriptor.
    pub fn info(&self) -> &HandlerInfo {
        &self.info
    }

    /// The serializer chain configured on the handler runtime. Operations
    /// use it to frame payloads the same way the runtime does.
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// The requested service name.
    pub fn service(&self) -> &str {
        &self.info.service
    }

    /// The requested operation name.
    pub fn operation(&self) -> &str {
        &self.info.operation
    }

    /// The handler-visible deadline, if any. Work should be abandoned
    /// promptly once it passes.
    pub fn deadline(&self) -> Option<Instant> {
        self.info.deadline
    }

    /// Time remaining until the deadline. `None` when no deadline applies.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.info
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Append a link to be emitted on the start response.
    pub fn add_link(&self, link: Link) {
        self.links.lock().expect("link accumulator poisoned").push(link);
    }

    /// Snapshot the accumulated links.
    pub fn links(&self) -> Vec<Link> {
        self.links.lock().expect("link accumulator poisoned").clone()
    }
}

/// Options decoded from a start request.
#[derive(Clone, Debug, Default)]
pub struct StartOperationOptions {
    /// Caller-minted request id, for deduplication. The runtime guarantees
    /// propagation, not deduplication.
    pub request_id: String,
    /// Absolute URL to deliver the async completion to, when the caller
    /// supplied one.
    pub callback_url: Option<String>,
    /// Caller-provided `Nexus-Callback-*` header fields, prefix stripped.
    /// Must be attached as-is when delivering the completion.
    pub callback_header: BTreeMap<String, String>,
    /// Links supplied by the caller.
    pub links: Vec<Link>,
    /// Remaining protocol headers.
    pub header: RequestHeader,
}

/// Options decoded from a get-result request.
#[derive(Clone, Debug, Default)]
pub struct GetOperationResultOptions {
    /// How long the caller is willing to long-poll. Zero means "answer
    /// now".
    pub wait: Duration,
    /// Remaining protocol headers.
    pub header: RequestHeader,
}

/// Options decoded from a get-info request.
#[derive(Clone, Debug, Default)]
pub struct GetOperationInfoOptions {
    /// Remaining protocol headers.
    pub header: RequestHeader,
}

/// Options decoded from a cancel request.
#[derive(Clone, Debug, Default)]
pub struct CancelOperationOptions {
    /// Remaining protocol headers.
    pub header: RequestHeader,
}

/// Erased outcome of a start call, ready for the wire.
pub enum StartOperationResponse {
    /// The operation completed synchronously; 200 with the result payload.
    Sync {
        /// The serialized result.
        content: Content,
    },
    /// The operation continues; 201 with a JSON `OperationInfo`.
    Async {
        /// Handler-minted token identifying the operation. Must be
        /// non-empty.
        token: String,
        /// When the operation started, if tracked.
        start_time: Option<OffsetDateTime>,
        /// Links for the caller, emitted alongside any accumulated on the
        /// context.
        links: Vec<Link>,
    },
}

/// A Nexus handler: the four-verb surface the HTTP runtime drives.
///
/// Service and operation names travel on the [`HandlerContext`]. Returning
/// [`Error::OperationStillRunning`] from `get_operation_result` is the
/// normal "not done yet" signal; long-polling handlers should block until
/// the context deadline and then return it promptly.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle a start request.
    async fn start_operation(
        &self,
        ctx: &HandlerContext,
        input: LazyValue,
        options: StartOperationOptions,
    ) -> Result<StartOperationResponse, Error>;

    /// Handle a get-result request, long-polling up to the context
    /// deadline when `options.wait` is non-zero.
    async fn get_operation_result(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationResultOptions,
    ) -> Result<Content, Error>;

    /// Handle a get-info request.
    async fn get_operation_info(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error>;

    /// Handle a cancel request. Cancelation is asynchronous: success means
    /// the request was accepted, not that the operation stopped.
    async fn cancel_operation(
        &self,
        ctx: &HandlerContext,
        token: &str,
        options: CancelOperationOptions,
    ) -> Result<(), Error>;
}
