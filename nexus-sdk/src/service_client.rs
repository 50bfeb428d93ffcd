//! User-facing client pinned to one service.

use std::time::Duration;

use nexus_core::{
    error::{Error, TransportError},
    payload::IntoPayload,
};

use crate::{
    client::{
        GetOperationResultOptions, StartOperationOptions,
        StartOperationResult, Transport,
    },
    handle::OperationHandle,
    lazy::LazyValue,
};

/// Options for [`ServiceClient::execute_operation`].
#[derive(Clone, Debug, Default)]
pub struct ExecuteOperationOptions {
    /// Options applied to the start call.
    pub start: StartOperationOptions,
    /// How long to wait for an async operation's result. `None` (or zero)
    /// means wait up to the caller deadline.
    pub wait: Option<Duration>,
}

/// A thin wrapper pinning a service name over a [`Transport`].
#[derive(Clone)]
pub struct ServiceClient {
    transport: Transport,
    service: String,
}

impl ServiceClient {
    /// A client for `service` over the given transport. The service name
    /// must be non-empty.
    pub fn new(
        transport: Transport,
        service: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let service = service.into();
        if service.is_empty() {
            return Err(TransportError::protocol(
                "service name must be non-empty",
            ));
        }
        Ok(Self { transport, service })
    }

    /// The pinned service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Start an operation on this service.
    pub async fn start_operation<I: IntoPayload>(
        &self,
        operation: &str,
        input: I,
        options: StartOperationOptions,
    ) -> Result<StartOperationResult<'_>, Error> {
        self.transport
            .start_operation(&self.service, operation, input, options)
            .await
    }

    /// Start an operation and wait for its result: a sync completion
    /// returns immediately, an async one is followed by a get-result long
    /// poll bounded by `options.wait` (or the caller deadline when no wait
    /// is given).
    pub async fn execute_operation<I: IntoPayload>(
        &self,
        operation: &str,
        input: I,
        options: ExecuteOperationOptions,
    ) -> Result<LazyValue, Error> {
        let deadline = options.start.deadline;
        let result = self
            .start_operation(operation, input, options.start)
            .await?;
        match result {
            StartOperationResult::Sync(value) => Ok(value),
            StartOperationResult::Async(handle) => {
                let wait = match options.wait {
                    Some(wait) if wait > Duration::ZERO => wait,
                    // No explicit wait: poll as long as the deadline (and
                    // the per-iteration cap) allows.
                    _ => Duration::MAX,
                };
                handle
                    .get_result(GetOperationResultOptions {
                        wait: Some(wait),
                        header: Default::default(),
                        deadline,
                    })
                    .await
            }
        }
    }

    /// A handle to a known async operation. No network round trip; fails
    /// only on empty names.
    pub fn operation_handle<'a>(
        &'a self,
        operation: &str,
        token: &str,
    ) -> Result<OperationHandle<'a>, TransportError> {
        self.transport
            .operation_handle(&self.service, operation, token)
    }
}
