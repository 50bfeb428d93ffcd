//! Client-side reference to a started async operation.

use nexus_core::{error::Error, types::OperationInfo};

use crate::{
    client::{
        CancelOperationOptions, GetOperationInfoOptions,
        GetOperationResultOptions, Transport,
    },
    lazy::LazyValue,
};

/// References an async operation by `(service, operation, token)`.
///
/// Holds a non-owning borrow of the [`Transport`]; handles are cheap and
/// need no cleanup. Obtain one from a pending start result or mint one
/// from a stored token with [`Transport::operation_handle`].
pub struct OperationHandle<'a> {
    transport: &'a Transport,
    service: String,
    operation: String,
    token: String,
}

impl std::fmt::Debug for OperationHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("service", &self.service)
            .field("operation", &self.operation)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl<'a> OperationHandle<'a> {
    pub(crate) fn new(
        transport: &'a Transport,
        service: &str,
        operation: &str,
        token: &str,
    ) -> Self {
        Self {
            transport,
            service: service.to_owned(),
            operation: operation.to_owned(),
            token: token.to_owned(),
        }
    }

    /// The operation name this handle references.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The handler-minted token. Persist this to reconstruct the handle
    /// later.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Fetch the operation's status record.
    pub async fn get_info(
        &self,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, Error> {
        self.transport
            .get_operation_info(
                &self.service,
                &self.operation,
                &self.token,
                options,
            )
            .await
    }

    /// Fetch the operation result, long-polling per the options. Returns
    /// [`Error::OperationStillRunning`] when it has not completed within
    /// the requested wait.
    pub async fn get_result(
        &self,
        options: GetOperationResultOptions,
    ) -> Result<LazyValue, Error> {
        self.transport
            .get_operation_result(
                &self.service,
                &self.operation,
                &self.token,
                options,
            )
            .await
    }

    /// Request cancelation. Success means the request was accepted, not
    /// that the operation already stopped.
    pub async fn cancel(
        &self,
        options: CancelOperationOptions,
    ) -> Result<(), Error> {
        self.transport
            .cancel_operation(
                &self.service,
                &self.operation,
                &self.token,
                options,
            )
            .await
    }
}
