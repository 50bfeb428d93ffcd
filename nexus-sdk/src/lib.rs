//! Nexus RPC client transport and handler runtime.
//!
//! The caller side: [`client::Transport`] binds the four protocol verbs to
//! HTTP, [`service_client::ServiceClient`] pins a service name over it, and
//! [`handle::OperationHandle`] references a started async operation.
//!
//! The handler side: typed operations register into a
//! [`registry::ServiceRegistry`], which builds the [`handler::Handler`]
//! that [`server::router`] serves over axum. Server-initiated completions
//! travel through [`completion`] in both directions.

/// Client-side protocol binding: the four verbs plus the long-poll loop.
pub mod client;
/// Completion delivery (client side) and the caller's completion handler.
pub mod completion;
/// Client-side reference to a started async operation.
pub mod handle;
/// Server-side handler contract, request options and context records.
pub mod handler;
/// Single-consumption wrapper over a streaming payload.
pub mod lazy;
/// Typed operations, services, the registry and its middleware chain.
pub mod registry;
/// The axum-based handler runtime.
pub mod server;
/// User-facing client pinned to one service.
pub mod service_client;
