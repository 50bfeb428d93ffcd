//! Core Nexus RPC protocol types and codecs.
//!
//! This crate holds everything two Nexus peers must agree on: header and
//! query-parameter names, status-code semantics, the `Content` payload frame
//! and the serializer chain, the structured `Failure` wire record with its
//! error taxonomy, `Link` references, and the strict wire duration format.
//!
//! The HTTP client and handler runtimes live in the `nexus-sdk` crate.

/// `Content`: a framed payload and its lowercase header mapping.
pub mod content;
/// Strict wire duration format (`250ms`, `1.5s`, `2m`).
pub mod duration;
/// The protocol error taxonomy and its HTTP status mapping.
pub mod error;
/// The `Failure` wire record and failure/error conversion.
pub mod failure;
/// `Link`: caller/handler cross-references carried in `Link` headers.
pub mod link;
/// Type-erased payload values and their typed conversions.
pub mod payload;
/// Protocol constants: header names, query parameters, statuses.
pub mod protocol;
/// Pluggable serializers and the default nil/bytes/JSON chain.
pub mod serializer;
/// Operation states, tokens and info records.
pub mod types;

/// Axum impls (`IntoResponse` for error types) for handler runtimes.
#[cfg(feature = "axum")]
pub mod axum_helpers;
