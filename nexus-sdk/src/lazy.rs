//! `LazyValue`: a deferred-decode handle over a streaming payload.
//!
//! A `LazyValue` exclusively owns its underlying body until consumed.
//! Consumption takes `self`, so the exactly-once invariant is enforced by
//! the type system rather than a runtime flag: there is no way to decode
//! the same body twice.

use std::sync::Arc;

use bytes::Bytes;
use nexus_core::{
    content::{Content, ContentHeader},
    error::{Error, TransportError},
    payload::FromPayload,
    serializer::Serializer,
};

/// The sources a payload body can stream from.
enum Body {
    /// Already buffered in memory.
    Full(Bytes),
    /// A client-side HTTP response body.
    Response(reqwest::Response),
    /// A server-side HTTP request body.
    Request(axum::body::Body),
}

/// A deferred-decode, single-consumption handle over a payload body.
pub struct LazyValue {
    serializer: Arc<dyn Serializer>,
    header: ContentHeader,
    body: Body,
}

impl std::fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            Body::Full(data) => format!("full({} bytes)", data.len()),
            Body::Response(_) => "response".to_owned(),
            Body::Request(_) => "request".to_owned(),
        };
        f.debug_struct("LazyValue")
            .field("header", &self.header)
            .field("body", &body)
            .finish()
    }
}

impl LazyValue {
    /// Wrap an in-memory [`Content`].
    pub fn from_content(
        serializer: Arc<dyn Serializer>,
        content: Content,
    ) -> Self {
        Self {
            serializer,
            header: content.header,
            body: Body::Full(content.data),
        }
    }

    /// Wrap a client-side response whose body has not been read yet.
    pub(crate) fn from_response(
        serializer: Arc<dyn Serializer>,
        response: reqwest::Response,
    ) -> Self {
        let header = nexus_core::content::header_from_http(response.headers());
        Self {
            serializer,
            header,
            body: Body::Response(response),
        }
    }

    /// Wrap a server-side request body that has not been read yet.
    pub(crate) fn from_request_body(
        serializer: Arc<dyn Serializer>,
        header: ContentHeader,
        body: axum::body::Body,
    ) -> Self {
        Self {
            serializer,
            header,
            body: Body::Request(body),
        }
    }

    /// The payload header, available before the body is read.
    pub fn header(&self) -> &ContentHeader {
        &self.header
    }

    /// Read the full body and decode it into `T` through the configured
    /// serializer.
    pub async fn consume<T: FromPayload>(self) -> Result<T, Error> {
        let serializer = self.serializer.clone();
        let content = self.into_content().await?;
        let payload = serializer.deserialize(&content).map_err(|err| {
            TransportError::protocol(format!(
                "failed to deserialize content: {err}"
            ))
        })?;
        let value = T::from_payload(payload).map_err(|err| {
            TransportError::protocol(format!(
                "failed to convert payload: {err}"
            ))
        })?;
        Ok(value)
    }

    /// The manual consumption path: read the full body into a [`Content`]
    /// without decoding it.
    pub async fn into_content(self) -> Result<Content, Error> {
        let data = match self.body {
            Body::Full(data) => data,
            Body::Response(response) =>
                response.bytes().await.map_err(|err| {
                    TransportError::protocol(format!(
                        "failed to read response body: {err}"
                    ))
                })?,
            Body::Request(body) => axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|err| {
                    TransportError::protocol(format!(
                        "failed to read request body: {err}"
                    ))
                })?,
        };
        Ok(Content {
            header: self.header,
            data,
        })
    }
}
