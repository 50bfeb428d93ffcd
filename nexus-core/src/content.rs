//! The `Content` payload frame.
//!
//! A `Content` couples raw payload bytes with a small header mapping.
//! Inside the structure the keys are lowercase and carry no `content-`
//! prefix (`type`, `length`); on the wire they map to the canonical
//! `Content-Type`/`Content-Length` headers. Keeping payload headers with
//! the payload (and out of the protocol header maps) is what lets the
//! runtimes copy protocol headers around without dragging body metadata
//! along.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::protocol::CONTENT_HEADER_PREFIX;

/// Lowercase header mapping describing a payload. Keys are stored without
/// the `content-` prefix.
pub type ContentHeader = BTreeMap<String, String>;

/// Key of the header entry naming the payload format.
pub const HEADER_TYPE: &str = "type";

/// Key of the header entry carrying the payload length in bytes.
pub const HEADER_LENGTH: &str = "length";

/// Media type emitted by the JSON serializer.
pub const MEDIA_TYPE_JSON: &str = "application/json";

/// Media type emitted by the byte-slice serializer.
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// A framed payload: bytes plus their describing header.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Content {
    /// Payload metadata, lowercase keys without the `content-` prefix.
    pub header: ContentHeader,
    /// The payload bytes. `Content` owns its buffer.
    pub data: Bytes,
}

impl Content {
    /// An empty payload with no header entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A payload of `data` tagged with the given media type.
    pub fn with_media_type(media_type: &str, data: impl Into<Bytes>) -> Self {
        let mut header = ContentHeader::new();
        header.insert(HEADER_TYPE.to_owned(), media_type.to_owned());
        Self {
            header,
            data: data.into(),
        }
    }

    /// The payload media type, with any parameters (`; charset=...`)
    /// stripped.
    pub fn media_type(&self) -> Option<&str> {
        let value = self.header.get(HEADER_TYPE)?;
        let media_type = match value.split_once(';') {
            Some((media_type, _params)) => media_type,
            None => value,
        };
        Some(media_type.trim())
    }

    /// Rebuild a `Content` from wire headers plus the already-read body.
    pub fn from_http(headers: &HeaderMap, data: Bytes) -> Self {
        Self {
            header: header_from_http(headers),
            data,
        }
    }

    /// Write this payload's headers into a wire header map, prefixed and
    /// canonicalized. `length` is always emitted from the actual byte
    /// count, overriding any stale entry.
    pub fn apply_to_http(&self, headers: &mut HeaderMap) {
        for (key, value) in &self.header {
            if key == HEADER_LENGTH {
                continue;
            }
            let name = format!("{CONTENT_HEADER_PREFIX}{key}");
            let Ok(name) = HeaderName::try_from(name) else {
                warn!("Skipping invalid content header key {key:?}");
                continue;
            };
            let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                warn!("Skipping invalid content header value for {key:?}");
                continue;
            };
            headers.insert(name, value);
        }
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from(self.data.len()),
        );
    }

    /// Remove every `Content-*` entry from a wire header map. Used when
    /// copying request/response headers into protocol options so payload
    /// metadata stays with the payload.
    pub fn strip_from_http(headers: &mut HeaderMap) {
        let content_names = headers
            .keys()
            .filter(|name| crate::protocol::is_content_header(name))
            .cloned()
            .collect::<Vec<_>>();
        for name in content_names {
            headers.remove(name);
        }
    }
}

/// Collect every `Content-*` header into a [`ContentHeader`], stripping
/// the prefix and lowercasing the key. Values that aren't valid UTF-8 are
/// dropped with a warning; the protocol only ever emits UTF-8 values.
pub fn header_from_http(headers: &HeaderMap) -> ContentHeader {
    let mut header = ContentHeader::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(CONTENT_HEADER_PREFIX)
        else {
            continue;
        };
        match value.to_str() {
            Ok(value) => {
                header.insert(key.to_owned(), value.to_owned());
            }
            Err(_) => warn!("Dropping non-UTF-8 content header {name}"),
        }
    }
    header
}
