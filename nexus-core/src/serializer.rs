//! Pluggable payload serializers and the default chain.
//!
//! A [`Serializer`] frames a [`Payload`] into wire [`Content`] and back.
//! The default chain tries nil, byte-slice, then JSON on serialization, and
//! the same set in reverse on deserialization so the most specific framing
//! wins. A serializer signals "not mine" with the dedicated incompatible
//! error, which makes the chain move on; any other error aborts the whole
//! conversion.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    content::{self, Content},
    payload::Payload,
};

/// Error (de)serializing a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Sentinel: this serializer does not handle the given value/content.
    /// A chain keeps trying its remaining serializers; all other errors
    /// abort.
    #[error("serializer incompatible with content")]
    Incompatible,

    /// JSON (de)serialization failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other conversion failure.
    #[error("{0}")]
    Message(String),
}

impl CodecError {
    /// The sentinel that lets a chain continue to the next serializer.
    pub fn incompatible() -> Self {
        Self::Incompatible
    }

    /// An aborting conversion failure with the given message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Whether this is the chain-continue sentinel.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Incompatible)
    }
}

/// Frames payload values into wire content and back.
///
/// Implementations are stateless and may be shared across tasks.
pub trait Serializer: Send + Sync {
    /// Frame a payload into wire content, or return the incompatible
    /// sentinel if this serializer doesn't handle it.
    fn serialize(&self, payload: &Payload) -> Result<Content, CodecError>;

    /// Recover a payload from wire content, or return the incompatible
    /// sentinel if this serializer doesn't recognize it.
    fn deserialize(&self, content: &Content) -> Result<Payload, CodecError>;
}

/// Matches empty payloads/content and produces both.
pub struct NilSerializer;

impl Serializer for NilSerializer {
    fn serialize(&self, payload: &Payload) -> Result<Content, CodecError> {
        match payload {
            Payload::Empty => Ok(Content::empty()),
            _ => Err(CodecError::incompatible()),
        }
    }

    fn deserialize(&self, content: &Content) -> Result<Payload, CodecError> {
        if content.data.is_empty() {
            Ok(Payload::Empty)
        } else {
            Err(CodecError::incompatible())
        }
    }
}

/// Frames byte blobs as `application/octet-stream`.
pub struct ByteSliceSerializer;

impl Serializer for ByteSliceSerializer {
    fn serialize(&self, payload: &Payload) -> Result<Content, CodecError> {
        match payload {
            Payload::Bytes(bytes) => Ok(Content::with_media_type(
                content::MEDIA_TYPE_OCTET_STREAM,
                bytes.clone(),
            )),
            _ => Err(CodecError::incompatible()),
        }
    }

    fn deserialize(&self, content: &Content) -> Result<Payload, CodecError> {
        match content.media_type() {
            Some(content::MEDIA_TYPE_OCTET_STREAM) =>
                Ok(Payload::Bytes(content.data.clone())),
            _ => Err(CodecError::incompatible()),
        }
    }
}

/// Frames structured values as `application/json`. The most permissive of
/// the defaults, so it sits last in the chain.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, payload: &Payload) -> Result<Content, CodecError> {
        match payload {
            Payload::Json(value) => {
                let data = serde_json::to_vec(value)?;
                Ok(Content::with_media_type(content::MEDIA_TYPE_JSON, data))
            }
            _ => Err(CodecError::incompatible()),
        }
    }

    fn deserialize(&self, content: &Content) -> Result<Payload, CodecError> {
        match content.media_type() {
            Some(content::MEDIA_TYPE_JSON) =>
                Ok(Payload::Json(serde_json::from_slice(&content.data)?)),
            _ => Err(CodecError::incompatible()),
        }
    }
}

/// An ordered set of serializers tried in sequence.
///
/// Serialization walks the chain front to back; deserialization walks it
/// back to front so specific framings are tried before permissive ones.
/// Extend the default chain by appending custom serializers with
/// [`SerializerChain::with`].
#[derive(Clone)]
pub struct SerializerChain {
    serializers: Vec<Arc<dyn Serializer>>,
}

impl SerializerChain {
    /// A chain with no serializers. Useful only as a base for [`with`].
    ///
    /// [`with`]: SerializerChain::with
    pub fn empty() -> Self {
        Self {
            serializers: Vec::new(),
        }
    }

    /// Append a serializer. It becomes the last tried on serialization and
    /// the first tried on deserialization.
    pub fn with(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.push(serializer);
        self
    }
}

impl Default for SerializerChain {
    /// The default nil / byte-slice / JSON chain.
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(NilSerializer))
            .with(Arc::new(ByteSliceSerializer))
            .with(Arc::new(JsonSerializer))
    }
}

impl Serializer for SerializerChain {
    fn serialize(&self, payload: &Payload) -> Result<Content, CodecError> {
        for serializer in &self.serializers {
            match serializer.serialize(payload) {
                Ok(content) => return Ok(content),
                Err(err) if err.is_incompatible() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(CodecError::incompatible())
    }

    fn deserialize(&self, content: &Content) -> Result<Payload, CodecError> {
        for serializer in self.serializers.iter().rev() {
            match serializer.deserialize(content) {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_incompatible() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(CodecError::incompatible())
    }
}
