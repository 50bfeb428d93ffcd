//! Type-erased payload values.
//!
//! Operation inputs and outputs cross the serializer chain as a [`Payload`]:
//! either nothing, an opaque byte blob, or a structured JSON tree. The
//! [`IntoPayload`]/[`FromPayload`] traits are the typed boundary; the
//! dispatcher and transport only ever see `Payload`s, while user-facing
//! generics pick the conversion statically. Byte slices select the
//! octet-stream framing and everything else goes through [`Json`], the same
//! duality axum exposes with its `Bytes` vs `Json<T>` body types.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::serializer::CodecError;

/// A value crossing the serializer boundary, erased down to what the wire
/// can distinguish.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// No payload at all.
    Empty,
    /// An opaque byte blob (`application/octet-stream`).
    Bytes(Bytes),
    /// A structured value (`application/json` by default).
    Json(serde_json::Value),
}

impl Payload {
    /// Whether there is nothing here.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Conversion of a typed value into a [`Payload`].
pub trait IntoPayload {
    /// Erase `self` into a [`Payload`].
    fn into_payload(self) -> Result<Payload, CodecError>;
}

/// Materialization of a typed value from a [`Payload`].
pub trait FromPayload: Sized {
    /// Rebuild `Self` from a [`Payload`].
    fn from_payload(payload: Payload) -> Result<Self, CodecError>;
}

/// Wrapper selecting JSON framing for any serde-compatible type.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoPayload for Json<T> {
    fn into_payload(self) -> Result<Payload, CodecError> {
        Ok(Payload::Json(serde_json::to_value(self.0)?))
    }
}

impl<T: DeserializeOwned> FromPayload for Json<T> {
    fn from_payload(payload: Payload) -> Result<Self, CodecError> {
        let value = match payload {
            // Empty content deserializes like JSON `null` so optional
            // outputs zero-initialize.
            Payload::Empty => serde_json::Value::Null,
            Payload::Json(value) => value,
            Payload::Bytes(_) => return Err(CodecError::incompatible()),
        };
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl IntoPayload for () {
    fn into_payload(self) -> Result<Payload, CodecError> {
        Ok(Payload::Empty)
    }
}

impl FromPayload for () {
    fn from_payload(payload: Payload) -> Result<Self, CodecError> {
        match payload {
            Payload::Empty | Payload::Json(serde_json::Value::Null) => Ok(()),
            Payload::Bytes(_) | Payload::Json(_) =>
                Err(CodecError::message("expected an empty payload")),
        }
    }
}

impl IntoPayload for Bytes {
    fn into_payload(self) -> Result<Payload, CodecError> {
        Ok(Payload::Bytes(self))
    }
}

impl FromPayload for Bytes {
    fn from_payload(payload: Payload) -> Result<Self, CodecError> {
        match payload {
            Payload::Empty => Ok(Bytes::new()),
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Json(_) =>
                Err(CodecError::message("expected a byte payload")),
        }
    }
}

impl IntoPayload for Vec<u8> {
    fn into_payload(self) -> Result<Payload, CodecError> {
        Ok(Payload::Bytes(Bytes::from(self)))
    }
}

impl FromPayload for Vec<u8> {
    fn from_payload(payload: Payload) -> Result<Self, CodecError> {
        Bytes::from_payload(payload).map(|bytes| bytes.to_vec())
    }
}

impl IntoPayload for String {
    fn into_payload(self) -> Result<Payload, CodecError> {
        Ok(Payload::Json(serde_json::Value::String(self)))
    }
}

impl FromPayload for String {
    fn from_payload(payload: Payload) -> Result<Self, CodecError> {
        match payload {
            Payload::Empty => Ok(String::new()),
            Payload::Json(serde_json::Value::String(s)) => Ok(s),
            _ => Err(CodecError::message("expected a JSON string payload")),
        }
    }
}

impl IntoPayload for serde_json::Value {
    fn into_payload(self) -> Result<Payload, CodecError> {
        Ok(Payload::Json(self))
    }
}

impl FromPayload for serde_json::Value {
    fn from_payload(payload: Payload) -> Result<Self, CodecError> {
        match payload {
            Payload::Empty => Ok(serde_json::Value::Null),
            Payload::Json(value) => Ok(value),
            Payload::Bytes(_) =>
                Err(CodecError::message("expected a JSON payload")),
        }
    }
}
