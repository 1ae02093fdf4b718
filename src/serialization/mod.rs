//! Value serialization for the remote tier.
//!
//! The local tier stores values as-is; only the remote tier sees bytes.
//! A [`Serializer`] turns a value into bytes and back, and [`ValueCodec`]
//! wraps it with a one-byte frame header that carries compression and the
//! cached-null marker.

mod codec;

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use codec::{Payload, ValueCodec};

/// Error produced while encoding or decoding a cached value.
///
/// Kept apart from cache misses: a value that cannot be decoded is
/// reported, never treated as absent.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("failed to encode value as {content_type}: {message}")]
    Encode {
        content_type: &'static str,
        message: String,
    },

    #[error("failed to decode value as {content_type}: {message}")]
    Decode {
        content_type: &'static str,
        message: String,
    },

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("unknown payload header {0:#04x}")]
    UnknownHeader(u8),

    #[error("empty payload")]
    Empty,
}

/// Converts cache values to bytes and back.
pub trait Serializer<V>: Send + Sync {
    /// Serialize a value to bytes.
    fn serialize(&self, value: &V) -> Result<Vec<u8>, SerializationError>;

    /// Deserialize bytes produced by [`Serializer::serialize`].
    fn deserialize(&self, bytes: &[u8]) -> Result<V, SerializationError>;

    /// Content type identifier, used in logs and error messages.
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// JSON serialization using serde_json.
pub struct JsonSerializer<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonSerializer<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for JsonSerializer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for JsonSerializer<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for JsonSerializer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("type", &std::any::type_name::<V>())
            .finish()
    }
}

impl<V> Serializer<V> for JsonSerializer<V>
where
    V: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &V) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            content_type: "application/json",
            message: e.to_string(),
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<V, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            content_type: "application/json",
            message: e.to_string(),
        })
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        sku: String,
    }

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::<Order>::new();
        let order = Order {
            id: 7,
            sku: "A-1".into(),
        };

        let bytes = serializer.serialize(&order).unwrap();
        assert_eq!(bytes, br#"{"id":7,"sku":"A-1"}"#);
        assert_eq!(serializer.content_type(), "application/json");
    }

    #[test]
    fn test_json_decode_failure_is_reported() {
        let serializer = JsonSerializer::<Order>::new();
        let err = serializer.deserialize(b"not json").unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));
    }
}
