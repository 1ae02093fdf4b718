//! Framing of remote-tier payloads.
//!
//! ```text
//! [header: u8][body...]
//!   0x00  plain serialized value
//!   0x01  gzip-compressed serialized value
//!   0x02  zlib-compressed serialized value
//!   0x03  cached null (no body)
//! ```

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use super::{SerializationError, Serializer};
use crate::cache::{CompressionConfig, CompressionType};

const HEADER_PLAIN: u8 = 0x00;
const HEADER_GZIP: u8 = 0x01;
const HEADER_ZLIB: u8 = 0x02;
const HEADER_NULL: u8 = 0x03;

/// A decoded remote payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<V> {
    /// A real value.
    Value(V),
    /// A cached absent result (null-value caching).
    Null,
}

impl<V> Payload<V> {
    /// Convert into the optional value callers see.
    pub fn into_option(self) -> Option<V> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Null => None,
        }
    }
}

/// Serializer plus compression and null framing.
pub struct ValueCodec<V> {
    serializer: Arc<dyn Serializer<V>>,
    compression: CompressionConfig,
}

impl<V> Clone for ValueCodec<V> {
    fn clone(&self) -> Self {
        Self {
            serializer: Arc::clone(&self.serializer),
            compression: self.compression.clone(),
        }
    }
}

impl<V> ValueCodec<V> {
    pub fn new(serializer: Arc<dyn Serializer<V>>, compression: CompressionConfig) -> Self {
        Self {
            serializer,
            compression,
        }
    }

    /// Content type of the wrapped serializer.
    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    /// Encode a value, compressing it when it crosses the threshold.
    pub fn encode(&self, value: &V) -> Result<Vec<u8>, SerializationError> {
        let body = self.serializer.serialize(value)?;

        if !self.compression.enabled || body.len() < self.compression.threshold {
            return Ok(frame(HEADER_PLAIN, &body));
        }

        let mut out = Vec::with_capacity(body.len() / 2 + 1);
        out.push(match self.compression.kind {
            CompressionType::Gzip => HEADER_GZIP,
            CompressionType::Zlib => HEADER_ZLIB,
        });

        let out = match self.compression.kind {
            CompressionType::Gzip => {
                let mut encoder = GzEncoder::new(out, Compression::default());
                encoder.write_all(&body)?;
                encoder.finish()?
            }
            CompressionType::Zlib => {
                let mut encoder = ZlibEncoder::new(out, Compression::default());
                encoder.write_all(&body)?;
                encoder.finish()?
            }
        };

        Ok(out)
    }

    /// Encode the cached-null marker.
    pub fn encode_null(&self) -> Vec<u8> {
        vec![HEADER_NULL]
    }

    /// Encode an optional value; `None` becomes the null marker.
    pub fn encode_payload(&self, value: Option<&V>) -> Result<Vec<u8>, SerializationError> {
        match value {
            Some(v) => self.encode(v),
            None => Ok(self.encode_null()),
        }
    }

    /// Decode any frame produced by this codec, whatever compression the
    /// writer used.
    pub fn decode(&self, bytes: &[u8]) -> Result<Payload<V>, SerializationError> {
        let (&header, body) = bytes.split_first().ok_or(SerializationError::Empty)?;

        match header {
            HEADER_PLAIN => Ok(Payload::Value(self.serializer.deserialize(body)?)),
            HEADER_GZIP => {
                let mut raw = Vec::new();
                GzDecoder::new(body).read_to_end(&mut raw)?;
                Ok(Payload::Value(self.serializer.deserialize(&raw)?))
            }
            HEADER_ZLIB => {
                let mut raw = Vec::new();
                ZlibDecoder::new(body).read_to_end(&mut raw)?;
                Ok(Payload::Value(self.serializer.deserialize(&raw)?))
            }
            HEADER_NULL => Ok(Payload::Null),
            other => Err(SerializationError::UnknownHeader(other)),
        }
    }
}

fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(header);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonSerializer;

    fn codec(compression: CompressionConfig) -> ValueCodec<String> {
        ValueCodec::new(Arc::new(JsonSerializer::<String>::new()), compression)
    }

    #[test]
    fn test_small_values_stay_plain() {
        let codec = codec(CompressionConfig::gzip(1024));
        let bytes = codec.encode(&"short".to_string()).unwrap();
        assert_eq!(bytes[0], HEADER_PLAIN);
        assert_eq!(&bytes[1..], br#""short""#);
    }

    #[test]
    fn test_large_values_are_compressed() {
        let value = "x".repeat(4096);

        let gzip = codec(CompressionConfig::gzip(512));
        let bytes = gzip.encode(&value).unwrap();
        assert_eq!(bytes[0], HEADER_GZIP);
        assert!(bytes.len() < value.len());
        assert_eq!(gzip.decode(&bytes).unwrap(), Payload::Value(value.clone()));

        let zlib = codec(CompressionConfig::zlib(512));
        let bytes = zlib.encode(&value).unwrap();
        assert_eq!(bytes[0], HEADER_ZLIB);
        // A reader configured without compression still decodes it.
        let plain = codec(CompressionConfig::disabled());
        assert_eq!(plain.decode(&bytes).unwrap(), Payload::Value(value));
    }

    #[test]
    fn test_null_marker() {
        let codec = codec(CompressionConfig::disabled());
        let bytes = codec.encode_payload(None).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), Payload::Null);
        assert_eq!(codec.decode(&bytes).unwrap().into_option(), None);
    }

    #[test]
    fn test_corrupt_payloads_are_errors() {
        let codec = codec(CompressionConfig::disabled());
        assert!(matches!(codec.decode(&[]), Err(SerializationError::Empty)));
        assert!(matches!(
            codec.decode(&[0x7f, 1, 2]),
            Err(SerializationError::UnknownHeader(0x7f))
        ));
        assert!(matches!(
            codec.decode(&[HEADER_GZIP, 1, 2, 3]),
            Err(SerializationError::Compression(_))
        ));
        assert!(matches!(
            codec.decode(b"\x00{"),
            Err(SerializationError::Decode { .. })
        ));
    }
}
