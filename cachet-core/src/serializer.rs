//! Payload codecs.
//!
//! The default [`JsonSerializer`] is lossless for any type whose serde
//! representation survives JSON: decoding is driven by the target type, so
//! timestamps, integer-keyed maps and enums come back as they went in.
//! Types that serialize to non-JSON shapes (raw bytes as sequences, `f64`
//! NaN/infinity) need a custom [`Serializer`].

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CachetResult, SerializationError};

/// Converts values to and from their stored byte representation.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> CachetResult<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CachetResult<T>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> CachetResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            SerializationError::Encode {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CachetResult<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            SerializationError::Decode {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
