//! Value Encoding
//!
//! L3 stores values as serde_json bytes. The encoded length doubles as the
//! L1 size estimate, so a value is encoded exactly once per store.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Anything the cache can hold: shareable across tasks and encodable for L3
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Encode a value into its L3 payload
pub fn encode<V: CacheValue>(value: &V) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode an L3 payload
pub fn decode<V: CacheValue>(data: &[u8]) -> Result<V> {
    Ok(serde_json::from_slice(data)?)
}

/// Size estimate for values that could not be encoded
pub fn fallback_size<V>(value: &V) -> usize {
    std::mem::size_of_val(value)
}
