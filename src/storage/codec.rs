//! Value encoding for everything the engine stores
//!
//! JSON keeps stored values readable when inspecting a store by hand.
//! Encoding is deterministic for the types used here, so equal values
//! always produce equal bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors produced while encoding or decoding stored values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("malformed stored value: {0}")]
    Decode(String),
}

/// Serialize a value for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Deserialize an optional stored value
pub fn decode_opt<T: DeserializeOwned>(bytes: Option<&[u8]>) -> Result<Option<T>, CodecError> {
    bytes.map(decode::<T>).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<u64, _> = decode(b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_opt_absent() {
        let result: Option<u64> = decode_opt(None).unwrap();
        assert_eq!(result, None);
        let result: Option<u64> = decode_opt(Some(b"42".as_slice())).unwrap();
        assert_eq!(result, Some(42));
    }
}
