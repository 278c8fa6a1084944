use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes a value to bytes using JSON.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(CoreError::Serialization)
}

/// Deserializes bytes to a value using JSON.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the bytes cannot be deserialized.
pub fn deserialize_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(CoreError::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization() {
        let test_value = vec!["title".to_string(), "body".to_string()];
        let serialized = serialize_value(&test_value).unwrap();
        let deserialized: Vec<String> = deserialize_value(&serialized).unwrap();
        assert_eq!(test_value, deserialized);
    }

    #[test]
    fn test_deserialize_garbage_is_error() {
        let result: Result<Vec<String>> = deserialize_value(b"{not json");
        assert!(matches!(result, Err(CoreError::Deserialization(_))));
    }
}
