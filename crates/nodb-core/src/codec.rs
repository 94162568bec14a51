//! JSON encoding of whole documents
//!
//! A document on disk is a single JSON object. Anything else, including
//! valid JSON with a different top-level type, is rejected on decode.

use std::path::Path;

use serde_json::{Map, Value};

use crate::storage::error::{Error, Result};

/// The in-memory form of a whole document
pub type Object = Map<String, Value>;

/// Serialize a document to bytes
pub fn encode(object: &Object) -> Vec<u8> {
    // Serializing a Map<String, Value> cannot fail
    serde_json::to_vec(object).unwrap_or_default()
}

/// Parse a document from bytes read from `path`
pub fn decode(bytes: &[u8], path: &Path) -> Result<Object> {
    let value: Value = serde_json::from_slice(bytes).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    match value {
        Value::Object(object) => Ok(object),
        other => Err(Error::InvalidFormat {
            path: path.to_path_buf(),
            details: format!("expected a JSON object at the top level, found {}", kind(&other)),
        }),
    }
}

/// Human readable name of a value's JSON type
pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let value = json!({
            "table1": {"one": 3, "two": {"three": 4}},
            "list": [1, "two", null, true, 2.5],
            "empty": {}
        });
        let object = value.as_object().unwrap().clone();

        let decoded = decode(&encode(&object), Path::new("t.json")).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(encode(&Object::new()), b"{}");
        assert!(decode(b"{}", Path::new("t.json")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_input() {
        let err = decode(b"{\"a\": ", Path::new("broken.json")).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_non_object_root() {
        let err = decode(b"[1, 2]", Path::new("list.json")).unwrap_err();
        match err {
            Error::InvalidFormat { details, .. } => assert!(details.contains("an array")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
