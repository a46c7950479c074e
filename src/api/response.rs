//! Response envelope returned by every remote call.
//!
//! All calls answer with a JSON object carrying a numeric `result` (0 on
//! success) next to call-specific fields. The typed accessors here turn a
//! missing or mistyped field into [`ApiError::MissingField`] so handlers
//! never poke at raw JSON.

use serde::Deserialize;
use serde_json::Value;

use super::ApiError;

/// Entity metadata embedded in creation responses.
///
/// `uploadfile` wraps it in a one-element array; [`ApiResponse::metadata`]
/// unwraps either shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    /// Remote folder id (folder creation).
    #[serde(default)]
    pub folderid: Option<u64>,
    /// Remote file id (file creation).
    #[serde(default)]
    pub fileid: Option<u64>,
    /// Content hash of the stored file.
    #[serde(default)]
    pub hash: Option<u64>,
    /// Entity name.
    #[serde(default)]
    pub name: Option<String>,
    /// Parent folder id.
    #[serde(default)]
    pub parentfolderid: Option<u64>,
    /// File size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

/// One parsed response envelope.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    call: &'static str,
    raw: Value,
}

impl ApiResponse {
    /// Wraps the raw JSON value of a response to `call`.
    #[must_use]
    pub fn new(call: &'static str, raw: Value) -> Self {
        Self { call, raw }
    }

    /// The call this response answers.
    #[must_use]
    pub fn call(&self) -> &'static str {
        self.call
    }

    /// The numeric result code; 0 means success.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::MissingField`] if the envelope lacks `result`.
    pub fn result(&self) -> Result<u64, ApiError> {
        self.uint("result")
    }

    /// Reads a top-level unsigned integer field.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::MissingField`] if absent or not an integer.
    pub fn uint(&self, field: &'static str) -> Result<u64, ApiError> {
        self.raw
            .get(field)
            .and_then(Value::as_u64)
            .ok_or(ApiError::MissingField {
                call: self.call,
                field,
            })
    }

    /// Reads a top-level string field.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::MissingField`] if absent or not a string.
    pub fn str_field(&self, field: &'static str) -> Result<&str, ApiError> {
        self.raw
            .get(field)
            .and_then(Value::as_str)
            .ok_or(ApiError::MissingField {
                call: self.call,
                field,
            })
    }

    /// Reads the `metadata` object (or the first element when the call
    /// returns an array of them).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::MissingField`] if absent or malformed.
    pub fn metadata(&self) -> Result<Metadata, ApiError> {
        let missing = || ApiError::MissingField {
            call: self.call,
            field: "metadata",
        };
        let value = self.raw.get("metadata").ok_or_else(missing)?;
        let value = match value {
            Value::Array(items) => items.first().ok_or_else(missing)?,
            other => other,
        };
        serde_json::from_value(value.clone()).map_err(|_| missing())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_ok() {
        let resp = ApiResponse::new("deletefolder", json!({"result": 0}));
        assert_eq!(resp.result().unwrap(), 0);
    }

    #[test]
    fn test_result_missing() {
        let resp = ApiResponse::new("deletefolder", json!({}));
        let err = resp.result().unwrap_err();
        assert!(err.to_string().contains("result"));
        assert!(err.to_string().contains("deletefolder"));
    }

    #[test]
    fn test_uint_and_str_fields() {
        let resp = ApiResponse::new(
            "upload_info",
            json!({"result": 0, "size": 1024, "checksum": "abcd"}),
        );
        assert_eq!(resp.uint("size").unwrap(), 1024);
        assert_eq!(resp.str_field("checksum").unwrap(), "abcd");
        assert!(resp.uint("checksum").is_err());
        assert!(resp.str_field("size").is_err());
    }

    #[test]
    fn test_metadata_object() {
        let resp = ApiResponse::new(
            "createfolderifnotexists",
            json!({"result": 0, "metadata": {"folderid": 100, "name": "docs"}}),
        );
        let meta = resp.metadata().unwrap();
        assert_eq!(meta.folderid, Some(100));
        assert_eq!(meta.name.as_deref(), Some("docs"));
        assert_eq!(meta.fileid, None);
    }

    #[test]
    fn test_metadata_array_takes_first() {
        let resp = ApiResponse::new(
            "uploadfile",
            json!({"result": 0, "metadata": [{"fileid": 7, "hash": 99, "size": 12}]}),
        );
        let meta = resp.metadata().unwrap();
        assert_eq!(meta.fileid, Some(7));
        assert_eq!(meta.hash, Some(99));
        assert_eq!(meta.size, Some(12));
    }

    #[test]
    fn test_metadata_empty_array_is_missing() {
        let resp = ApiResponse::new("uploadfile", json!({"result": 0, "metadata": []}));
        assert!(resp.metadata().is_err());
    }
}
