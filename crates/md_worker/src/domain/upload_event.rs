use crate::domain::CodecError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// "File uploaded" notification published by the upload service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    /// Name the user uploaded the file under, untrusted
    pub original_name: String,
    /// Name the upload service stored the file under
    pub stored_name: String,
    /// Path on the uploader's side, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_path: Option<String>,
    /// Size advertised by the uploader
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

impl UploadEvent {
    /// Structural decode only, field values are not validated here
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Post title, the original name without surrounding whitespace
    pub fn title(&self) -> &str {
        self.original_name.trim()
    }
}
