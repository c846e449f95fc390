//! Transfer control messages.
//!
//! Control messages travel as JSON text frames, tagged by `kind`:
//!
//! ```text
//! {"kind":"meta","name":"photo.jpg","size":40000,"mimeType":"image/jpeg"}
//! {"kind":"end"}
//! {"kind":"cancel"}
//! ```
//!
//! File bytes travel as binary frames of at most [`CHUNK_SIZE`] bytes between
//! `meta` and `end`. Any other `kind` is a protocol violation.

use crate::error::TransferError;
use serde::{Deserialize, Serialize};

/// Default chunk size (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// File metadata announced before the first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name (no directories)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

impl FileMeta {
    /// Create metadata
    #[must_use]
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }

    /// Number of chunks needed at `chunk_size`
    #[must_use]
    pub fn chunk_count(&self, chunk_size: usize) -> u64 {
        self.size.div_ceil(chunk_size.max(1) as u64)
    }
}

/// Control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Start of a file
    Meta(FileMeta),
    /// All chunks sent
    End,
    /// Sender gave up; discard the file
    Cancel,
}

impl ControlMessage {
    /// Encode as JSON
    #[must_use]
    pub fn to_json(&self) -> String {
        // Plain structs of strings and integers always serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for malformed JSON or an unknown `kind`.
    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        serde_json::from_str(text).map_err(|_| TransferError::violation("unknown control message"))
    }

    /// Message kind as sent on the wire
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Meta(_) => "meta",
            Self::End => "end",
            Self::Cancel => "cancel",
        }
    }
}
