//! Shared types for REST API
//!
//! Request bodies and the `{status, message, data?}` envelope every JSON
//! endpoint answers with.

use serde::{Deserialize, Serialize};

use crate::storage::{DirectoryEntry, EntryKind};

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            data,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "failed",
            message: message.into(),
            data: None,
        }
    }
}

// ============================================================================
// FILE REQUESTS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub dirname: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub dirname: String,
    #[serde(default)]
    pub filename: String,
}

// ============================================================================
// FILE RESPONSES
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_time: Option<String>,
}

impl From<DirectoryEntry> for FileInfo {
    fn from(entry: DirectoryEntry) -> Self {
        Self {
            name: entry.name,
            path: entry.relative_path,
            kind: entry.kind,
            size: entry.size,
            upload_time: entry.modified_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListingData {
    pub folder: String,
    pub files: Vec<FileInfo>,
}

// ============================================================================
// TEXT PAD
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddTextRequest {
    #[serde(default)]
    pub text: String,
}
