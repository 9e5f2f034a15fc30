//! Directory listing
//!
//! Listings are rebuilt from filesystem metadata on every call. Hidden
//! entries are never shown, directories sort before files, and names compare
//! case-insensitively. Modification times are rendered in the serving host's
//! local timezone using the configured strftime pattern.

use std::cmp::Ordering;
use std::time::SystemTime;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use serde::Serialize;

use super::paths::{ConfinedPath, Root};

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    /// Root-relative path usable in follow-up requests.
    pub relative_path: String,
    pub kind: EntryKind,
    /// Exact byte length; `None` for directories.
    pub size: Option<u64>,
    pub modified_at: Option<String>,
}

impl DirectoryEntry {
    /// The synthetic `..` entry pointing at the containing directory.
    fn parent(relative_path: String) -> Self {
        Self {
            name: "..".to_string(),
            relative_path,
            kind: EntryKind::Directory,
            size: None,
            modified_at: None,
        }
    }

    fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Result of listing one directory.
#[derive(Debug, Clone)]
pub struct Listing {
    /// Echo of the requested folder, root-relative.
    pub folder: String,
    pub entries: Vec<DirectoryEntry>,
    /// Set when the directory could not be read; `entries` is then empty.
    pub failure: Option<String>,
}

impl Listing {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryLister {
    root: Root,
    date_format: String,
}

impl DirectoryLister {
    pub fn new(root: Root, date_format: impl Into<String>) -> Self {
        Self {
            root,
            date_format: date_format.into(),
        }
    }

    /// List a confined directory. Never fails: an unreadable or missing
    /// directory yields a failed `Listing` the caller can render as is.
    pub async fn list(&self, dir: &ConfinedPath) -> Listing {
        let folder = dir.relative().to_string();

        match self.read_entries(dir).await {
            Ok(mut children) => {
                sort_entries(&mut children);
                let mut entries = Vec::with_capacity(children.len() + 1);
                if let Some(parent) = dir.parent_relative() {
                    entries.push(DirectoryEntry::parent(parent));
                }
                entries.extend(children);
                tracing::debug!(folder = %folder, count = entries.len(), "listed directory");
                Listing {
                    folder,
                    entries,
                    failure: None,
                }
            }
            Err(e) => {
                tracing::debug!(folder = %folder, error = %e, "failed to list directory");
                Listing {
                    folder,
                    entries: Vec::new(),
                    failure: Some(e.to_string()),
                }
            }
        }
    }

    async fn read_entries(&self, dir: &ConfinedPath) -> std::io::Result<Vec<DirectoryEntry>> {
        let mut read_dir = tokio::fs::read_dir(dir.absolute()).await?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            // Follows symlinks; broken links are skipped.
            let path = entry.path();
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(name = %name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };

            entries.push(DirectoryEntry {
                relative_path: self.root.trim_to_relative(&path),
                name,
                kind,
                size: (kind == EntryKind::File).then(|| metadata.len()),
                modified_at: metadata
                    .modified()
                    .ok()
                    .map(|t| format_modified(t, &self.date_format)),
            });
        }

        Ok(entries)
    }
}

/// Directories first, then case-insensitive name; raw name breaks ties so the
/// order is fully deterministic.
pub fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
    });
}

pub fn format_modified(time: SystemTime, pattern: &str) -> String {
    DateTime::<Local>::from(time).format(pattern).to_string()
}

/// Reject strftime patterns chrono cannot render; formatting one would panic.
pub fn validate_date_format(pattern: &str) -> Result<(), String> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid date format: {pattern}"));
    }
    Ok(())
}
