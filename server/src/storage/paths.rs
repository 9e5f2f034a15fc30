//! Root confinement
//!
//! Every client-supplied path is resolved against the single shared root.
//! Resolution is lexical first: a `..` that would climb above the root is
//! rejected before the filesystem is consulted at all. A second pass
//! canonicalises the deepest existing ancestor so a symlink inside the root
//! cannot lead out of it.
//!
//! Paths from JSON bodies and metadata are taken literally with
//! [`Root::resolve`]. Only paths lifted from a request URI are percent-encoded;
//! those go through [`Root::resolve_encoded`].

use std::path::{Component, Path, PathBuf};

use super::error::{Result, TransferError};

/// The directory all file operations are confined to.
///
/// Held in canonical form so every derived absolute path shares its prefix.
#[derive(Debug, Clone)]
pub struct Root {
    path: PathBuf,
}

/// A path proven to be the root or a descendant of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedPath {
    absolute: PathBuf,
    /// Root-relative, `/`-separated, no leading or trailing separator.
    relative: String,
}

impl ConfinedPath {
    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// Relative path of the containing directory, `None` for the root itself.
    pub fn parent_relative(&self) -> Option<String> {
        if self.is_root() {
            return None;
        }
        Some(match self.relative.rfind('/') {
            Some(pos) => self.relative[..pos].to_string(),
            None => String::new(),
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.relative.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl Root {
    /// Create the directory if needed and pin its canonical location.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        Ok(Self {
            path: std::fs::canonicalize(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a literal client-supplied path below the root.
    pub async fn resolve(&self, input: &str) -> Result<ConfinedPath> {
        if input.contains('\0') {
            return Err(TransferError::malformed("Path contains invalid null byte"));
        }

        let segments = normalize_segments(input)
            .ok_or_else(|| TransferError::OutOfBounds(input.to_string()))?;

        let mut absolute = self.path.clone();
        for segment in &segments {
            absolute.push(segment);
        }

        self.ensure_no_escape(&absolute, input).await?;

        Ok(ConfinedPath {
            absolute,
            relative: segments.join("/"),
        })
    }

    /// Resolve a percent-encoded path taken from a request URI.
    pub async fn resolve_encoded(&self, input: &str) -> Result<ConfinedPath> {
        self.resolve(&percent_decode(input)).await
    }

    /// Resolve a single file name inside an already confined directory.
    ///
    /// The name must not contain separators.
    pub async fn child(&self, dir: &ConfinedPath, name: &str) -> Result<ConfinedPath> {
        let name = validate_file_name(name)?;
        let absolute = dir.absolute.join(name);
        self.ensure_no_escape(&absolute, name).await?;

        let relative = if dir.is_root() {
            name.to_string()
        } else {
            format!("{}/{}", dir.relative, name)
        };
        Ok(ConfinedPath { absolute, relative })
    }

    /// Strip the root prefix from an absolute path, producing the client-facing
    /// relative form. Never returns the root's own location.
    pub fn trim_to_relative(&self, absolute: &Path) -> String {
        if let Ok(rest) = absolute.strip_prefix(&self.path) {
            return rest
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/");
        }

        // Fall back to a textual comparison for paths built from a
        // non-canonical spelling of the root.
        let path = normalize_path(&absolute.to_string_lossy());
        let prefix = normalize_path(&self.path.to_string_lossy());
        match path.strip_prefix(&prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                rest.trim_start_matches('/').to_string()
            }
            _ => absolute
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Walk up to the deepest existing ancestor and make sure its real
    /// location is still below the root.
    async fn ensure_no_escape(&self, absolute: &Path, shown: &str) -> Result<()> {
        let mut current = absolute;
        loop {
            match tokio::fs::canonicalize(current).await {
                Ok(real) if real.starts_with(&self.path) => return Ok(()),
                Ok(_) => return Err(TransferError::OutOfBounds(shown.to_string())),
                Err(_) => {
                    // A dangling symlink cannot be verified and would be
                    // followed by a later create.
                    let is_link = tokio::fs::symlink_metadata(current)
                        .await
                        .map(|m| m.file_type().is_symlink())
                        .unwrap_or(false);
                    if is_link {
                        return Err(TransferError::OutOfBounds(shown.to_string()));
                    }
                }
            }
            match current.parent() {
                Some(parent) if parent.starts_with(&self.path) => current = parent,
                _ => return Ok(()),
            }
        }
    }
}

/// Collapse a client path into its segments.
///
/// Backslashes count as separators, empty and `.` segments vanish, and `..`
/// pops a segment. Returns `None` when a `..` would climb above the root.
fn normalize_segments(input: &str) -> Option<Vec<String>> {
    let unified = input.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    Some(segments.into_iter().map(str::to_owned).collect())
}

/// Textual normalisation used for display and prefix stripping: forward
/// slashes only, no repeated separators, no trailing `/` or `.`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    for c in path.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' && normalized.ends_with('/') {
            continue;
        }
        normalized.push(c);
    }
    while (normalized.ends_with('/') || normalized.ends_with('.'))
        && normalized != "/"
        && normalized != "."
    {
        normalized.pop();
    }
    normalized
}

/// Reject names that are blank or could address anything but a direct child.
pub fn validate_file_name(name: &str) -> Result<&str> {
    if name.trim().is_empty() {
        return Err(TransferError::malformed("No filename provided"));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(TransferError::malformed(format!("Invalid filename: {name}")));
    }
    Ok(name)
}

/// Decode `%XX` sequences. Invalid escapes are kept verbatim and the decoded
/// bytes are interpreted as UTF-8 (lossily).
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
