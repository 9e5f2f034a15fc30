//! Upload intake
//!
//! Uploads arrive either as an already demultiplexed byte stream (the request
//! body is the file) or as a raw `multipart/form-data` body that is parsed
//! here with [`MultipartParser`]. Either way bytes go straight to the
//! destination file; nothing is buffered beyond the current read.
//!
//! The overwrite check in [`UploadIntake::check`] is advisory. The write
//! itself is the final authority: with overwrite disabled the destination is
//! opened with `create_new`, so a file that appeared after the check still
//! causes a conflict. Two concurrent uploads with overwrite enabled race at
//! the filesystem and the last writer wins. A transfer that fails midway
//! leaves its partial file on disk.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

use super::error::{Result, TransferError};
use super::multipart::{MultipartEvent, MultipartParser};
use super::paths::{percent_decode, validate_file_name, ConfinedPath, Root};

/// Largest accepted `metadata` form field.
const MAX_METADATA_FIELD: usize = 64 * 1024;

/// Name of the form field carrying upload metadata inside a multipart body.
const METADATA_FIELD: &str = "metadata";

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Where upload bytes come from.
pub enum ByteSource {
    /// The body is the file itself.
    Stream(ByteStream),
    /// A raw multipart body still framed by `boundary`.
    Multipart { boundary: String, body: ByteStream },
}

/// Notified synchronously after every successful upload.
pub trait FileReceivedListener: Send + Sync {
    fn on_file_received(&self, file: &Path);
}

impl<F> FileReceivedListener for F
where
    F: Fn(&Path) + Send + Sync,
{
    fn on_file_received(&self, file: &Path) {
        self(file)
    }
}

/// Target directory and name for an upload.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    #[serde(default)]
    pub dirname: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl UploadMetadata {
    /// Parse the `X-File-Metadata` header: JSON, optionally percent-encoded.
    pub fn from_header(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .or_else(|_| serde_json::from_str(&percent_decode(raw)))
            .map_err(|e| TransferError::malformed(format!("Invalid file metadata: {e}")))
    }

    fn from_field(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| TransferError::malformed(format!("Invalid metadata field: {e}")))
    }

    /// Field-wise merge where `self` wins.
    pub fn or(self, fallback: UploadMetadata) -> Self {
        Self {
            dirname: self.dirname.or(fallback.dirname),
            filename: self
                .filename
                .filter(|f| !f.trim().is_empty())
                .or(fallback.filename),
            file_size: self.file_size.or(fallback.file_size),
        }
    }
}

/// A file that was fully written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub location: ConfinedPath,
    pub size: u64,
}

#[derive(Clone)]
pub struct UploadIntake {
    root: Root,
    overwrite: bool,
    listener: Option<Arc<dyn FileReceivedListener>>,
}

enum PartSink {
    Skip,
    Metadata(Vec<u8>),
    File {
        file: File,
        target: ConfinedPath,
        written: u64,
    },
}

impl UploadIntake {
    pub fn new(root: Root, overwrite: bool) -> Self {
        Self {
            root,
            overwrite,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn FileReceivedListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Can `filename` be uploaded into `dirname`? Fails closed.
    pub async fn check(&self, dirname: &str, filename: &str) -> Result<ConfinedPath> {
        let filename = validate_file_name(filename)?;
        let dir = self.root.resolve(dirname).await?;
        let target = self.root.child(&dir, filename).await?;

        let taken = match tokio::fs::metadata(target.absolute()).await {
            Ok(meta) => meta.is_dir() || !self.overwrite,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if taken {
            tracing::info!(path = %target.relative(), "file already exists");
            return Err(TransferError::Conflict(target.relative().to_string()));
        }
        Ok(target)
    }

    /// Store one file from `source`. `metadata` (usually from the request
    /// header) takes precedence over metadata embedded in a multipart body.
    pub async fn receive(&self, metadata: UploadMetadata, source: ByteSource) -> Result<StoredFile> {
        let stored = match source {
            ByteSource::Stream(body) => {
                let target = self.target_for(&metadata, None).await?;
                tracing::info!(path = %target.relative(), "upload started");
                let mut file = self.open_target(&target).await?;
                let size = copy_stream(&mut file, body, metadata.file_size, &target).await?;
                finish_file(&mut file).await?;
                StoredFile {
                    location: target,
                    size,
                }
            }
            ByteSource::Multipart { boundary, body } => {
                self.receive_multipart(metadata, &boundary, body).await?
            }
        };

        let mime = mime_guess::from_path(stored.location.absolute()).first_or_octet_stream();
        tracing::info!(
            path = %stored.location.relative(),
            size = %format_file_size(stored.size),
            bytes = stored.size,
            mime = %mime,
            "upload completed"
        );

        if let Some(listener) = &self.listener {
            listener.on_file_received(stored.location.absolute());
        }
        Ok(stored)
    }

    async fn receive_multipart(
        &self,
        header_meta: UploadMetadata,
        boundary: &str,
        mut body: ByteStream,
    ) -> Result<StoredFile> {
        let mut parser = MultipartParser::new(boundary);
        let mut body_meta = UploadMetadata::default();
        let mut sink = PartSink::Skip;
        let mut stored: Option<StoredFile> = None;

        loop {
            while let Some(event) = parser.next_event()? {
                match event {
                    MultipartEvent::PartStart(headers) => {
                        sink = if let Some(part_filename) = headers.filename.as_deref() {
                            if stored.is_some() {
                                tracing::warn!(filename = %part_filename, "ignoring additional file part");
                                PartSink::Skip
                            } else {
                                let metadata = header_meta.clone().or(body_meta.clone());
                                let target = self.target_for(&metadata, Some(part_filename)).await?;
                                tracing::info!(
                                    path = %target.relative(),
                                    content_type = headers.content_type.as_deref().unwrap_or("-"),
                                    "upload started"
                                );
                                let file = self.open_target(&target).await?;
                                PartSink::File {
                                    file,
                                    target,
                                    written: 0,
                                }
                            }
                        } else if headers.name.as_deref() == Some(METADATA_FIELD) {
                            PartSink::Metadata(Vec::new())
                        } else {
                            PartSink::Skip
                        };
                    }
                    MultipartEvent::Data(data) => match &mut sink {
                        PartSink::Metadata(buf) => {
                            if buf.len() + data.len() > MAX_METADATA_FIELD {
                                return Err(TransferError::malformed("Metadata field too large"));
                            }
                            buf.extend_from_slice(&data);
                        }
                        PartSink::File { file, written, .. } => {
                            file.write_all(&data).await?;
                            *written += data.len() as u64;
                        }
                        PartSink::Skip => {}
                    },
                    MultipartEvent::PartEnd => match std::mem::replace(&mut sink, PartSink::Skip) {
                        PartSink::Metadata(buf) => body_meta = UploadMetadata::from_field(&buf)?,
                        PartSink::File {
                            mut file,
                            target,
                            written,
                        } => {
                            finish_file(&mut file).await?;
                            stored = Some(StoredFile {
                                location: target,
                                size: written,
                            });
                        }
                        PartSink::Skip => {}
                    },
                    MultipartEvent::Finished => {}
                }
            }

            if parser.is_finished() {
                break;
            }
            match body.next().await {
                Some(chunk) => parser.push(&chunk.map_err(TransferError::Interrupted)?),
                None => {
                    parser.finish()?;
                    break;
                }
            }
        }

        stored.ok_or_else(|| TransferError::malformed("No file part in multipart body"))
    }

    /// Resolve the destination. Metadata filename wins over the part's own
    /// `filename=` attribute.
    async fn target_for(&self, metadata: &UploadMetadata, part_filename: Option<&str>) -> Result<ConfinedPath> {
        let filename = metadata
            .filename
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .or(part_filename)
            .ok_or_else(|| TransferError::malformed("No filename provided"))?;
        let dir = self.root.resolve(metadata.dirname.as_deref().unwrap_or("")).await?;
        self.root.child(&dir, filename).await
    }

    async fn open_target(&self, target: &ConfinedPath) -> Result<File> {
        if let Some(parent) = target.absolute().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        options.open(target.absolute()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                TransferError::Conflict(target.relative().to_string())
            } else {
                TransferError::Io(e)
            }
        })
    }
}

async fn copy_stream(
    file: &mut File,
    mut body: ByteStream,
    expected: Option<u64>,
    target: &ConfinedPath,
) -> Result<u64> {
    let mut written = 0u64;
    let mut last_reported = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(TransferError::Interrupted)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if let Some(total) = expected.filter(|t| *t > 0) {
            let percent = written.saturating_mul(100) / total;
            if percent >= last_reported + 10 {
                tracing::debug!(path = %target.relative(), percent, "upload progress");
                last_reported = percent;
            }
        }
    }
    Ok(written)
}

async fn finish_file(file: &mut File) -> Result<()> {
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// `1536` -> `"1.50 KB"`.
pub fn format_file_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size == 0 {
        return "0 B".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::multipart::test_support::{build_body, TestPart};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const BOUNDARY: &str = "XyZboundary42";

    fn intake(overwrite: bool) -> (tempfile::TempDir, UploadIntake) {
        let temp = tempdir().unwrap();
        let root = Root::open(temp.path()).unwrap();
        (temp, UploadIntake::new(root, overwrite))
    }

    fn stream_of(data: &[u8], chunk_size: usize) -> ByteStream {
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(tokio_stream::iter(chunks))
    }

    fn meta(dirname: &str, filename: &str) -> UploadMetadata {
        UploadMetadata {
            dirname: Some(dirname.to_string()),
            filename: Some(filename.to_string()),
            file_size: None,
        }
    }

    #[tokio::test]
    async fn test_check_rejects_blank_filename() {
        let (_temp, intake) = intake(false);
        assert!(matches!(intake.check("", "").await, Err(TransferError::MalformedRequest(_))));
        assert!(matches!(intake.check("docs", "   ").await, Err(TransferError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_check_respects_overwrite_policy() {
        let (temp, strict) = intake(false);
        std::fs::write(temp.path().join("taken.txt"), b"x").unwrap();
        assert!(matches!(strict.check("", "taken.txt").await, Err(TransferError::Conflict(_))));
        assert!(strict.check("", "free.txt").await.is_ok());

        let lenient = UploadIntake::new(Root::open(temp.path()).unwrap(), true);
        assert!(lenient.check("", "taken.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_check_refuses_directory_target() {
        let (temp, intake) = intake(true);
        std::fs::create_dir(temp.path().join("folder")).unwrap();
        assert!(matches!(intake.check("", "folder").await, Err(TransferError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_check_rejects_escape() {
        let (_temp, intake) = intake(false);
        assert!(matches!(intake.check("../..", "x.txt").await, Err(TransferError::OutOfBounds(_))));
    }

    #[tokio::test]
    async fn test_receive_stream_creates_directories() {
        let (temp, intake) = intake(false);
        let data = vec![7u8; 10_000];
        let stored = intake
            .receive(meta("a/b", "seven.bin"), ByteSource::Stream(stream_of(&data, 1000)))
            .await
            .unwrap();
        assert_eq!(stored.size, 10_000);
        assert_eq!(stored.location.relative(), "a/b/seven.bin");
        assert_eq!(std::fs::read(temp.path().join("a/b/seven.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_percent_in_dirname_is_literal() {
        let (temp, intake) = intake(false);
        let header = UploadMetadata::from_header(
            "%7B%22dirname%22%3A%22sale%2050%2525%22%2C%22filename%22%3A%22x.txt%22%7D",
        )
        .unwrap();
        assert_eq!(header.dirname.as_deref(), Some("sale 50%25"));

        let stored = intake
            .receive(header, ByteSource::Stream(stream_of(b"literal", 4)))
            .await
            .unwrap();
        assert_eq!(stored.location.relative(), "sale 50%25/x.txt");
        assert_eq!(std::fs::read(temp.path().join("sale 50%25/x.txt")).unwrap(), b"literal");
        assert!(!temp.path().join("sale 50%").exists());
    }

    #[tokio::test]
    async fn test_receive_refuses_existing_without_overwrite() {
        let (temp, intake) = intake(false);
        std::fs::write(temp.path().join("keep.txt"), b"original").unwrap();
        let result = intake
            .receive(meta("", "keep.txt"), ByteSource::Stream(stream_of(b"new", 8)))
            .await;
        assert!(matches!(result, Err(TransferError::Conflict(_))));
        assert_eq!(std::fs::read(temp.path().join("keep.txt")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_receive_overwrites_when_allowed() {
        let (temp, intake) = intake(true);
        std::fs::write(temp.path().join("note.txt"), b"a much longer original").unwrap();
        let stored = intake
            .receive(meta("", "note.txt"), ByteSource::Stream(stream_of(b"short", 2)))
            .await
            .unwrap();
        assert_eq!(stored.size, 5);
        assert_eq!(std::fs::read(temp.path().join("note.txt")).unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_receive_stream_requires_filename() {
        let (_temp, intake) = intake(false);
        let result = intake
            .receive(UploadMetadata::default(), ByteSource::Stream(stream_of(b"x", 1)))
            .await;
        assert!(matches!(result, Err(TransferError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_receive_multipart_small_reads() {
        let (temp, intake) = intake(false);
        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
        let body = build_body(
            BOUNDARY,
            &[
                TestPart { name: "metadata", filename: None, body: br#"{"dirname":"in"}"# },
                TestPart { name: "files", filename: Some("data.bin"), body: &payload },
            ],
        );
        let stored = intake
            .receive(
                UploadMetadata::default(),
                ByteSource::Multipart {
                    boundary: BOUNDARY.to_string(),
                    body: stream_of(&body, 5),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.location.relative(), "in/data.bin");
        assert_eq!(stored.size, payload.len() as u64);
        assert_eq!(std::fs::read(temp.path().join("in/data.bin")).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_header_metadata_takes_precedence() {
        let (temp, intake) = intake(false);
        let body = build_body(
            BOUNDARY,
            &[
                TestPart {
                    name: "metadata",
                    filename: None,
                    body: br#"{"dirname":"body-dir","filename":"body.txt"}"#,
                },
                TestPart { name: "files", filename: Some("part.txt"), body: b"payload" },
            ],
        );
        let stored = intake
            .receive(
                meta("header-dir", "header.txt"),
                ByteSource::Multipart {
                    boundary: BOUNDARY.to_string(),
                    body: stream_of(&body, 64),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.location.relative(), "header-dir/header.txt");
        assert!(temp.path().join("header-dir/header.txt").exists());
        assert!(!temp.path().join("body-dir").exists());
    }

    #[tokio::test]
    async fn test_part_filename_is_last_fallback() {
        let (_temp, intake) = intake(false);
        let body = build_body(
            BOUNDARY,
            &[TestPart { name: "files", filename: Some("from-part.txt"), body: b"abc" }],
        );
        let stored = intake
            .receive(
                UploadMetadata::default(),
                ByteSource::Multipart {
                    boundary: BOUNDARY.to_string(),
                    body: stream_of(&body, 4),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.location.relative(), "from-part.txt");
        assert_eq!(stored.size, 3);
    }

    #[tokio::test]
    async fn test_only_first_file_part_is_stored() {
        let (temp, intake) = intake(false);
        let body = build_body(
            BOUNDARY,
            &[
                TestPart { name: "files", filename: Some("first.txt"), body: b"1" },
                TestPart { name: "files", filename: Some("second.txt"), body: b"2" },
            ],
        );
        let stored = intake
            .receive(
                UploadMetadata::default(),
                ByteSource::Multipart {
                    boundary: BOUNDARY.to_string(),
                    body: stream_of(&body, 16),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.location.relative(), "first.txt");
        assert!(!temp.path().join("second.txt").exists());
    }

    #[tokio::test]
    async fn test_multipart_without_file_part() {
        let (_temp, intake) = intake(false);
        let body = build_body(
            BOUNDARY,
            &[TestPart { name: "metadata", filename: None, body: br#"{"filename":"x.txt"}"# }],
        );
        let result = intake
            .receive(
                UploadMetadata::default(),
                ByteSource::Multipart {
                    boundary: BOUNDARY.to_string(),
                    body: stream_of(&body, 16),
                },
            )
            .await;
        assert!(matches!(result, Err(TransferError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_interrupted_stream() {
        let (_temp, intake) = intake(false);
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let result = intake
            .receive(meta("", "cut.bin"), ByteSource::Stream(Box::pin(tokio_stream::iter(chunks))))
            .await;
        assert!(matches!(result, Err(TransferError::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_listener_is_notified() {
        let (temp, intake) = intake(false);
        let seen: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
        let sink = seen.clone();
        let intake = intake.with_listener(Arc::new(move |path: &Path| {
            sink.lock().unwrap().push(path.to_path_buf());
        }));

        intake
            .receive(meta("", "app.apk"), ByteSource::Stream(stream_of(b"PK", 1)))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], std::fs::canonicalize(temp.path()).unwrap().join("app.apk"));
    }

    #[test]
    fn test_metadata_header_parsing() {
        let plain = UploadMetadata::from_header(r#"{"dirname":"a","filename":"b.txt","fileSize":12}"#).unwrap();
        assert_eq!(plain.filename.as_deref(), Some("b.txt"));
        assert_eq!(plain.file_size, Some(12));

        let encoded = UploadMetadata::from_header(
            "%7B%22dirname%22%3A%22%E6%96%87%22%2C%22filename%22%3A%22b.txt%22%7D",
        )
        .unwrap();
        assert_eq!(encoded.dirname.as_deref(), Some("文"));

        assert!(matches!(
            UploadMetadata::from_header("not json"),
            Err(TransferError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512.00 B");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
    }
}
