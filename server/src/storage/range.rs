//! Range-aware file serving
//!
//! A request without `Range` gets the whole file. With `Range: bytes=start-end`
//! the window is clamped to the file and to the chunk ceiling, so very large
//! files are fetched over many successive requests. Only the first range of a
//! multi-range header is honoured; a header in a unit other than `bytes` is
//! ignored and the whole file is served.

use std::io::SeekFrom;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::error::{Result, TransferError};
use super::paths::{ConfinedPath, Root};
use super::upload::ByteStream;

pub const DEFAULT_MAX_CHUNK: u64 = 8 * 1024 * 1024;

/// Read size used when streaming a file to the client.
const STREAM_BUFFER: usize = 64 * 1024;

/// Inclusive byte window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

pub enum FileBody {
    /// Read lazily from disk.
    Stream(ByteStream),
    /// An interior window read up front; never larger than the chunk ceiling.
    Buffered(Bytes),
}

pub struct ServedFile {
    /// Total size of the file on disk.
    pub size: u64,
    /// `None` for a whole-file response.
    pub range: Option<ByteRange>,
    pub content_type: String,
    pub body: FileBody,
}

impl ServedFile {
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.size, |r| r.length())
    }
}

#[derive(Debug, Clone)]
pub struct RangeFileServer {
    root: Root,
    max_chunk: u64,
}

impl RangeFileServer {
    pub fn new(root: Root, max_chunk: u64) -> Self {
        Self {
            root,
            max_chunk: max_chunk.max(1),
        }
    }

    /// Resolve a percent-encoded URI path below the root and serve it.
    pub async fn open(&self, encoded: &str, range_header: Option<&str>) -> Result<ServedFile> {
        let file = self.root.resolve_encoded(encoded).await?;
        self.serve(&file, range_header).await
    }

    pub async fn serve(&self, file: &ConfinedPath, range_header: Option<&str>) -> Result<ServedFile> {
        let path = file.absolute();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(TransferError::NotFound(file.relative().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(file.relative().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = metadata.len();
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let range = match range_header {
            Some(header) => parse_range(header, size, self.max_chunk).transpose()?,
            None => None,
        };

        let mut handle = File::open(path).await?;
        let body = match range {
            None => {
                tracing::info!(path = %file.relative(), size, "download started");
                FileBody::Stream(file_stream(handle, size))
            }
            Some(window) => {
                tracing::info!(
                    path = %file.relative(),
                    range = range_header.unwrap_or_default(),
                    window = %window.content_range(size),
                    "range request"
                );
                handle.seek(SeekFrom::Start(window.start)).await?;
                if window.end + 1 == size {
                    FileBody::Stream(file_stream(handle, window.length()))
                } else {
                    // Bounded by max_chunk.
                    let mut buf = vec![0u8; window.length() as usize];
                    handle.read_exact(&mut buf).await?;
                    FileBody::Buffered(Bytes::from(buf))
                }
            }
        };

        Ok(ServedFile {
            size,
            range,
            content_type,
            body,
        })
    }
}

/// Interpret a `Range` header for a file of `size` bytes.
///
/// `None` means the header does not apply (unknown unit). A malformed start
/// counts as 0; an absent end runs to the ceiling; any end is clamped to
/// `min(size - 1, start + max_chunk - 1)`.
pub fn parse_range(header: &str, size: u64, max_chunk: u64) -> Option<Result<ByteRange>> {
    let header = header.trim();
    let ranges = header
        .get(..6)
        .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
        .map(|_| &header[6..])?;

    let first = ranges.split(',').next().unwrap_or_default();
    let (start, end) = first.split_once('-').unwrap_or((first, ""));
    let start = start.trim().parse::<u64>().unwrap_or(0);

    if start >= size {
        return Some(Err(TransferError::RangeNotSatisfiable { size }));
    }

    let ceiling = start
        .saturating_add(max_chunk.max(1) - 1)
        .min(size - 1);
    let end = end
        .trim()
        .parse::<u64>()
        .map_or(ceiling, |requested| requested.min(ceiling));

    if start > end {
        return Some(Err(TransferError::RangeNotSatisfiable { size }));
    }
    Some(Ok(ByteRange { start, end }))
}

/// Stream at most `limit` bytes from the current position of `file`.
fn file_stream(file: File, limit: u64) -> ByteStream {
    Box::pin(async_stream::stream! {
        let mut reader = file.take(limit);
        let mut buf = vec![0u8; STREAM_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
