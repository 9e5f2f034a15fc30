//! File transfer core
//!
//! Everything here works on plain paths, byte streams and values; the HTTP
//! layer in `api::rest` only translates requests and responses.

pub mod error;
pub mod listing;
pub mod multipart;
pub mod paths;
pub mod range;
pub mod upload;

pub use error::TransferError;
pub use listing::{DirectoryEntry, DirectoryLister, EntryKind};
pub use paths::Root;
pub use range::{FileBody, RangeFileServer};
pub use upload::{ByteSource, ByteStream, FileReceivedListener, StoredFile, UploadIntake, UploadMetadata};
