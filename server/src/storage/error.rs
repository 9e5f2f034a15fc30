use thiserror::Error;

/// Failures reported by the file transfer core.
///
/// None of these are retried internally. Confinement violations are always
/// raised before any filesystem call touches the requested path.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Path escapes the shared root: {0}")]
    OutOfBounds(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("File already exists: {0}")]
    Conflict(String),
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Range not satisfiable for {size} byte file")]
    RangeNotSatisfiable { size: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The client side of a stream went away mid-transfer.
    #[error("Transfer interrupted: {0}")]
    Interrupted(#[source] std::io::Error),
}

impl TransferError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
