use thiserror::Error;

use crate::crypto::content_id::ContentId;
use crate::storage::BlobId;

pub type Result<T> = std::result::Result<T, CaskError>;

#[derive(Debug, Error)]
pub enum CaskError {
    #[error("blob not found: '{0}'")]
    BlobNotFound(BlobId),

    #[error("blob already exists: '{0}'")]
    BlobAlreadyExists(BlobId),

    #[error("invalid byte range {offset}+{length} for blob '{id}'")]
    InvalidRange { id: BlobId, offset: u64, length: u64 },

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("content not found: {0}")]
    ContentNotFound(ContentId),

    #[error("content deleted: {0}")]
    ContentDeleted(ContentId),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("too many missing packs (more than {0})")]
    TooManyMissingPacks(u32),

    #[error("repository is corrupted: {missing_packs} missing pack blobs referenced by {dangling_contents} contents")]
    MissingPacks {
        missing_packs: u32,
        dangling_contents: u64,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository is locked by another process (lock: {0})")]
    Locked(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("{0}")]
    Other(String),
}

impl CaskError {
    /// Whether the retry wrapper may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        match self {
            CaskError::Transient(_) => true,
            CaskError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
