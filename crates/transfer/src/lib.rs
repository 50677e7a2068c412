//! Streaming packager for deployable trees.
//!
//! Turns the merged view of one or more roots into a gzip-compressed tar
//! archive, produced incrementally so that memory use stays bounded by one
//! file's compressed output rather than the size of the tree.

mod archive;
mod stream;

pub use archive::ArchiveReader;
pub use stream::{ArchiveChunk, ArchiveStream, open_archive_stream};

use shipyard_content_hash::ContentError;

/// Size of the chunks handed to async consumers: 64 KiB.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Errors produced while packaging.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("I/O error while packaging {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file changed while it was being packaged: {0}")]
    FileChanged(String),

    #[error("packaging cancelled")]
    Cancelled,

    #[error("archive producer stopped: {0}")]
    Producer(String),
}

impl From<TransferError> for std::io::Error {
    fn from(err: TransferError) -> Self {
        let kind = match &err {
            TransferError::Io { source, .. } => source.kind(),
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_a_retryable_io_error() {
        let err = std::io::Error::from(TransferError::Cancelled);
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
        assert_ne!(err.kind(), std::io::ErrorKind::Interrupted);
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err = std::io::Error::from(TransferError::Io {
            path: "app.js".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
