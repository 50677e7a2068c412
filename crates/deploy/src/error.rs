//! Deploy error types.

/// Errors produced during a deploy.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("content error: {0}")]
    Content(#[from] shipyard_content_hash::ContentError),

    #[error("transfer error: {0}")]
    Transfer(#[from] shipyard_transfer::TransferError),

    #[error("{operation} failed: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cancelled")]
    Cancelled,
}

impl DeployError {
    /// Wraps a transport failure for `operation`.
    pub fn remote(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Remote {
            operation,
            message: err.to_string(),
        }
    }
}
