//! Client for the deployment platform API.
//!
//! [`Client`] speaks the HTTP endpoints (asset lookup and upload, deploy
//! submission and status) and implements the `shipyard-deploy` transport
//! traits on top of them. [`EventListener`] follows the push channel and
//! feeds task updates into a [`shipyard_deploy::DeployStateTracker`].

mod client;
mod events;

pub use client::Client;
pub use events::{EventListener, ReconnectConfig};

/// Errors from the API client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error during {operation}: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} {url} returned {status}: {body}")]
    Status {
        operation: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid API token")]
    InvalidToken,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ApiError {
    /// HTTP status code, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<ApiError> for shipyard_deploy::DeployError {
    fn from(err: ApiError) -> Self {
        let operation = match &err {
            ApiError::Http { operation, .. } | ApiError::Status { operation, .. } => *operation,
            _ => "api request",
        };
        shipyard_deploy::DeployError::remote(operation, err)
    }
}
