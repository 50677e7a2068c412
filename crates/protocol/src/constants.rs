use std::time::Duration;

/// How often an outstanding deploy wait polls the task status endpoint.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Hard deadline for a deploy wait when the caller does not supply one.
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for plain request/response calls (asset listing, submit, status).
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the streaming asset upload.
///
/// Large trees take a while to compress and push, so this is far longer
/// than [`HTTP_REQUEST_TIMEOUT`].
pub const HTTP_UPLOAD_TIMEOUT: Duration = Duration::from_secs(1800);

/// Maximum push event message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Time to wait for any message on the push channel before treating it as dead.
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Media type of the packaged asset.
pub const ASSET_CONTENT_TYPE: &str = "application/gzip";
