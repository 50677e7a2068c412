//! Wire types for talking to the remote execution platform.
//!
//! Everything here is plain data: request/response bodies for the asset
//! store and deploy endpoints, the deploy event payload shared by the push
//! channel and the status poll, and the timing constants both sides agree on.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    AssetListResponse, AssetSummary, SubmitDeployRequest, SubmitDeployResponse,
    UploadAssetResponse,
};
pub use types::{DeployEvent, DeployMetadata, DeployStatus};
