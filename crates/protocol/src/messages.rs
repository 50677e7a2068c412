use serde::{Deserialize, Serialize};

use crate::types::DeployMetadata;

/// One entry of the asset listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Response of `GET /assets?checksum=...`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetListResponse {
    #[serde(default)]
    pub assets: Vec<AssetSummary>,
}

impl AssetListResponse {
    /// Returns `true` if the listing contains `checksum`.
    pub fn contains(&self, checksum: &str) -> bool {
        self.assets
            .iter()
            .any(|a| a.checksum.eq_ignore_ascii_case(checksum))
    }
}

/// Response of `PUT /assets/{checksum}`.
///
/// `checksum` is the value the server computed for the unpacked archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAssetResponse {
    pub checksum: String,
}

/// Body of `POST /deployments/{deploymentId}/tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDeployRequest {
    pub checksum: String,
    #[serde(default)]
    pub metadata: DeployMetadata,
}

/// Response of a deploy submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDeployResponse {
    pub task_id: String,
}
