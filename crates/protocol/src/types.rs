use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a remote deploy task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeployStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl DeployStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A status update for one deploy task.
///
/// The push channel and the status poll both deliver this shape, so the
/// tracker applies them through the same rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    pub task_id: String,
    pub deployment_id: String,
    pub status: DeployStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeployEvent {
    /// Creates an event with no step, message or error.
    pub fn new(
        task_id: impl Into<String>,
        deployment_id: impl Into<String>,
        status: DeployStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            deployment_id: deployment_id.into(),
            status,
            step: None,
            message: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Optional settings attached to a deploy submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployMetadata {
    /// Container image override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Port the deployed service listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Names of platform secrets to expose to the deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}
