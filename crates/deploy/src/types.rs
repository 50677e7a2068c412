use std::path::PathBuf;
use std::time::Duration;

use shipyard_content_hash::{ContentHash, IgnoreRuleSet};
use shipyard_protocol::constants::{DEFAULT_DEPLOY_TIMEOUT, DEFAULT_POLL_INTERVAL};
use shipyard_protocol::{DeployEvent, DeployMetadata, DeployStatus};

/// Last known state of a deploy task.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployTask {
    /// Unset between reserving a deployment and the submit call returning.
    pub task_id: Option<String>,
    pub deployment_id: String,
    pub status: DeployStatus,
    pub step: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl DeployTask {
    pub(crate) fn pending(deployment_id: &str) -> Self {
        Self {
            task_id: None,
            deployment_id: deployment_id.to_string(),
            status: DeployStatus::Pending,
            step: None,
            message: None,
            error: None,
        }
    }

    pub fn from_event(event: &DeployEvent) -> Self {
        let mut task = Self::pending(&event.deployment_id);
        task.task_id = Some(event.task_id.clone());
        task.apply(event);
        task
    }

    /// Copies status and any reported details from `event`.
    pub(crate) fn apply(&mut self, event: &DeployEvent) {
        self.status = event.status;
        if event.step.is_some() {
            self.step.clone_from(&event.step);
        }
        if event.message.is_some() {
            self.message.clone_from(&event.message);
        }
        if event.error.is_some() {
            self.error.clone_from(&event.error);
        }
    }
}

/// How a deploy ended from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployOutcome {
    Completed(DeployTask),
    Failed(DeployTask),
    /// No terminal state before the deadline. The remote task may still finish.
    Timeout,
    /// The deployment already had a task in flight; nothing was submitted.
    AlreadyDeploying,
    Cancelled,
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Error text for anything but success.
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(task) => Some(
                task.error
                    .clone()
                    .or_else(|| task.message.clone())
                    .unwrap_or_else(|| "deploy failed".into()),
            ),
            Self::Timeout => Some("timed out waiting for deploy to finish".into()),
            Self::AlreadyDeploying => Some("a deploy is already in progress".into()),
            Self::Cancelled => Some("cancelled".into()),
        }
    }

    pub fn task(&self) -> Option<&DeployTask> {
        match self {
            Self::Completed(task) | Self::Failed(task) => Some(task),
            _ => None,
        }
    }
}

/// Result of the upload-if-needed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// `false` when the store already had the asset.
    pub uploaded: bool,
    /// Checksum as confirmed by the store.
    pub confirmed_checksum: String,
}

/// Timing knobs for [`crate::Deployer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployerConfig {
    pub poll_interval: Duration,
    pub deploy_timeout: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            deploy_timeout: DEFAULT_DEPLOY_TIMEOUT,
        }
    }
}

/// Everything needed to run the full pipeline for one deployment.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub deployment_id: String,
    /// Source roots, lowest layer first.
    pub roots: Vec<PathBuf>,
    pub ignore: IgnoreRuleSet,
    pub metadata: DeployMetadata,
    /// Overrides [`DeployerConfig::deploy_timeout`].
    pub timeout: Option<Duration>,
}

/// Summary of a full pipeline run.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub deployment_id: String,
    /// Unset when the run stopped before hashing.
    pub checksum: Option<ContentHash>,
    pub upload: Option<UploadOutcome>,
    pub outcome: DeployOutcome,
}

/// Progress reported while [`crate::Deployer::deploy`] runs.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Hashing {
        deployment_id: String,
    },
    Hashed {
        deployment_id: String,
        checksum: ContentHash,
    },
    UploadSkipped {
        deployment_id: String,
        checksum: ContentHash,
    },
    Uploading {
        deployment_id: String,
        checksum: ContentHash,
    },
    Uploaded {
        deployment_id: String,
        checksum: ContentHash,
    },
    Submitted {
        deployment_id: String,
        task_id: String,
    },
    /// A status update for the submitted task.
    Deploy(DeployEvent),
    Finished {
        deployment_id: String,
        success: bool,
        error: Option<String>,
    },
}
