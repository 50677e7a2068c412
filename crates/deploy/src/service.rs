//! Remote deploy task API.

use shipyard_protocol::{DeployEvent, SubmitDeployRequest};

use crate::BoxFuture;
use crate::error::DeployError;

/// Submits deploy tasks and reports their status.
///
/// Implemented by the HTTP client; tests use in-memory doubles.
pub trait DeployService: Send + Sync {
    /// Starts a deploy of `request.checksum` and returns the new task id.
    fn submit_deploy<'a>(
        &'a self,
        deployment_id: &'a str,
        request: &'a SubmitDeployRequest,
    ) -> BoxFuture<'a, Result<String, DeployError>>;

    /// Current status of a task.
    fn deploy_status<'a>(&'a self, task_id: &'a str) -> BoxFuture<'a, Result<DeployEvent, DeployError>>;
}
