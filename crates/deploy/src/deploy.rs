//! Deploy facade tying hashing, upload and task tracking together.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shipyard_content_hash::{ContentHash, IgnoreRuleSet, hash_overlay};
use shipyard_protocol::{DeployEvent, SubmitDeployRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::asset::{AssetStore, package_and_upload_if_needed};
use crate::error::DeployError;
use crate::service::DeployService;
use crate::tracker::DeployStateTracker;
use crate::types::{
    DeployOutcome, DeployReport, DeployRequest, DeployerConfig, PipelineEvent, UploadOutcome,
};
use crate::wait::{WaitContext, wait_with_subscription};

/// Runs deploys against an asset store and a deploy service.
pub struct Deployer {
    assets: Arc<dyn AssetStore>,
    service: Arc<dyn DeployService>,
    tracker: DeployStateTracker,
    config: DeployerConfig,
    events_tx: mpsc::Sender<PipelineEvent>,
    events_rx: Option<mpsc::Receiver<PipelineEvent>>,
    cancel: CancellationToken,
}

impl Deployer {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        service: Arc<dyn DeployService>,
        tracker: DeployStateTracker,
        config: DeployerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            assets,
            service,
            tracker,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the pipeline event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>> {
        self.events_rx.take()
    }

    /// Cancels every operation of this deployer when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> &DeployStateTracker {
        &self.tracker
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    /// Content hash of `roots` layered in order, computed off the async runtime.
    pub async fn compute_checksum(
        roots: &[PathBuf],
        ignore: &IgnoreRuleSet,
    ) -> Result<ContentHash, DeployError> {
        let roots = roots.to_vec();
        let ignore = ignore.clone();
        let hash = tokio::task::spawn_blocking(move || hash_overlay(&roots, &ignore)).await??;
        Ok(hash)
    }

    /// See [`package_and_upload_if_needed`].
    pub async fn package_and_upload_if_needed(
        &self,
        roots: &[PathBuf],
        ignore: &IgnoreRuleSet,
        checksum: &ContentHash,
    ) -> Result<UploadOutcome, DeployError> {
        package_and_upload_if_needed(self.assets.as_ref(), roots, ignore, checksum, &self.cancel)
            .await
    }

    pub fn is_deploying(&self, deployment_id: &str) -> bool {
        self.tracker.is_deploying(deployment_id)
    }

    /// Current status of a task straight from the service.
    pub async fn status(&self, task_id: &str) -> Result<DeployEvent, DeployError> {
        self.service.deploy_status(task_id).await
    }

    /// Submits through `submit` and waits for the resulting task to settle.
    ///
    /// Returns [`DeployOutcome::AlreadyDeploying`] without calling `submit`
    /// if the deployment already has a task in flight. The in-flight entry is
    /// released on every exit path, including errors from `submit`.
    pub async fn submit_and_wait<F, Fut>(
        &self,
        deployment_id: &str,
        submit: F,
        timeout: Duration,
    ) -> Result<DeployOutcome, DeployError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, DeployError>>,
    {
        let Some(guard) = self.tracker.try_begin(deployment_id) else {
            info!(deployment = deployment_id, "deploy already in progress");
            return Ok(DeployOutcome::AlreadyDeploying);
        };
        // Subscribe before submitting so early pushed events are buffered.
        let subscription = self.tracker.subscribe(Some(deployment_id));

        let task_id = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(DeployOutcome::Cancelled),
            result = submit() => result?,
        };
        guard.activate(&task_id);
        info!(deployment = deployment_id, task = %task_id, "deploy submitted");
        self.emit(PipelineEvent::Submitted {
            deployment_id: deployment_id.to_string(),
            task_id: task_id.clone(),
        })
        .await;

        let ctx = WaitContext {
            tracker: self.tracker.clone(),
            service: Arc::clone(&self.service),
            deployment_id: deployment_id.to_string(),
            task_id,
            deadline: timeout,
            poll_interval: self.config.poll_interval,
            progress: Some(self.events_tx.clone()),
        };
        let outcome = wait_with_subscription(ctx, subscription, &self.cancel).await;
        drop(guard);
        Ok(outcome)
    }

    /// Runs the whole pipeline: hash, upload if needed, submit, wait.
    ///
    /// Errors before submission (unreadable tree, failed upload) are
    /// returned as `Err`. Once submitted, the result is the [`DeployOutcome`].
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployReport, DeployError> {
        let deployment_id = request.deployment_id.clone();
        let result = self.run_pipeline(request).await;

        let (success, err_msg) = match &result {
            Ok(report) => (report.outcome.is_success(), report.outcome.error()),
            Err(e) => (false, Some(e.to_string())),
        };
        if let Some(msg) = &err_msg {
            error!(deployment = %deployment_id, error = %msg, "deploy did not complete");
        }
        self.emit(PipelineEvent::Finished {
            deployment_id,
            success,
            error: err_msg,
        })
        .await;
        result
    }

    async fn run_pipeline(&self, request: DeployRequest) -> Result<DeployReport, DeployError> {
        let deployment_id = request.deployment_id.as_str();
        if self.is_deploying(deployment_id) {
            return Ok(DeployReport {
                deployment_id: deployment_id.to_string(),
                checksum: None,
                upload: None,
                outcome: DeployOutcome::AlreadyDeploying,
            });
        }
        self.check_cancelled()?;

        // 1. Hash
        self.emit(PipelineEvent::Hashing {
            deployment_id: deployment_id.to_string(),
        })
        .await;
        let checksum = Self::compute_checksum(&request.roots, &request.ignore).await?;
        info!(deployment = deployment_id, %checksum, "computed checksum");
        self.emit(PipelineEvent::Hashed {
            deployment_id: deployment_id.to_string(),
            checksum,
        })
        .await;
        self.check_cancelled()?;

        // 2. Upload if needed
        self.emit(PipelineEvent::Uploading {
            deployment_id: deployment_id.to_string(),
            checksum,
        })
        .await;
        let upload = self
            .package_and_upload_if_needed(&request.roots, &request.ignore, &checksum)
            .await?;
        let uploaded_event = if upload.uploaded {
            PipelineEvent::Uploaded {
                deployment_id: deployment_id.to_string(),
                checksum,
            }
        } else {
            PipelineEvent::UploadSkipped {
                deployment_id: deployment_id.to_string(),
                checksum,
            }
        };
        self.emit(uploaded_event).await;

        // 3. Submit and wait
        let submit_request = SubmitDeployRequest {
            checksum: checksum.to_hex(),
            metadata: request.metadata.clone(),
        };
        let timeout = request.timeout.unwrap_or(self.config.deploy_timeout);
        let outcome = self
            .submit_and_wait(
                deployment_id,
                || self.service.submit_deploy(deployment_id, &submit_request),
                timeout,
            )
            .await?;

        Ok(DeployReport {
            deployment_id: deployment_id.to_string(),
            checksum: Some(checksum),
            upload: Some(upload),
            outcome,
        })
    }

    fn check_cancelled(&self) -> Result<(), DeployError> {
        if self.cancel.is_cancelled() {
            Err(DeployError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::MockStore;
    use crate::wait::tests::{ScriptedService, ev};
    use shipyard_protocol::{DeployMetadata, DeployStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deployer(store: MockStore, service: Arc<ScriptedService>) -> Deployer {
        Deployer::new(
            Arc::new(store),
            service,
            DeployStateTracker::new(),
            DeployerConfig {
                poll_interval: Duration::from_secs(1),
                deploy_timeout: Duration::from_secs(30),
            },
        )
    }

    fn request(root: &std::path::Path) -> DeployRequest {
        DeployRequest {
            deployment_id: "web".into(),
            roots: vec![root.to_path_buf()],
            ignore: IgnoreRuleSet::default(),
            metadata: DeployMetadata::default(),
            timeout: None,
        }
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        dir
    }

    #[tokio::test(start_paused = true)]
    async fn full_pipeline_uploads_submits_and_completes() {
        let dir = source_tree();
        let service = ScriptedService::new(vec![Ok(ev(DeployStatus::Completed))]);
        let mut d = deployer(MockStore::new(Ok(false)), service.clone());
        let mut events = d.take_events().unwrap();

        let report = d.deploy(request(dir.path())).await.unwrap();
        assert!(report.outcome.is_success());
        assert!(report.upload.as_ref().unwrap().uploaded);
        assert_eq!(service.submits.load(Ordering::SeqCst), 1);
        assert!(!d.is_deploying("web"));

        drop(d);
        let mut seen = Vec::new();
        while let Some(e) = events.recv().await {
            seen.push(e);
        }
        assert!(matches!(seen.first(), Some(PipelineEvent::Hashing { .. })));
        assert!(seen.iter().any(|e| matches!(e, PipelineEvent::Uploaded { .. })));
        assert!(seen.iter().any(|e| matches!(e, PipelineEvent::Submitted { .. })));
        assert!(matches!(
            seen.last(),
            Some(PipelineEvent::Finished { success: true, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn existing_asset_is_not_uploaded() {
        let dir = source_tree();
        let service = ScriptedService::new(vec![Ok(ev(DeployStatus::Completed))]);
        let store = Arc::new(MockStore::new(Ok(true)));
        let d = Deployer::new(
            store.clone(),
            service,
            DeployStateTracker::new(),
            DeployerConfig::default(),
        );

        let report = d.deploy(request(dir.path())).await.unwrap();
        assert!(!report.upload.unwrap().uploaded);
        assert_eq!(store.upload_count(), 0);
        assert!(report.outcome.is_success());
    }

    #[tokio::test]
    async fn checksum_matches_content_hash() {
        let dir = source_tree();
        let checksum = Deployer::compute_checksum(&[dir.path().to_path_buf()], &IgnoreRuleSet::default())
            .await
            .unwrap();
        assert_eq!(
            checksum,
            shipyard_content_hash::hash_directory(dir.path(), "", &IgnoreRuleSet::default()).unwrap()
        );
    }

    #[tokio::test]
    async fn unreadable_root_fails_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(vec![]);
        let d = deployer(MockStore::new(Ok(false)), service.clone());

        let result = d.deploy(request(&dir.path().join("missing"))).await;
        assert!(matches!(result, Err(DeployError::Content(_))));
        assert_eq!(service.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submit_is_refused() {
        let service = ScriptedService::new(vec![Ok(ev(DeployStatus::InProgress))]);
        let d = deployer(MockStore::new(Ok(false)), service);
        let second_calls = AtomicUsize::new(0);
        let release = tokio::sync::Notify::new();

        let first = d.submit_and_wait(
            "web",
            || async {
                release.notified().await;
                Ok::<_, DeployError>("t1".to_string())
            },
            Duration::from_secs(5),
        );
        let second = async {
            // Let the first caller take the reservation.
            tokio::task::yield_now().await;
            let outcome = d
                .submit_and_wait(
                    "web",
                    || async {
                        second_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, DeployError>("t2".to_string())
                    },
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            release.notify_one();
            outcome
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(second, DeployOutcome::AlreadyDeploying);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        // First caller never saw a terminal state.
        assert_eq!(first.unwrap(), DeployOutcome::Timeout);
        assert!(!d.is_deploying("web"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_event_from_earlier_task_keeps_guard() {
        let service = ScriptedService::new(vec![Ok(ev(DeployStatus::InProgress))]);
        let d = deployer(MockStore::new(Ok(false)), service);
        let tracker = d.tracker().clone();
        let second_calls = AtomicUsize::new(0);
        let release = tokio::sync::Notify::new();

        let first = d.submit_and_wait(
            "web",
            || async {
                // An earlier task's terminal push lands mid-submit.
                tracker.apply_event(&DeployEvent::new("t0", "web", DeployStatus::Completed));
                release.notified().await;
                Ok::<_, DeployError>("t1".to_string())
            },
            Duration::from_secs(5),
        );
        let second = async {
            tokio::task::yield_now().await;
            let outcome = d
                .submit_and_wait(
                    "web",
                    || async {
                        second_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, DeployError>("t2".to_string())
                    },
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            release.notify_one();
            outcome
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(second, DeployOutcome::AlreadyDeploying);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        // The stale event did not settle the new task.
        assert_eq!(first.unwrap(), DeployOutcome::Timeout);
        assert!(!d.is_deploying("web"));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_error_releases_reservation() {
        let service = ScriptedService::new(vec![]);
        let d = deployer(MockStore::new(Ok(false)), service);

        let result = d
            .submit_and_wait(
                "web",
                || async { Err::<String, _>(DeployError::remote("submit deploy", "409 Conflict")) },
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(DeployError::Remote { .. })));
        assert!(!d.is_deploying("web"));
        assert_eq!(d.tracker().listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_clears_in_flight() {
        let service = ScriptedService::new(vec![Ok(ev(DeployStatus::InProgress))]);
        let d = deployer(MockStore::new(Ok(false)), service);
        let cancel = d.cancel_token();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        });
        let outcome = d
            .submit_and_wait(
                "web",
                || async { Ok::<_, DeployError>("t1".to_string()) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, DeployOutcome::Cancelled);
        assert!(!d.is_deploying("web"));
        assert_eq!(d.tracker().listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_event_before_submit_returns_is_not_lost() {
        let service = ScriptedService::new(vec![Ok(ev(DeployStatus::InProgress))]);
        let d = deployer(MockStore::new(Ok(false)), service.clone());
        let tracker = d.tracker().clone();

        let outcome = d
            .submit_and_wait(
                "web",
                || async move {
                    // The task finishes before the submit response arrives.
                    tracker.apply_event(&ev(DeployStatus::Completed));
                    Ok::<_, DeployError>("t1".to_string())
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(service.polls.load(Ordering::SeqCst), 0);
        assert!(!d.is_deploying("web"));
    }

    #[tokio::test]
    async fn already_deploying_short_circuits_pipeline() {
        let dir = source_tree();
        let service = ScriptedService::new(vec![]);
        let store = Arc::new(MockStore::new(Ok(false)));
        let d = Deployer::new(
            store.clone(),
            service.clone(),
            DeployStateTracker::new(),
            DeployerConfig::default(),
        );
        let _held = d.tracker().try_begin("web").unwrap();

        let report = d.deploy(request(dir.path())).await.unwrap();
        assert_eq!(report.outcome, DeployOutcome::AlreadyDeploying);
        assert!(report.checksum.is_none());
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn take_events_once() {
        let mut d = deployer(MockStore::new(Ok(false)), ScriptedService::new(vec![]));
        assert!(d.take_events().is_some());
        assert!(d.take_events().is_none());
    }
}
