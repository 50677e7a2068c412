//! Waiting for a submitted task to settle.
//!
//! Three producers race to settle a wait: the tracker subscription (pushed
//! events), a status poll on a fixed interval, and the deadline. Whichever
//! gets there first wins; the rest are stopped and their results dropped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use shipyard_protocol::{DeployEvent, DeployStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::service::DeployService;
use crate::tracker::{DeployStateTracker, DeploySubscription};
use crate::types::{DeployOutcome, DeployTask, PipelineEvent};

/// Shortest status poll period. Smaller values, zero included, are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Resolution {
    Settled(DeployEvent),
    Timeout,
}

/// A result slot that accepts only its first value.
struct Settlement {
    tx: Mutex<Option<oneshot::Sender<Resolution>>>,
}

impl Settlement {
    fn new(tx: oneshot::Sender<Resolution>) -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        })
    }

    /// Returns `false` if the wait was already settled.
    fn settle(&self, resolution: Resolution) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        }
    }
}

/// Parameters shared by the wait producers.
pub(crate) struct WaitContext {
    pub tracker: DeployStateTracker,
    pub service: Arc<dyn DeployService>,
    pub deployment_id: String,
    pub task_id: String,
    pub deadline: Duration,
    pub poll_interval: Duration,
    /// Receives every non-terminal update of the task.
    pub progress: Option<mpsc::Sender<PipelineEvent>>,
}

/// Waits until `task_id` reaches a terminal state, the deadline passes, or
/// `cancel` fires.
///
/// Starts tracking the task if nothing else tracks the deployment. On
/// timeout or cancellation the in-flight entry for the task is cleared, so
/// the deployment can be submitted again.
pub async fn wait_for_completion(
    tracker: &DeployStateTracker,
    service: Arc<dyn DeployService>,
    deployment_id: &str,
    task_id: &str,
    deadline: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> DeployOutcome {
    if !tracker.track(deployment_id, task_id) {
        warn!(
            deployment = deployment_id,
            task = task_id,
            "deployment tracks another task, relying on polling"
        );
    }
    let subscription = tracker.subscribe(Some(deployment_id));
    let ctx = WaitContext {
        tracker: tracker.clone(),
        service,
        deployment_id: deployment_id.to_string(),
        task_id: task_id.to_string(),
        deadline,
        poll_interval,
        progress: None,
    };
    wait_with_subscription(ctx, subscription, cancel).await
}

/// Runs the wait on a subscription opened before the task was submitted,
/// so no pushed event can slip through between submit and wait.
pub(crate) async fn wait_with_subscription(
    ctx: WaitContext,
    subscription: DeploySubscription,
    cancel: &CancellationToken,
) -> DeployOutcome {
    let (tx, rx) = oneshot::channel();
    let settlement = Settlement::new(tx);
    let stop = cancel.child_token();
    // Stops the producers even if this future is dropped mid-wait.
    let _stop_on_exit = stop.clone().drop_guard();

    let listener = tokio::spawn(listen(
        subscription,
        ctx.task_id.clone(),
        ctx.progress.clone(),
        Arc::clone(&settlement),
        stop.clone(),
    ));
    let poller = tokio::spawn(poll(
        ctx.tracker.clone(),
        Arc::clone(&ctx.service),
        ctx.task_id.clone(),
        ctx.poll_interval.max(MIN_POLL_INTERVAL),
        Arc::clone(&settlement),
        stop.clone(),
    ));
    let timer = tokio::spawn(expire(ctx.deadline, Arc::clone(&settlement), stop.clone()));

    let resolution = tokio::select! {
        r = rx => r.ok(),
        _ = cancel.cancelled() => None,
    };

    stop.cancel();
    let (listened, polled, expired) = tokio::join!(listener, poller, timer);
    for (producer, joined) in [("listener", listened), ("poller", polled), ("timer", expired)] {
        if let Err(e) = joined {
            error!(task = %ctx.task_id, producer, error = %e, "wait producer failed");
        }
    }

    let outcome = match resolution {
        Some(Resolution::Settled(event)) => {
            let task = DeployTask::from_event(&event);
            match event.status {
                DeployStatus::Completed => DeployOutcome::Completed(task),
                _ => DeployOutcome::Failed(task),
            }
        }
        Some(Resolution::Timeout) => DeployOutcome::Timeout,
        None => DeployOutcome::Cancelled,
    };

    match &outcome {
        DeployOutcome::Completed(_) => {
            info!(deployment = %ctx.deployment_id, task = %ctx.task_id, "deploy completed");
        }
        DeployOutcome::Failed(task) => {
            warn!(
                deployment = %ctx.deployment_id,
                task = %ctx.task_id,
                error = task.error.as_deref().or(task.message.as_deref()).unwrap_or(""),
                "deploy failed"
            );
        }
        DeployOutcome::Timeout | DeployOutcome::Cancelled => {
            ctx.tracker.clear_task(&ctx.deployment_id, &ctx.task_id);
            warn!(
                deployment = %ctx.deployment_id,
                task = %ctx.task_id,
                outcome = ?outcome,
                "stopped waiting for deploy"
            );
        }
        DeployOutcome::AlreadyDeploying => {}
    }
    outcome
}

async fn listen(
    mut subscription: DeploySubscription,
    task_id: String,
    progress: Option<mpsc::Sender<PipelineEvent>>,
    settlement: Arc<Settlement>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return,
            ev = subscription.recv() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };
        if event.task_id != task_id {
            continue;
        }
        if event.is_terminal() {
            if settlement.settle(Resolution::Settled(event)) {
                debug!(task = %task_id, "settled by pushed event");
            }
            return;
        }
        if let Some(progress) = &progress {
            let _ = progress.try_send(PipelineEvent::Deploy(event));
        }
    }
}

async fn poll(
    tracker: DeployStateTracker,
    service: Arc<dyn DeployService>,
    task_id: String,
    interval: Duration,
    settlement: Arc<Settlement>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let status = tokio::select! {
            _ = stop.cancelled() => return,
            r = service.deploy_status(&task_id) => r,
        };
        match status {
            Ok(event) if event.task_id != task_id => {
                warn!(task = %task_id, got = %event.task_id, "status poll returned another task");
            }
            Ok(event) => {
                tracker.apply_event(&event);
                if event.is_terminal() {
                    if settlement.settle(Resolution::Settled(event)) {
                        debug!(task = %task_id, "settled by status poll");
                    }
                    return;
                }
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "status poll failed, retrying");
            }
        }
    }
}

async fn expire(deadline: Duration, settlement: Arc<Settlement>, stop: CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(deadline) => {
            settlement.settle(Resolution::Timeout);
        }
    }
}
