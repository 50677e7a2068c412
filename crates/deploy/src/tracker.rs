//! In-memory record of deploys in flight.
//!
//! Holds at most one task per deployment id. Pushed events and poll results
//! go through [`DeployStateTracker::apply_event`]; events for a task other
//! than the tracked one are ignored, and a terminal status removes the
//! entry. Subscribers see every applied event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use shipyard_protocol::DeployEvent;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::DeployTask;

struct Slot {
    reservation: u64,
    task: DeployTask,
}

struct Listener {
    /// `None` listens to every deployment.
    deployment_id: Option<String>,
    tx: mpsc::UnboundedSender<DeployEvent>,
}

#[derive(Default)]
struct TrackerState {
    in_flight: HashMap<String, Slot>,
    listeners: HashMap<u64, Listener>,
    next_id: u64,
}

impl TrackerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn lock(state: &Mutex<TrackerState>) -> MutexGuard<'_, TrackerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, cloneable deploy state.
#[derive(Clone, Default)]
pub struct DeployStateTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl DeployStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `deployment_id` has a task that has not reached a terminal state.
    pub fn is_deploying(&self, deployment_id: &str) -> bool {
        lock(&self.state).in_flight.contains_key(deployment_id)
    }

    pub fn task(&self, deployment_id: &str) -> Option<DeployTask> {
        lock(&self.state)
            .in_flight
            .get(deployment_id)
            .map(|slot| slot.task.clone())
    }

    /// Snapshot of all in-flight tasks, ordered by deployment id.
    pub fn in_flight(&self) -> Vec<DeployTask> {
        let mut tasks: Vec<DeployTask> = lock(&self.state)
            .in_flight
            .values()
            .map(|slot| slot.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        tasks
    }

    /// Reserves `deployment_id` for a new deploy.
    ///
    /// Returns `None` if a deploy is already in flight. The entry stays until
    /// a terminal event arrives or the returned guard is dropped, whichever
    /// comes first.
    pub fn try_begin(&self, deployment_id: &str) -> Option<InFlightGuard> {
        let mut state = lock(&self.state);
        if state.in_flight.contains_key(deployment_id) {
            debug!(deployment = deployment_id, "deploy already in flight");
            return None;
        }
        let reservation = state.next_id();
        state.in_flight.insert(
            deployment_id.to_string(),
            Slot {
                reservation,
                task: DeployTask::pending(deployment_id),
            },
        );
        Some(InFlightGuard {
            state: Arc::downgrade(&self.state),
            deployment_id: deployment_id.to_string(),
            reservation,
        })
    }

    /// Starts tracking an already submitted task, unless another task holds the deployment.
    ///
    /// Returns `true` if `task_id` is the tracked task afterwards.
    pub fn track(&self, deployment_id: &str, task_id: &str) -> bool {
        let mut state = lock(&self.state);
        let reservation = state.next_id();
        let slot = state
            .in_flight
            .entry(deployment_id.to_string())
            .or_insert_with(|| Slot {
                reservation,
                task: DeployTask::pending(deployment_id),
            });
        match slot.task.task_id.as_deref() {
            Some(current) => current == task_id,
            None => {
                slot.task.task_id = Some(task_id.to_string());
                true
            }
        }
    }

    /// Applies a status update from either the push channel or a poll.
    ///
    /// Returns `false` when the event was ignored: the deployment is not
    /// tracked, the event belongs to a different task, or the submit call
    /// has not reported a task id yet. In the last case the event still
    /// reaches subscribers, so a wait opened before submitting can pick it up.
    pub fn apply_event(&self, event: &DeployEvent) -> bool {
        let mut state = lock(&self.state);
        let Some(slot) = state.in_flight.get_mut(&event.deployment_id) else {
            debug!(
                deployment = %event.deployment_id,
                task = %event.task_id,
                "ignoring event for untracked deployment"
            );
            return false;
        };

        let applied = match slot.task.task_id.as_deref() {
            Some(current) if current != event.task_id => {
                debug!(
                    deployment = %event.deployment_id,
                    tracked = current,
                    task = %event.task_id,
                    "ignoring event for stale task"
                );
                return false;
            }
            Some(_) => {
                slot.task.apply(event);
                true
            }
            None => {
                debug!(
                    deployment = %event.deployment_id,
                    task = %event.task_id,
                    "task id not known yet, forwarding event only"
                );
                false
            }
        };

        if applied && event.is_terminal() {
            state.in_flight.remove(&event.deployment_id);
            info!(
                deployment = %event.deployment_id,
                task = %event.task_id,
                status = ?event.status,
                "deploy settled"
            );
        }

        state.listeners.retain(|_, listener| {
            let interested = listener
                .deployment_id
                .as_deref()
                .is_none_or(|id| id == event.deployment_id);
            !interested || listener.tx.send(event.clone()).is_ok()
        });
        applied
    }

    /// Registers a listener for applied events, optionally limited to one deployment.
    pub fn subscribe(&self, deployment_id: Option<&str>) -> DeploySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.listeners.insert(
            id,
            Listener {
                deployment_id: deployment_id.map(str::to_string),
                tx,
            },
        );
        DeploySubscription {
            id,
            rx,
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    /// Drops the entry for `deployment_id` if it still tracks `task_id`.
    pub(crate) fn clear_task(&self, deployment_id: &str, task_id: &str) -> bool {
        let mut state = lock(&self.state);
        let matches = state
            .in_flight
            .get(deployment_id)
            .is_some_and(|slot| slot.task.task_id.as_deref() == Some(task_id));
        if matches {
            state.in_flight.remove(deployment_id);
            debug!(deployment = deployment_id, task = task_id, "cleared in-flight deploy");
        }
        matches
    }
}

/// Keeps a deployment reserved until dropped.
pub struct InFlightGuard {
    state: Weak<Mutex<TrackerState>>,
    deployment_id: String,
    reservation: u64,
}

impl InFlightGuard {
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Records the task id the submit call returned.
    pub fn activate(&self, task_id: &str) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        match state.in_flight.get_mut(&self.deployment_id) {
            Some(slot) if slot.reservation == self.reservation => {
                if slot.task.task_id.as_deref() != Some(task_id) {
                    slot.task = DeployTask::pending(&self.deployment_id);
                    slot.task.task_id = Some(task_id.to_string());
                }
            }
            _ => {
                debug!(deployment = %self.deployment_id, "reservation no longer held");
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        let ours = state
            .in_flight
            .get(&self.deployment_id)
            .is_some_and(|slot| slot.reservation == self.reservation);
        if ours {
            state.in_flight.remove(&self.deployment_id);
            debug!(deployment = %self.deployment_id, "released in-flight deploy");
        }
    }
}

/// Receives events applied by the tracker. Unregisters itself on drop.
pub struct DeploySubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DeployEvent>,
    state: Weak<Mutex<TrackerState>>,
}

impl DeploySubscription {
    pub async fn recv(&mut self) -> Option<DeployEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeployEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for DeploySubscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_protocol::DeployStatus;

    fn event(task: &str, deployment: &str, status: DeployStatus) -> DeployEvent {
        DeployEvent::new(task, deployment, status)
    }

    #[test]
    fn second_reservation_is_refused() {
        let tracker = DeployStateTracker::new();
        let guard = tracker.try_begin("web").unwrap();
        assert!(tracker.is_deploying("web"));
        assert!(tracker.try_begin("web").is_none());
        assert!(tracker.try_begin("api").is_some());

        drop(guard);
        assert!(!tracker.is_deploying("web"));
        assert!(tracker.try_begin("web").is_some());
    }

    #[test]
    fn untracked_events_are_ignored() {
        let tracker = DeployStateTracker::new();
        let mut sub = tracker.subscribe(None);
        assert!(!tracker.apply_event(&event("t1", "web", DeployStatus::InProgress)));
        assert!(sub.try_recv().is_none());
        assert!(tracker.in_flight().is_empty());
    }

    #[test]
    fn stale_task_events_are_ignored() {
        let tracker = DeployStateTracker::new();
        let guard = tracker.try_begin("web").unwrap();
        guard.activate("t2");

        assert!(!tracker.apply_event(&event("t1", "web", DeployStatus::Completed)));
        assert!(tracker.is_deploying("web"));
        assert_eq!(tracker.task("web").unwrap().status, DeployStatus::Pending);
    }

    #[test]
    fn unassigned_entry_forwards_without_adopting() {
        let tracker = DeployStateTracker::new();
        let guard = tracker.try_begin("web").unwrap();
        let mut sub = tracker.subscribe(Some("web"));
        let mut ev = event("t1", "web", DeployStatus::InProgress);
        ev.step = Some("build".into());
        assert!(!tracker.apply_event(&ev));

        let task = tracker.task("web").unwrap();
        assert!(task.task_id.is_none());
        assert!(task.step.is_none());
        assert_eq!(sub.try_recv().unwrap().step.as_deref(), Some("build"));

        guard.activate("t1");
        assert_eq!(tracker.task("web").unwrap().task_id.as_deref(), Some("t1"));
        assert!(tracker.apply_event(&ev));
        assert_eq!(tracker.task("web").unwrap().step.as_deref(), Some("build"));
    }

    #[test]
    fn terminal_event_settles_once() {
        let tracker = DeployStateTracker::new();
        let guard = tracker.try_begin("web").unwrap();
        guard.activate("t1");
        let mut sub = tracker.subscribe(Some("web"));

        assert!(tracker.apply_event(&event("t1", "web", DeployStatus::InProgress)));
        assert!(tracker.apply_event(&event("t1", "web", DeployStatus::Completed)));
        assert!(!tracker.is_deploying("web"));
        // Duplicate terminal from the other channel is a no-op.
        assert!(!tracker.apply_event(&event("t1", "web", DeployStatus::Completed)));

        assert_eq!(sub.try_recv().unwrap().status, DeployStatus::InProgress);
        assert_eq!(sub.try_recv().unwrap().status, DeployStatus::Completed);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn subscriptions_filter_and_unregister() {
        let tracker = DeployStateTracker::new();
        for (id, task) in [("web", "t1"), ("api", "t2")] {
            assert!(tracker.track(id, task));
        }
        let mut web = tracker.subscribe(Some("web"));
        let mut all = tracker.subscribe(None);
        assert_eq!(tracker.listener_count(), 2);

        tracker.apply_event(&event("t2", "api", DeployStatus::InProgress));
        assert!(web.try_recv().is_none());
        assert_eq!(all.try_recv().unwrap().deployment_id, "api");

        drop(web);
        assert_eq!(tracker.listener_count(), 1);
        drop(all);
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn old_guard_does_not_release_newer_reservation() {
        let tracker = DeployStateTracker::new();
        let first = tracker.try_begin("web").unwrap();
        first.activate("t1");
        tracker.apply_event(&event("t1", "web", DeployStatus::Failed));

        let second = tracker.try_begin("web").unwrap();
        drop(first);
        assert!(tracker.is_deploying("web"));
        drop(second);
        assert!(!tracker.is_deploying("web"));
    }

    #[test]
    fn late_terminal_from_earlier_task_keeps_reservation() {
        let tracker = DeployStateTracker::new();
        let guard = tracker.try_begin("web").unwrap();

        // A previous task's result arrives while the new submit is running.
        assert!(!tracker.apply_event(&event("t0", "web", DeployStatus::Completed)));
        assert!(tracker.is_deploying("web"));
        assert!(tracker.try_begin("web").is_none());

        guard.activate("t1");
        let task = tracker.task("web").unwrap();
        assert_eq!(task.task_id.as_deref(), Some("t1"));
        assert_eq!(task.status, DeployStatus::Pending);

        drop(guard);
        assert!(!tracker.is_deploying("web"));
    }

    #[test]
    fn track_respects_existing_task() {
        let tracker = DeployStateTracker::new();
        assert!(tracker.track("web", "t1"));
        assert!(tracker.track("web", "t1"));
        assert!(!tracker.track("web", "t2"));
        assert!(tracker.clear_task("web", "t1"));
        assert!(!tracker.clear_task("web", "t1"));
    }

    #[test]
    fn in_flight_snapshot_is_sorted() {
        let tracker = DeployStateTracker::new();
        tracker.track("zeta", "t1");
        tracker.track("alpha", "t2");
        let ids: Vec<String> = tracker
            .in_flight()
            .into_iter()
            .map(|t| t.deployment_id)
            .collect();
        assert_eq!(ids, ["alpha", "zeta"]);
    }
}
