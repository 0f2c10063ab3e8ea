//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::errors::{GridViewError, IntegrityViolation};
use crate::model::GridSnapshot;
use crate::scope::Scope;

pub type SharedSnapshot = Option<Arc<GridSnapshot>>;

/// Consumer-facing health of the view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridStatus {
    pub scope: Scope,
    /// True from scope activation until the first snapshot is available.
    pub loading: bool,
    pub error: Option<GridViewError>,
    /// A snapshot is shown but the most recent fetch failed.
    pub stale: bool,
    #[serde(default)]
    pub warnings: Vec<IntegrityViolation>,
    pub last_telemetry_at: Option<DateTime<Utc>>,
}

impl GridStatus {
    pub fn loading(scope: Scope) -> Self {
        Self {
            scope,
            loading: true,
            error: None,
            stale: false,
            warnings: Vec::new(),
            last_telemetry_at: None,
        }
    }
}

/// Publishes snapshots and status to consumers. Notifications only fire on content
/// changes.
#[derive(Debug)]
pub struct SnapshotPublisher {
    snapshot_tx: watch::Sender<SharedSnapshot>,
    status_tx: watch::Sender<GridStatus>,
    closed_tx: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    runtime: Handle,
}

impl SnapshotPublisher {
    pub fn new(scope: Scope, runtime: Handle) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(GridStatus::loading(scope));
        let (closed_tx, _) = watch::channel(false);
        Self {
            snapshot_tx,
            status_tx,
            closed_tx,
            closed: Arc::new(AtomicBool::new(false)),
            runtime,
        }
    }

    /// Publish a snapshot. Returns whether subscribers were notified.
    pub fn publish(&self, snapshot: SharedSnapshot) -> bool {
        if self.is_closed() {
            return false;
        }
        self.snapshot_tx.send_if_modified(|current| {
            if current.as_deref() == snapshot.as_deref() {
                return false;
            }
            *current = snapshot;
            true
        })
    }

    pub fn publish_status(&self, status: GridStatus) -> bool {
        if self.is_closed() {
            return false;
        }
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        })
    }

    /// Drop the current snapshot and mark the view as loading `scope`.
    pub fn begin_scope(&self, scope: Scope) {
        self.publish(None);
        self.publish_status(GridStatus::loading(scope));
    }

    /// Stop all further notifications and end subscriber tasks.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> SharedSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn status(&self) -> GridStatus {
        self.status_tx.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.status_tx.borrow().loading
    }

    pub fn last_error(&self) -> Option<GridViewError> {
        self.status_tx.borrow().error.clone()
    }

    pub fn watch(&self) -> watch::Receiver<SharedSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<GridStatus> {
        self.status_tx.subscribe()
    }

    /// Invoke `callback` on every snapshot change until the subscription is dropped.
    pub fn subscribe<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(SharedSnapshot) + Send + 'static,
    {
        let mut snapshots = self.snapshot_tx.subscribe();
        let mut closed_rx = self.closed_tx.subscribe();
        let closed = Arc::clone(&self.closed);
        let task = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = closed_rx.changed() => break,
                }
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                callback(snapshot);
            }
            trace!("snapshot subscriber finished");
        });
        Subscription { task: Some(task) }
    }
}

/// Live subscription. Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::merge;
    use crate::testing::{node, telemetry, topology};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn snapshot(power: f64) -> Arc<GridSnapshot> {
        let topo = topology(vec![node("N1", 100.0)], vec![]);
        Arc::new(merge(&topo, Some(&telemetry(&[("N1", power)], &[]))))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn identical_content_does_not_notify() {
        let publisher = SnapshotPublisher::new(Scope::all(), Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = publisher.subscribe(move |snap| {
            sink.lock().push(snap.and_then(|s| s.node("N1").and_then(|n| n.load_percent())));
        });

        assert!(publisher.publish(Some(snapshot(40.0))));
        settle().await;
        assert!(!publisher.publish(Some(snapshot(40.0))));
        settle().await;
        assert!(publisher.publish(Some(snapshot(90.0))));
        settle().await;

        assert_eq!(*seen.lock(), vec![Some(40.0), Some(90.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_scope_clears_snapshot_and_sets_loading() {
        let publisher = SnapshotPublisher::new(Scope::all(), Handle::current());
        publisher.publish(Some(snapshot(10.0)));
        publisher.publish_status(GridStatus {
            loading: false,
            ..GridStatus::loading(Scope::all())
        });
        assert!(!publisher.is_loading());

        publisher.begin_scope(Scope::site("b"));
        assert!(publisher.current().is_none());
        assert!(publisher.is_loading());
        assert_eq!(publisher.status().scope, Scope::site("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn close_and_unsubscribe_stop_callbacks() {
        let publisher = SnapshotPublisher::new(Scope::all(), Handle::current());
        let count = Arc::new(Mutex::new(0usize));
        let (a, b) = (Arc::clone(&count), Arc::clone(&count));
        let dropped = publisher.subscribe(move |_| *a.lock() += 1);
        let kept = publisher.subscribe(move |_| *b.lock() += 1);

        dropped.unsubscribe();
        publisher.publish(Some(snapshot(1.0)));
        settle().await;
        assert_eq!(*count.lock(), 1);

        publisher.close();
        assert!(!publisher.publish(Some(snapshot(2.0))));
        settle().await;
        assert_eq!(*count.lock(), 1);
        assert!(!kept.is_active());
    }
}
