//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Scope controller tying sources, engine, poller and publisher together.
//!
//! Every fetch carries the [`ScopeTag`] it was issued under. Completions are applied in
//! one short critical section that checks the tag, updates the engine and publishes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use r_ems_metrics::GridViewMetrics;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{EngineState, ReconciliationEngine};
use crate::errors::{GridViewError, Result, SourceKind};
use crate::model::{Telemetry, Topology};
use crate::poller::{Poller, PollerHandle, PollerStats, MIN_POLL_PERIOD};
use crate::publisher::{GridStatus, SharedSnapshot, SnapshotPublisher, Subscription};
use crate::scope::{Scope, ScopeTag, ScopeTracker};
use crate::source::{TelemetrySource, TopologySource};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);

/// Builder for a [`GridView`].
pub struct GridViewBuilder {
    topology_source: Arc<dyn TopologySource>,
    telemetry_source: Arc<dyn TelemetrySource>,
    poll_interval: Duration,
    initial_scope: Scope,
    metrics: Option<GridViewMetrics>,
}

impl GridViewBuilder {
    /// Telemetry poll period; anything below [`MIN_POLL_PERIOD`] is raised to it.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_PERIOD);
        self
    }

    pub fn initial_scope(mut self, scope: Scope) -> Self {
        self.initial_scope = scope;
        self
    }

    pub fn metrics(mut self, metrics: GridViewMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Activate the initial scope and start polling. Must be called from within a
    /// Tokio runtime.
    pub fn start(self) -> GridView {
        let runtime = Handle::current();
        let inner = Arc::new(Inner {
            topology_source: self.topology_source,
            telemetry_source: self.telemetry_source,
            poll_interval: self.poll_interval,
            publisher: SnapshotPublisher::new(self.initial_scope.clone(), runtime.clone()),
            runtime,
            metrics: self.metrics,
            state: Mutex::new(ViewState::default()),
        });
        info!(
            scope = %self.initial_scope,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "grid view starting"
        );
        let view = GridView { inner };
        view.set_scope(self.initial_scope);
        view
    }
}

/// Live, scope-aware view of the grid.
///
/// Dropping the view stops it.
pub struct GridView {
    inner: Arc<Inner>,
}

impl GridView {
    pub fn builder(
        topology_source: Arc<dyn TopologySource>,
        telemetry_source: Arc<dyn TelemetrySource>,
    ) -> GridViewBuilder {
        GridViewBuilder {
            topology_source,
            telemetry_source,
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_scope: Scope::all(),
            metrics: None,
        }
    }

    /// Switch to `scope`. Returns `false` when it is already active or the view is
    /// stopped; otherwise the previous scope's data is dropped before this returns.
    pub fn set_scope(&self, scope: Scope) -> bool {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return false;
        }
        let Some(tag) = state.tracker.activate(scope) else {
            debug!("scope unchanged; keeping current poller");
            return false;
        };
        self.inner.activate(&mut state, tag);
        true
    }

    /// Re-fetch topology for the active scope while keeping telemetry. Returns `false`
    /// if the view is stopped or a topology fetch is already running.
    pub fn refresh_topology(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.stopped || state.topology_in_flight {
            return false;
        }
        let Some(tag) = state.tracker.active().cloned() else {
            return false;
        };
        debug!(scope = %tag.scope, generation = tag.generation, "topology refresh requested");
        self.inner.spawn_topology_fetch(&mut state, tag);
        true
    }

    /// Stop polling and notifications. In-flight requests finish but are ignored.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        if let Some(poller) = state.poller.take() {
            poller.stop();
        }
        state.tracker.deactivate();
        self.inner.publisher.close();
        info!("grid view stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    pub fn scope(&self) -> Option<Scope> {
        self.inner
            .state
            .lock()
            .tracker
            .active()
            .map(|tag| tag.scope.clone())
    }

    pub fn snapshot(&self) -> SharedSnapshot {
        self.inner.publisher.current()
    }

    pub fn status(&self) -> GridStatus {
        self.inner.publisher.status()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.publisher.is_loading()
    }

    pub fn last_error(&self) -> Option<GridViewError> {
        self.inner.publisher.last_error()
    }

    pub fn engine_state(&self) -> EngineState {
        self.inner.state.lock().engine.state()
    }

    /// Counters of the active scope's poller.
    pub fn poller_stats(&self) -> Option<PollerStats> {
        self.inner
            .state
            .lock()
            .poller
            .as_ref()
            .map(PollerHandle::stats)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(SharedSnapshot) + Send + 'static,
    {
        self.inner.publisher.subscribe(callback)
    }

    pub fn watch(&self) -> watch::Receiver<SharedSnapshot> {
        self.inner.publisher.watch()
    }

    pub fn watch_status(&self) -> watch::Receiver<GridStatus> {
        self.inner.publisher.watch_status()
    }
}

impl Drop for GridView {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct ViewState {
    tracker: ScopeTracker,
    engine: ReconciliationEngine,
    poller: Option<PollerHandle>,
    last_error: Option<GridViewError>,
    topology_in_flight: bool,
    stopped: bool,
}

struct Inner {
    topology_source: Arc<dyn TopologySource>,
    telemetry_source: Arc<dyn TelemetrySource>,
    poll_interval: Duration,
    runtime: Handle,
    metrics: Option<GridViewMetrics>,
    publisher: SnapshotPublisher,
    state: Mutex<ViewState>,
}

impl Inner {
    fn activate(self: &Arc<Self>, state: &mut ViewState, tag: ScopeTag) {
        if let Some(previous) = state.poller.take() {
            previous.stop();
        }
        state.engine.reset();
        state.last_error = None;
        state.topology_in_flight = false;
        self.publisher.begin_scope(tag.scope.clone());
        if let Some(metrics) = &self.metrics {
            metrics.inc_scope_change();
        }
        info!(scope = %tag.scope, generation = tag.generation, "scope activated");

        self.spawn_topology_fetch(state, tag.clone());
        state.poller = Some(self.spawn_poller(tag));
    }

    fn spawn_poller(self: &Arc<Self>, tag: ScopeTag) -> PollerHandle {
        let weak = Arc::downgrade(self);
        let metrics = self.metrics.clone();
        Poller::new(tag.scope.to_string(), self.poll_interval)
            .on_skip(move || {
                if let Some(metrics) = &metrics {
                    metrics.inc_skipped_tick();
                }
            })
            .spawn_on(&self.runtime, {
                let mut first = true;
                move || {
                    // Activation already issued the topology fetch for this tag.
                    let retry_topology = !std::mem::replace(&mut first, false);
                    poll_once(weak.clone(), tag.clone(), retry_topology)
                }
            })
    }

    fn spawn_topology_fetch(self: &Arc<Self>, state: &mut ViewState, tag: ScopeTag) {
        state.topology_in_flight = true;
        let weak = Arc::downgrade(self);
        let source = Arc::clone(&self.topology_source);
        self.runtime.spawn(async move {
            let result = source.fetch_topology(&tag.scope).await;
            if let Some(inner) = weak.upgrade() {
                inner.apply_topology(&tag, result);
            }
        });
    }

    /// Kick a topology retry if the last attempt failed before any topology arrived.
    fn retry_topology_if_empty(self: &Arc<Self>, tag: &ScopeTag) {
        let mut state = self.state.lock();
        if state.stopped || !state.tracker.is_current(tag) {
            return;
        }
        if state.engine.state() == EngineState::Empty && !state.topology_in_flight {
            debug!(scope = %tag.scope, "retrying topology fetch");
            self.spawn_topology_fetch(&mut state, tag.clone());
        }
    }

    fn apply_topology(&self, tag: &ScopeTag, result: Result<Topology>) {
        let mut state = self.state.lock();
        if !self.accepts(&state, tag, SourceKind::Topology) {
            return;
        }
        state.topology_in_flight = false;
        match result {
            Ok(topology) => {
                let violations = state.engine.receive_topology(topology).len();
                state.last_error = None;
                if let Some(metrics) = &self.metrics {
                    metrics.record_topology_fetch(true);
                    metrics.add_integrity_violations(violations);
                }
            }
            Err(err) => {
                warn!(scope = %tag.scope, error = %err, "topology fetch failed");
                state.last_error = Some(err);
                if let Some(metrics) = &self.metrics {
                    metrics.record_topology_fetch(false);
                }
            }
        }
        self.publish(&state, tag);
    }

    fn apply_telemetry(&self, tag: &ScopeTag, result: Result<Telemetry>) {
        let mut state = self.state.lock();
        if !self.accepts(&state, tag, SourceKind::Telemetry) {
            return;
        }
        match result {
            Ok(telemetry) => {
                let engine_state = state.engine.receive_telemetry(telemetry);
                if engine_state != EngineState::Empty {
                    state.last_error = None;
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_telemetry_poll(true);
                }
            }
            Err(err) => {
                warn!(
                    scope = %tag.scope,
                    error = %err,
                    has_snapshot = state.engine.snapshot().is_some(),
                    "telemetry fetch failed; keeping last-known-good snapshot"
                );
                state.engine.receive_telemetry_failure(err.clone());
                state.last_error = Some(err);
                if let Some(metrics) = &self.metrics {
                    metrics.record_telemetry_poll(false);
                }
            }
        }
        self.publish(&state, tag);
    }

    /// Whether a completion for `tag` may touch the engine. Superseded tags are
    /// discarded as a scope mismatch.
    fn accepts(&self, state: &ViewState, tag: &ScopeTag, feed: SourceKind) -> bool {
        if state.tracker.is_current(tag) {
            return true;
        }
        if let Some(active) = state.tracker.active() {
            let mismatch = GridViewError::ScopeMismatch {
                received: tag.scope.clone(),
                active: active.scope.clone(),
            };
            debug!(%feed, generation = tag.generation, reason = %mismatch, "late response discarded");
            if let Some(metrics) = &self.metrics {
                metrics.record_discarded(feed.as_str());
            }
        }
        false
    }

    fn publish(&self, state: &ViewState, tag: &ScopeTag) {
        let snapshot = state.engine.snapshot();
        let error = state
            .last_error
            .clone()
            .filter(GridViewError::is_user_visible);
        let status = GridStatus {
            scope: tag.scope.clone(),
            loading: snapshot.is_none(),
            stale: snapshot.is_some() && error.is_some(),
            error,
            warnings: state.engine.violations().to_vec(),
            last_telemetry_at: state.engine.telemetry_timestamp(),
        };

        if self.publisher.publish(snapshot.clone()) {
            if let Some(snapshot) = &snapshot {
                let summary = snapshot.overload_summary();
                debug!(
                    scope = %tag.scope,
                    nodes = snapshot.nodes.len(),
                    lines = snapshot.lines.len(),
                    overloaded = summary.overloaded(),
                    "snapshot published"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_publication();
                    metrics.set_overloaded(summary.nodes.overloaded, summary.lines.overloaded);
                }
            }
        }
        self.publisher.publish_status(status);
    }
}

async fn poll_once(inner: Weak<Inner>, tag: ScopeTag, retry_topology: bool) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if retry_topology {
        inner.retry_topology_if_empty(&tag);
    }
    if !inner.state.lock().tracker.is_current(&tag) {
        return;
    }
    let source = Arc::clone(&inner.telemetry_source);
    let result = source.fetch_telemetry(&tag.scope).await;
    inner.apply_telemetry(&tag, result);
}
