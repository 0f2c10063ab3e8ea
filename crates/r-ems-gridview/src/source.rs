//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{GridViewError, Result, SourceKind};
use crate::model::{Telemetry, Topology};
use crate::scope::Scope;

/// Request/response access to the static grid structure.
#[async_trait]
pub trait TopologySource: Send + Sync + 'static {
    /// Fetch nodes and lines for `scope`. Must be idempotent.
    async fn fetch_topology(&self, scope: &Scope) -> Result<Topology>;
}

/// Request/response access to one point-in-time telemetry reading.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    /// Fetch the latest measurements for `scope`, keyed by raw entity id.
    async fn fetch_telemetry(&self, scope: &Scope) -> Result<Telemetry>;
}

/// In-memory topology feed keyed by scope.
#[derive(Debug, Default)]
pub struct InMemoryTopologySource {
    topologies: Mutex<HashMap<Scope, Topology>>,
    failing: Mutex<bool>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl InMemoryTopologySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(self, scope: Scope, topology: Topology) -> Self {
        self.insert(scope, topology);
        self
    }

    pub fn insert(&self, scope: Scope, topology: Topology) {
        self.topologies.lock().insert(scope, topology);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopologySource for InMemoryTopologySource {
    async fn fetch_topology(&self, scope: &Scope) -> Result<Topology> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock() {
            return Err(GridViewError::unavailable(
                SourceKind::Topology,
                "topology feed offline",
            ));
        }
        self.topologies.lock().get(scope).cloned().ok_or_else(|| {
            GridViewError::unavailable(SourceKind::Topology, format!("no topology for {scope}"))
        })
    }
}

/// One scripted telemetry response.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Duration,
    pub outcome: Result<Telemetry>,
}

impl ScriptStep {
    pub fn ok(telemetry: Telemetry) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(telemetry),
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(GridViewError::unavailable(SourceKind::Telemetry, message)),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Telemetry feed that replays a script. Once the script is exhausted the last step
/// repeats, so a steady feed needs a single step.
#[derive(Debug, Default)]
pub struct ScriptedTelemetrySource {
    script: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<ScriptStep>>,
    requests: Mutex<Vec<Scope>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTelemetrySource {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, step: ScriptStep) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requested_scopes(&self) -> Vec<Scope> {
        self.requests.lock().clone()
    }

    /// Highest number of concurrently running fetches observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut script = self.script.lock();
        let mut last = self.last.lock();
        if let Some(step) = script.pop_front() {
            *last = Some(step.clone());
        }
        last.clone()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetrySource {
    async fn fetch_telemetry(&self, scope: &Scope) -> Result<Telemetry> {
        self.requests.lock().push(scope.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let Some(step) = self.next_step() else {
            return Err(GridViewError::unavailable(
                SourceKind::Telemetry,
                "telemetry script is empty",
            ));
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        step.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{node, telemetry, topology};

    #[tokio::test]
    async fn in_memory_topology_is_keyed_by_scope() {
        let source = InMemoryTopologySource::new()
            .with_scope(Scope::site("a"), topology(vec![node("N1", 10.0)], vec![]));
        let fetched = source.fetch_topology(&Scope::site("a")).await.unwrap();
        assert_eq!(fetched.nodes.len(), 1);
        assert!(source.fetch_topology(&Scope::all()).await.is_err());

        source.set_failing(true);
        let err = source.fetch_topology(&Scope::site("a")).await.unwrap_err();
        assert!(matches!(
            err,
            GridViewError::SourceUnavailable {
                feed: SourceKind::Topology,
                ..
            }
        ));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn script_repeats_its_last_step() {
        let source = ScriptedTelemetrySource::new([
            ScriptStep::fail("boom"),
            ScriptStep::ok(telemetry(&[("N1", 1.0)], &[])),
        ]);
        let scope = Scope::all();
        assert!(source.fetch_telemetry(&scope).await.is_err());
        assert!(source.fetch_telemetry(&scope).await.is_ok());
        assert!(source.fetch_telemetry(&scope).await.is_ok());
        assert_eq!(source.calls(), 3);
        assert_eq!(source.peak_in_flight(), 1);
    }
}
