//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::derive::{merge, validate_topology};
use crate::errors::{GridViewError, IntegrityViolation};
use crate::model::{GridSnapshot, Telemetry, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No topology yet. Telemetry received here is buffered.
    Empty,
    /// Topology present, snapshot carries no telemetry fields.
    TopologyOnly,
    Merged,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Empty => "empty",
            EngineState::TopologyOnly => "topology_only",
            EngineState::Merged => "merged",
        };
        f.write_str(label)
    }
}

/// Holds last-known-good topology and telemetry and the snapshot derived from them.
///
/// The snapshot `Arc` is only replaced when a recompute yields different content, so
/// pointer identity doubles as a cheap change marker for callers.
#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    topology: Option<Topology>,
    telemetry: Option<Telemetry>,
    snapshot: Option<Arc<GridSnapshot>>,
    violations: Vec<IntegrityViolation>,
    last_failure: Option<GridViewError>,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EngineState {
        match (&self.topology, &self.telemetry) {
            (None, _) => EngineState::Empty,
            (Some(_), None) => EngineState::TopologyOnly,
            (Some(_), Some(_)) => EngineState::Merged,
        }
    }

    /// Accept a topology, dropping dangling lines. Returns the violations found.
    pub fn receive_topology(&mut self, topology: Topology) -> &[IntegrityViolation] {
        let (topology, violations) = validate_topology(topology);
        for violation in &violations {
            warn!(
                line_id = %violation.line_id,
                missing_node_id = %violation.missing_node_id,
                "dropping line with dangling endpoint"
            );
        }
        debug!(
            grid_id = %topology.grid.id,
            nodes = topology.nodes.len(),
            lines = topology.lines.len(),
            buffered_telemetry = self.telemetry.is_some(),
            "topology accepted"
        );
        self.topology = Some(topology);
        self.violations = violations;
        self.recompute();
        &self.violations
    }

    /// Accept a telemetry reading. In [`EngineState::Empty`] it is buffered until a
    /// topology arrives.
    pub fn receive_telemetry(&mut self, telemetry: Telemetry) -> EngineState {
        self.telemetry = Some(telemetry);
        self.last_failure = None;
        if self.topology.is_some() {
            self.recompute();
        } else {
            debug!("telemetry buffered until topology arrives");
        }
        self.state()
    }

    /// Record a failed telemetry fetch. The merged snapshot is left untouched.
    pub fn receive_telemetry_failure(&mut self, error: GridViewError) {
        debug!(state = %self.state(), error = %error, "retaining last-known-good telemetry");
        self.last_failure = Some(error);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> Option<Arc<GridSnapshot>> {
        self.snapshot.clone()
    }

    pub fn violations(&self) -> &[IntegrityViolation] {
        &self.violations
    }

    pub fn last_failure(&self) -> Option<&GridViewError> {
        self.last_failure.as_ref()
    }

    pub fn telemetry_timestamp(&self) -> Option<DateTime<Utc>> {
        self.telemetry.as_ref().map(|t| t.timestamp)
    }

    fn recompute(&mut self) {
        let Some(topology) = &self.topology else {
            return;
        };
        let merged = merge(topology, self.telemetry.as_ref());
        if self.snapshot.as_deref() != Some(&merged) {
            self.snapshot = Some(Arc::new(merged));
        }
    }
}
