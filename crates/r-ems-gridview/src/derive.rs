//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Derivation rules applied on every merge: referential integrity, load percentages,
//! and overload classification.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::IntegrityViolation;
use crate::model::{
    GridSnapshot, Line, LineMeasurement, LineTelemetry, Node, NodeMeasurement, NodeTelemetry,
    Telemetry, Topology,
};

/// Upper bound (inclusive) of the `normal` band, in percent of rated capacity.
pub const HIGH_LOAD_THRESHOLD: f64 = 80.0;
/// Upper bound (inclusive) of the `high` band.
pub const OVERLOAD_THRESHOLD: f64 = 100.0;

/// Divergence (percentage points) above which an upstream load figure is logged.
const REPORTED_LOAD_TOLERANCE: f64 = 0.5;

/// `value / capacity * 100`, or `None` when the ratio would be meaningless.
pub fn load_percent(value: f64, capacity: f64) -> Option<f64> {
    if !value.is_finite() || !capacity.is_finite() || capacity <= 0.0 {
        return None;
    }
    let percent = value / capacity * 100.0;
    percent.is_finite().then_some(percent)
}

/// Severity band for an element with a defined load percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadClass {
    Normal,
    High,
    Overloaded,
}

impl LoadClass {
    /// Classify by magnitude so reverse flow is rated like forward flow.
    pub fn from_percent(percent: f64) -> Option<Self> {
        if !percent.is_finite() {
            return None;
        }
        let magnitude = percent.abs();
        let class = if magnitude > OVERLOAD_THRESHOLD {
            LoadClass::Overloaded
        } else if magnitude > HIGH_LOAD_THRESHOLD {
            LoadClass::High
        } else {
            LoadClass::Normal
        };
        Some(class)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadClass::Normal => "normal",
            LoadClass::High => "high",
            LoadClass::Overloaded => "overloaded",
        }
    }
}

impl fmt::Display for LoadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub normal: usize,
    pub high: usize,
    pub overloaded: usize,
    /// Elements without telemetry or without a defined load percentage.
    pub unknown: usize,
}

impl ClassCounts {
    fn record(&mut self, class: Option<LoadClass>) {
        match class {
            Some(LoadClass::Normal) => self.normal += 1,
            Some(LoadClass::High) => self.high += 1,
            Some(LoadClass::Overloaded) => self.overloaded += 1,
            None => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverloadSummary {
    pub nodes: ClassCounts,
    pub lines: ClassCounts,
}

impl OverloadSummary {
    pub fn collect(snapshot: &GridSnapshot) -> Self {
        let mut summary = Self::default();
        for node in &snapshot.nodes {
            summary.nodes.record(node.load_class());
        }
        for line in &snapshot.lines {
            summary.lines.record(line.load_class());
        }
        summary
    }

    pub fn overloaded(&self) -> usize {
        self.nodes.overloaded + self.lines.overloaded
    }
}

/// Drop every line with an endpoint outside the node set and report each dangling reference.
pub fn validate_topology(mut topology: Topology) -> (Topology, Vec<IntegrityViolation>) {
    let violations = {
        let known: HashSet<&str> = topology.nodes.iter().map(|n| n.id.as_str()).collect();
        topology
            .lines
            .iter()
            .flat_map(|line| {
                [&line.from_node_id, &line.to_node_id]
                    .into_iter()
                    .filter(|endpoint| !known.contains(endpoint.as_str()))
                    .map(|endpoint| IntegrityViolation {
                        line_id: line.id.clone(),
                        missing_node_id: endpoint.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    };
    if !violations.is_empty() {
        let dropped: HashSet<String> = violations.iter().map(|v| v.line_id.clone()).collect();
        topology.lines.retain(|line| !dropped.contains(&line.id));
    }
    (topology, violations)
}

/// Merge topology with an optional telemetry reading into a fresh snapshot.
///
/// Every node and line is rebuilt from the topology, so telemetry from an earlier merge
/// never lingers. Entities without a matching measurement carry no telemetry at all, and
/// measurements for unknown ids are ignored.
pub fn merge(topology: &Topology, telemetry: Option<&Telemetry>) -> GridSnapshot {
    let known: HashSet<&str> = topology.nodes.iter().map(|n| n.id.as_str()).collect();
    let node_readings: HashMap<&str, &NodeMeasurement> = telemetry
        .map(|t| t.nodes.iter().map(|m| (m.node_id.as_str(), m)).collect())
        .unwrap_or_default();
    let line_readings: HashMap<&str, &LineMeasurement> = telemetry
        .map(|t| t.lines.iter().map(|m| (m.line_id.as_str(), m)).collect())
        .unwrap_or_default();

    let nodes = topology
        .nodes
        .iter()
        .map(|node| Node {
            telemetry: node_readings
                .get(node.id.as_str())
                .map(|m| node_telemetry(node, m)),
            ..node.clone()
        })
        .collect();

    let lines = topology
        .lines
        .iter()
        .filter(|line| {
            known.contains(line.from_node_id.as_str()) && known.contains(line.to_node_id.as_str())
        })
        .map(|line| Line {
            telemetry: line_readings
                .get(line.id.as_str())
                .map(|m| line_telemetry(line, m)),
            ..line.clone()
        })
        .collect();

    let aggregate = telemetry.map(|t| t.aggregate.clone());
    let current_load_mw = aggregate
        .as_ref()
        .map(|a| a.total_load_mw)
        .unwrap_or(topology.current_load_mw);

    GridSnapshot {
        grid: topology.grid.clone(),
        nodes,
        lines,
        total_capacity_mw: topology.total_capacity_mw,
        current_load_mw,
        aggregate,
    }
}

fn node_telemetry(node: &Node, reading: &NodeMeasurement) -> NodeTelemetry {
    NodeTelemetry {
        voltage: reading.voltage,
        current: reading.current,
        power_mw: reading.power_mw,
        power_factor: reading.power_factor,
        load_percent: load_percent(reading.power_mw, node.rated_capacity_mw),
    }
}

fn line_telemetry(line: &Line, reading: &LineMeasurement) -> LineTelemetry {
    let computed = load_percent(reading.current_flow, line.rated_capacity_mw);
    if let (Some(reported), Some(computed)) = (reading.reported_load_percent, computed) {
        if (reported - computed).abs() > REPORTED_LOAD_TOLERANCE {
            debug!(
                line_id = %line.id,
                reported,
                computed,
                "upstream line load percentage diverges from flow/capacity; using computed value"
            );
        }
    }
    LineTelemetry {
        current_flow: reading.current_flow,
        power_loss: reading.power_loss,
        voltage_drop: reading.voltage_drop,
        load_percent: computed,
    }
}
