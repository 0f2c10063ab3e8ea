//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::derive::{LoadClass, OverloadSummary};

/// Closed set of node kinds rendered on the grid view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Substation,
    DistributionPoint,
    Load,
    Transformer,
    /// Upstream element the grid model does not classify further.
    Other,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Substation => "substation",
            NodeKind::DistributionPoint => "distribution_point",
            NodeKind::Load => "load",
            NodeKind::Transformer => "transformer",
            NodeKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Active,
    Inactive,
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
}

/// Grid-wide identity and ratings reported with the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridInfo {
    pub id: String,
    pub name: String,
    pub code: String,
    pub region: String,
    pub frequency_hz: f64,
    pub system_voltage_kv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub code: String,
    pub name: String,
    pub kind: NodeKind,
    pub rated_voltage_kv: f64,
    pub rated_capacity_mw: f64,
    pub position: GeoPosition,
    pub status: NodeStatus,
    /// Present only once a measurement for this node has been merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<NodeTelemetry>,
}

impl Node {
    pub fn load_percent(&self) -> Option<f64> {
        self.telemetry.as_ref().and_then(|t| t.load_percent)
    }

    pub fn load_class(&self) -> Option<LoadClass> {
        self.load_percent().and_then(LoadClass::from_percent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub voltage: f64,
    pub current: f64,
    pub power_mw: f64,
    pub power_factor: f64,
    /// `None` when the rated capacity cannot support a percentage.
    pub load_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    pub name: String,
    pub from_node_id: String,
    pub to_node_id: String,
    pub length_km: f64,
    pub rated_voltage_kv: f64,
    pub rated_capacity_mw: f64,
    pub resistance_ohm: f64,
    pub reactance_ohm: f64,
    pub status: LineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<LineTelemetry>,
}

impl Line {
    pub fn load_percent(&self) -> Option<f64> {
        self.telemetry.as_ref().and_then(|t| t.load_percent)
    }

    pub fn load_class(&self) -> Option<LoadClass> {
        self.load_percent().and_then(LoadClass::from_percent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTelemetry {
    pub current_flow: f64,
    pub power_loss: f64,
    pub voltage_drop: f64,
    pub load_percent: Option<f64>,
}

/// Static structure for one scope, as returned by the topology feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub grid: GridInfo,
    pub nodes: Vec<Node>,
    pub lines: Vec<Line>,
    pub total_capacity_mw: f64,
    /// Load figure the topology feed last knew about, used until telemetry arrives.
    #[serde(default)]
    pub current_load_mw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeasurement {
    pub node_id: String,
    pub voltage: f64,
    pub current: f64,
    pub power_mw: f64,
    pub power_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineMeasurement {
    pub line_id: String,
    pub current_flow: f64,
    pub power_loss: f64,
    pub voltage_drop: f64,
    /// Percentage computed upstream. Never trusted; only compared for diagnostics.
    #[serde(default)]
    pub reported_load_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAggregate {
    pub total_generation_mw: f64,
    pub total_load_mw: f64,
    pub total_loss_mw: f64,
    pub frequency_hz: f64,
    pub system_voltage_kv: f64,
}

/// One point-in-time telemetry reading for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub timestamp: DateTime<Utc>,
    pub nodes: Vec<NodeMeasurement>,
    pub lines: Vec<LineMeasurement>,
    pub aggregate: GridAggregate,
}

/// Reconciled view model handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub grid: GridInfo,
    pub nodes: Vec<Node>,
    pub lines: Vec<Line>,
    pub total_capacity_mw: f64,
    pub current_load_mw: f64,
    /// Aggregate from the merged telemetry, absent in the topology-only state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<GridAggregate>,
}

impl GridSnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn line(&self, id: &str) -> Option<&Line> {
        self.lines.iter().find(|line| line.id == id)
    }

    /// Both endpoints of a line. Always `Some` for lines held by a snapshot.
    pub fn line_endpoints(&self, line: &Line) -> Option<(&Node, &Node)> {
        Some((self.node(&line.from_node_id)?, self.node(&line.to_node_id)?))
    }

    pub fn has_telemetry(&self) -> bool {
        self.aggregate.is_some()
    }

    /// Grid-wide utilisation, guarded the same way as per-element load.
    pub fn load_percent(&self) -> Option<f64> {
        crate::derive::load_percent(self.current_load_mw, self.total_capacity_mw)
    }

    pub fn overload_summary(&self) -> OverloadSummary {
        OverloadSummary::collect(self)
    }
}
