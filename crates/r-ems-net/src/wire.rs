//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! JSON bodies served by the upstream power-grid API and their conversion into the
//! grid view model.

use chrono::{DateTime, Utc};
use r_ems_gridview::{
    GeoPosition, GridAggregate, GridInfo, Line, LineMeasurement, LineStatus, Node, NodeKind,
    NodeMeasurement, NodeStatus, Telemetry, Topology,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Body of `GET /api/power-grid/state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridStateDto {
    /// Grid identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Short grid code.
    pub code: String,
    /// Region the grid belongs to.
    pub region: String,
    /// Nominal frequency in Hz.
    pub frequency: f64,
    /// Rated system voltage in kV.
    pub system_voltage: f64,
    /// Nodes in scope.
    pub nodes: Vec<NodeDto>,
    /// Lines in scope.
    pub lines: Vec<LineDto>,
    /// Total rated capacity in MW.
    pub total_capacity: f64,
    /// Load known to the topology service in MW.
    #[serde(default)]
    pub current_load: f64,
}

/// One node entry of the grid state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDto {
    /// Node identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Human code.
    pub code: String,
    /// `SUBSTATION`, `DISTRIBUTION_POINT`, `LOAD` or `TRANSFORMER`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Rated voltage in kV.
    pub voltage: f64,
    /// Rated capacity in MW.
    pub capacity: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Administrative status.
    pub status: String,
}

/// One line entry of the grid state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LineDto {
    /// Line identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Source node identifier.
    pub from_node_id: String,
    /// Target node identifier.
    pub to_node_id: String,
    /// Length in km.
    pub length: f64,
    /// Rated voltage in kV.
    pub voltage: f64,
    /// Rated capacity in MW.
    pub capacity: f64,
    /// Series resistance in ohm.
    pub resistance: f64,
    /// Series reactance in ohm.
    pub reactance: f64,
    /// Operational status.
    pub status: String,
}

/// Body of `GET /api/power-grid/data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridDataDto {
    /// Time the reading was taken.
    pub timestamp: DateTime<Utc>,
    /// Grid the reading belongs to.
    #[serde(default)]
    pub grid_id: String,
    /// Node readings.
    #[serde(default)]
    pub nodes: Vec<NodeReadingDto>,
    /// Line readings.
    #[serde(default)]
    pub lines: Vec<LineReadingDto>,
    /// Grid-wide aggregates.
    pub grid_metrics: GridMetricsDto,
}

/// Instantaneous node reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadingDto {
    /// Node the reading refers to.
    pub node_id: String,
    /// Voltage.
    pub voltage: f64,
    /// Current.
    pub current: f64,
    /// Active power in MW.
    pub power: f64,
    /// Power factor.
    pub power_factor: f64,
}

/// Instantaneous line reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LineReadingDto {
    /// Line the reading refers to.
    pub line_id: String,
    /// Power flow in MW.
    pub current_flow: f64,
    /// Losses in MW.
    pub power_loss: f64,
    /// Voltage drop.
    pub voltage_drop: f64,
    /// Load percentage computed upstream, if any.
    #[serde(default)]
    pub load_percentage: Option<f64>,
}

/// Grid-wide aggregates reported with each reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridMetricsDto {
    /// Total generation in MW.
    pub total_generation: f64,
    /// Total load in MW.
    pub total_load: f64,
    /// Total losses in MW.
    pub total_loss: f64,
    /// Measured frequency in Hz.
    pub frequency: f64,
    /// Measured system voltage in kV.
    pub system_voltage: f64,
}

/// State of the upstream telemetry generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedStatus {
    /// Not producing readings.
    Stopped,
    /// Producing readings.
    Running,
    /// Temporarily suspended.
    Paused,
}

impl FeedStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Stopped => "STOPPED",
            FeedStatus::Running => "RUNNING",
            FeedStatus::Paused => "PAUSED",
        }
    }
}

/// The status endpoint answers either with a bare string or `{"status": ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FeedStatusBody {
    /// `"RUNNING"`
    Bare(FeedStatus),
    /// `{"status": "RUNNING"}`
    Wrapped {
        /// Reported status.
        status: FeedStatus,
    },
}

impl From<FeedStatusBody> for FeedStatus {
    fn from(body: FeedStatusBody) -> Self {
        match body {
            FeedStatusBody::Bare(status) | FeedStatusBody::Wrapped { status } => status,
        }
    }
}

/// Map a wire node type onto the closed set of node kinds.
pub fn node_kind(raw: &str) -> Option<NodeKind> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "SUBSTATION" => Some(NodeKind::Substation),
        "DISTRIBUTION_POINT" => Some(NodeKind::DistributionPoint),
        "LOAD" => Some(NodeKind::Load),
        "TRANSFORMER" => Some(NodeKind::Transformer),
        "OTHER" => Some(NodeKind::Other),
        _ => None,
    }
}

/// Unknown node statuses are treated as inactive.
pub fn node_status(raw: &str) -> NodeStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "ACTIVE" => NodeStatus::Active,
        "MAINTENANCE" => NodeStatus::Maintenance,
        _ => NodeStatus::Inactive,
    }
}

/// `FAULT` and `ERROR` both map to a faulted line; anything unknown is inactive.
pub fn line_status(raw: &str) -> LineStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "ACTIVE" => LineStatus::Active,
        "FAULT" | "ERROR" => LineStatus::Fault,
        _ => LineStatus::Inactive,
    }
}

impl GridStateDto {
    /// Convert into a topology. Nodes of an unknown type are skipped; lines touching
    /// them are later dropped as dangling.
    pub fn into_topology(self) -> Topology {
        let nodes = self
            .nodes
            .into_iter()
            .filter_map(|dto| {
                let Some(kind) = node_kind(&dto.kind) else {
                    warn!(node_id = %dto.id, node_type = %dto.kind, "skipping node with unsupported type");
                    return None;
                };
                Some(Node {
                    status: node_status(&dto.status),
                    id: dto.id,
                    code: dto.code,
                    name: dto.name,
                    kind,
                    rated_voltage_kv: dto.voltage,
                    rated_capacity_mw: dto.capacity,
                    position: GeoPosition {
                        latitude: dto.latitude,
                        longitude: dto.longitude,
                    },
                    telemetry: None,
                })
            })
            .collect();
        let lines = self
            .lines
            .into_iter()
            .map(|dto| Line {
                status: line_status(&dto.status),
                id: dto.id,
                name: dto.name,
                from_node_id: dto.from_node_id,
                to_node_id: dto.to_node_id,
                length_km: dto.length,
                rated_voltage_kv: dto.voltage,
                rated_capacity_mw: dto.capacity,
                resistance_ohm: dto.resistance,
                reactance_ohm: dto.reactance,
                telemetry: None,
            })
            .collect();

        Topology {
            grid: GridInfo {
                id: self.id,
                name: self.name,
                code: self.code,
                region: self.region,
                frequency_hz: self.frequency,
                system_voltage_kv: self.system_voltage,
            },
            nodes,
            lines,
            total_capacity_mw: self.total_capacity,
            current_load_mw: self.current_load,
        }
    }
}

impl GridDataDto {
    /// Convert into a telemetry reading keyed by raw entity id.
    pub fn into_telemetry(self) -> Telemetry {
        Telemetry {
            timestamp: self.timestamp,
            nodes: self
                .nodes
                .into_iter()
                .map(|dto| NodeMeasurement {
                    node_id: dto.node_id,
                    voltage: dto.voltage,
                    current: dto.current,
                    power_mw: dto.power,
                    power_factor: dto.power_factor,
                })
                .collect(),
            lines: self
                .lines
                .into_iter()
                .map(|dto| LineMeasurement {
                    line_id: dto.line_id,
                    current_flow: dto.current_flow,
                    power_loss: dto.power_loss,
                    voltage_drop: dto.voltage_drop,
                    reported_load_percent: dto.load_percentage,
                })
                .collect(),
            aggregate: GridAggregate {
                total_generation_mw: self.grid_metrics.total_generation,
                total_load_mw: self.grid_metrics.total_load,
                total_loss_mw: self.grid_metrics.total_loss,
                frequency_hz: self.grid_metrics.frequency,
                system_voltage_kv: self.grid_metrics.system_voltage,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grid_state_keeps_other_nodes_and_skips_unknown_types() {
        let dto: GridStateDto = serde_json::from_value(json!({
            "id": "g-1",
            "name": "North",
            "code": "N",
            "region": "north",
            "frequency": 50.0,
            "systemVoltage": 220.0,
            "nodes": [
                {"id": "n1", "name": "A", "code": "A", "type": "SUBSTATION", "voltage": 220.0,
                 "capacity": 300.0, "latitude": 21.0, "longitude": 105.8, "status": "ACTIVE",
                 "powerFactor": 0.9},
                {"id": "n2", "name": "B", "code": "B", "type": "OTHER", "voltage": 22.0,
                 "capacity": 10.0, "latitude": 21.1, "longitude": 105.9, "status": "ACTIVE"},
                {"id": "n3", "name": "C", "code": "C", "type": "WIND_FARM", "voltage": 22.0,
                 "capacity": 40.0, "latitude": 21.2, "longitude": 106.0, "status": "ACTIVE"}
            ],
            "lines": [
                {"id": "l1", "name": "A-B", "fromNodeId": "n1", "toNodeId": "n2", "length": 4.2,
                 "voltage": 110.0, "capacity": 80.0, "resistance": 0.1, "reactance": 0.3,
                 "status": "ERROR"}
            ],
            "totalCapacity": 310.0,
            "currentLoad": 120.5
        }))
        .unwrap();

        let topology = dto.into_topology();
        let kinds: Vec<_> = topology.nodes.iter().map(|node| node.kind).collect();
        assert_eq!(kinds, vec![NodeKind::Substation, NodeKind::Other]);
        assert_eq!(topology.lines.len(), 1);
        assert_eq!(topology.lines[0].status, LineStatus::Fault);
        assert_eq!(topology.grid.system_voltage_kv, 220.0);
        assert_eq!(topology.current_load_mw, 120.5);
    }

    #[test]
    fn grid_data_keeps_upstream_percentage_for_diagnostics() {
        let dto: GridDataDto = serde_json::from_value(json!({
            "timestamp": "2024-05-01T10:00:00Z",
            "gridId": "g-1",
            "nodes": [{"nodeId": "n1", "voltage": 219.5, "current": 410.0, "power": 150.0,
                        "powerFactor": 0.93}],
            "lines": [{"lineId": "l1", "currentFlow": 60.0, "powerLoss": 1.2,
                        "voltageDrop": 0.8, "loadPercentage": 75.0}],
            "gridMetrics": {"totalGeneration": 155.0, "totalLoad": 150.0, "totalLoss": 5.0,
                             "frequency": 49.98, "systemVoltage": 219.0}
        }))
        .unwrap();

        let telemetry = dto.into_telemetry();
        assert_eq!(telemetry.nodes[0].power_mw, 150.0);
        assert_eq!(telemetry.lines[0].reported_load_percent, Some(75.0));
        assert_eq!(telemetry.aggregate.total_load_mw, 150.0);
        assert_eq!(telemetry.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn feed_status_accepts_bare_and_wrapped_bodies() {
        let bare: FeedStatusBody = serde_json::from_str("\"PAUSED\"").unwrap();
        assert_eq!(FeedStatus::from(bare), FeedStatus::Paused);
        let wrapped: FeedStatusBody = serde_json::from_str(r#"{"status":"RUNNING"}"#).unwrap();
        assert_eq!(FeedStatus::from(wrapped), FeedStatus::Running);
        assert!(serde_json::from_str::<FeedStatusBody>("\"BROKEN\"").is_err());
    }

    #[test]
    fn status_strings_are_case_insensitive() {
        assert_eq!(node_kind("distribution_point"), Some(NodeKind::DistributionPoint));
        assert_eq!(node_kind("other"), Some(NodeKind::Other));
        assert_eq!(node_kind("GENERATOR"), None);
        assert_eq!(node_status("Maintenance"), NodeStatus::Maintenance);
        assert_eq!(line_status("fault"), LineStatus::Fault);
        assert_eq!(line_status("MAINTENANCE"), LineStatus::Inactive);
    }
}
