//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixture builders for grid view tests and demos."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Compact builders for topology and telemetry fixtures. Ratings not named by the
//! builder arguments are fixed at plausible 110 kV values.

use chrono::{TimeZone, Utc};

use crate::model::{
    GeoPosition, GridAggregate, GridInfo, Line, LineMeasurement, LineStatus, Node, NodeKind,
    NodeMeasurement, NodeStatus, Telemetry, Topology,
};

pub fn node(id: &str, capacity_mw: f64) -> Node {
    Node {
        id: id.to_owned(),
        code: format!("{id}-CODE"),
        name: format!("Node {id}"),
        kind: NodeKind::Substation,
        rated_voltage_kv: 110.0,
        rated_capacity_mw: capacity_mw,
        position: GeoPosition {
            latitude: 21.0,
            longitude: 105.8,
        },
        status: NodeStatus::Active,
        telemetry: None,
    }
}

pub fn line(id: &str, from: &str, to: &str, capacity_mw: f64) -> Line {
    Line {
        id: id.to_owned(),
        name: format!("Line {id}"),
        from_node_id: from.to_owned(),
        to_node_id: to.to_owned(),
        length_km: 12.5,
        rated_voltage_kv: 110.0,
        rated_capacity_mw: capacity_mw,
        resistance_ohm: 0.12,
        reactance_ohm: 0.4,
        status: LineStatus::Active,
        telemetry: None,
    }
}

pub fn topology(nodes: Vec<Node>, lines: Vec<Line>) -> Topology {
    let total_capacity_mw = nodes.iter().map(|n| n.rated_capacity_mw).sum();
    Topology {
        grid: GridInfo {
            id: "grid-test".into(),
            name: "Test Grid".into(),
            code: "TG".into(),
            region: "north".into(),
            frequency_hz: 50.0,
            system_voltage_kv: 110.0,
        },
        nodes,
        lines,
        total_capacity_mw,
        current_load_mw: 0.0,
    }
}

/// Telemetry with `(node_id, power_mw)` and `(line_id, flow_mw)` readings.
pub fn telemetry(nodes: &[(&str, f64)], lines: &[(&str, f64)]) -> Telemetry {
    let total_load_mw = nodes.iter().map(|(_, power)| power).sum();
    Telemetry {
        timestamp: Utc
            .with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
        nodes: nodes
            .iter()
            .map(|(id, power)| NodeMeasurement {
                node_id: (*id).to_owned(),
                voltage: 110_000.0,
                current: power * 5.0,
                power_mw: *power,
                power_factor: 0.95,
            })
            .collect(),
        lines: lines
            .iter()
            .map(|(id, flow)| LineMeasurement {
                line_id: (*id).to_owned(),
                current_flow: *flow,
                power_loss: flow * 0.02,
                voltage_drop: flow * 0.01,
                reported_load_percent: None,
            })
            .collect(),
        aggregate: GridAggregate {
            total_generation_mw: total_load_mw,
            total_load_mw,
            total_loss_mw: 0.0,
            frequency_hz: 50.0,
            system_voltage_kv: 110.0,
        },
    }
}
