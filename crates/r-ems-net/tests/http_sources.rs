//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use r_ems_gridview::{
    GridView, GridViewError, LoadClass, Scope, SourceKind, TelemetrySource, TopologySource,
};
use r_ems_net::{FeedStatus, HttpGridSource};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone, Default)]
struct Upstream {
    sites: Arc<Mutex<Vec<Option<String>>>>,
    data_down: Arc<AtomicBool>,
    garbage: Arc<AtomicBool>,
}

fn grid_state() -> Value {
    json!({
        "id": "g-1", "name": "North", "code": "N", "region": "north",
        "frequency": 50.0, "systemVoltage": 110.0,
        "nodes": [
            {"id": "n1", "name": "Alpha", "code": "A", "type": "SUBSTATION", "voltage": 110.0,
             "capacity": 100.0, "latitude": 21.0, "longitude": 105.8, "status": "ACTIVE",
             "powerFactor": 0.95},
            {"id": "n2", "name": "Beta", "code": "B", "type": "LOAD", "voltage": 22.0,
             "capacity": 40.0, "latitude": 21.2, "longitude": 105.9, "status": "MAINTENANCE",
             "powerFactor": 0.9}
        ],
        "lines": [
            {"id": "l1", "name": "Alpha-Beta", "fromNodeId": "n1", "toNodeId": "n2",
             "length": 12.0, "voltage": 110.0, "capacity": 40.0, "resistance": 0.2,
             "reactance": 0.5, "status": "ACTIVE"},
            {"id": "l2", "name": "Alpha-Ghost", "fromNodeId": "n1", "toNodeId": "n9",
             "length": 3.0, "voltage": 22.0, "capacity": 10.0, "resistance": 0.1,
             "reactance": 0.2, "status": "ACTIVE"}
        ],
        "totalCapacity": 140.0,
        "currentLoad": 0.0
    })
}

fn grid_data() -> Value {
    json!({
        "timestamp": "2024-05-01T08:30:00Z",
        "gridId": "g-1",
        "nodes": [
            {"nodeId": "n1", "voltage": 109.2, "current": 450.0, "power": 85.0, "powerFactor": 0.94}
        ],
        "lines": [
            {"lineId": "l1", "currentFlow": 50.0, "powerLoss": 0.9, "voltageDrop": 1.1,
             "loadPercentage": 90.0}
        ],
        "gridMetrics": {"totalGeneration": 87.0, "totalLoad": 85.0, "totalLoss": 2.0,
                        "frequency": 49.97, "systemVoltage": 109.5}
    })
}

async fn state(
    State(upstream): State<Upstream>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    upstream.sites.lock().push(query.get("siteId").cloned());
    Json(grid_state())
}

async fn data(State(upstream): State<Upstream>) -> Response {
    if upstream.data_down.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "generator offline").into_response();
    }
    if upstream.garbage.load(Ordering::SeqCst) {
        return (StatusCode::OK, "<html>not json</html>").into_response();
    }
    Json(grid_data()).into_response()
}

async fn status() -> Json<Value> {
    json!("RUNNING").into()
}

async fn spawn_upstream(upstream: Upstream) -> SocketAddr {
    let router = Router::new()
        .route("/api/power-grid/state", get(state))
        .route("/api/power-grid/data", get(data))
        .route("/api/power-grid/status", get(status))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

fn source_for(addr: SocketAddr) -> HttpGridSource {
    HttpGridSource::new(
        Url::parse(&format!("http://{addr}")).unwrap(),
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn topology_and_telemetry_decode_with_site_selector() {
    let upstream = Upstream::default();
    let addr = spawn_upstream(upstream.clone()).await;
    let source = source_for(addr);

    let topology = source.fetch_topology(&Scope::site("hn-01")).await.unwrap();
    assert_eq!(topology.nodes.len(), 2);
    assert_eq!(topology.lines.len(), 2);
    source.fetch_topology(&Scope::all()).await.unwrap();
    assert_eq!(
        *upstream.sites.lock(),
        vec![Some("hn-01".to_string()), None]
    );

    let telemetry = source.fetch_telemetry(&Scope::all()).await.unwrap();
    assert_eq!(telemetry.nodes[0].node_id, "n1");
    assert_eq!(telemetry.lines[0].reported_load_percent, Some(90.0));
    assert_eq!(telemetry.aggregate.frequency_hz, 49.97);

    assert_eq!(source.fetch_feed_status().await.unwrap(), FeedStatus::Running);
}

#[tokio::test]
async fn failures_surface_as_source_unavailable() {
    let upstream = Upstream::default();
    let addr = spawn_upstream(upstream.clone()).await;
    let source = source_for(addr);

    upstream.data_down.store(true, Ordering::SeqCst);
    let err = source.fetch_telemetry(&Scope::all()).await.unwrap_err();
    assert!(matches!(
        &err,
        GridViewError::SourceUnavailable { feed: SourceKind::Telemetry, message } if message.contains("503")
    ));

    upstream.data_down.store(false, Ordering::SeqCst);
    upstream.garbage.store(true, Ordering::SeqCst);
    let err = source.fetch_telemetry(&Scope::all()).await.unwrap_err();
    assert!(matches!(
        err,
        GridViewError::SourceUnavailable {
            feed: SourceKind::Telemetry,
            ..
        }
    ));

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);
    let err = source_for(dead_addr)
        .fetch_topology(&Scope::all())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GridViewError::SourceUnavailable {
            feed: SourceKind::Topology,
            ..
        }
    ));
}

#[tokio::test]
async fn grid_view_over_http_keeps_last_good_snapshot() {
    let upstream = Upstream::default();
    let addr = spawn_upstream(upstream.clone()).await;
    let source = Arc::new(source_for(addr));
    let view = GridView::builder(source.clone(), source)
        .poll_interval(Duration::from_millis(50))
        .start();
    let mut snapshots = view.watch();

    let merged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = snapshots.borrow_and_update().clone() {
                if snapshot.has_telemetry() {
                    return snapshot;
                }
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let n1 = merged.node("n1").unwrap();
    assert_eq!(n1.load_percent(), Some(85.0));
    assert_eq!(n1.load_class(), Some(LoadClass::High));
    assert!(merged.node("n2").unwrap().telemetry.is_none());
    let l1 = merged.line("l1").unwrap();
    assert_eq!(l1.load_percent(), Some(125.0));
    assert_eq!(l1.load_class(), Some(LoadClass::Overloaded));
    assert!(merged.line("l2").is_none());
    assert_eq!(view.status().warnings.len(), 1);
    assert_eq!(merged.current_load_mw, 85.0);

    upstream.data_down.store(true, Ordering::SeqCst);
    let mut statuses = view.watch_status();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !statuses.borrow_and_update().stale {
            statuses.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(*view.snapshot().unwrap(), *merged);
    view.stop();
}
