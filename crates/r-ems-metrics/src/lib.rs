//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every family in `registry` using the Prometheus text exposition format.
pub fn render_text(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Scrape response for `registry`; a 500 when the families cannot be encoded.
pub fn text_response(registry: &Registry) -> Response {
    match render_text(registry) {
        Ok(body) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Bind `addr` and serve `registry` at `/metrics` until the exporter is shut down.
pub async fn spawn_exporter(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsExporter> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    let addr = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let router = Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry);

    let (shutdown, mut stop) = watch::channel(false);
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            })
            .await
            .context("metrics exporter stopped with an error")
    });
    info!(address = %addr, "metrics exporter listening");

    Ok(MetricsExporter {
        addr,
        shutdown,
        task,
    })
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    text_response(&registry)
}

/// Running `/metrics` exporter returned by [`spawn_exporter`].
#[derive(Debug)]
pub struct MetricsExporter {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl MetricsExporter {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Process-level gauges for the daemon.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    starts: IntCounter,
    poll_interval_ms: IntGauge,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry, version: &str) -> Result<Self> {
        let starts = IntCounter::with_opts(
            Opts::new(
                "r_ems_gridviewd_starts_total",
                "Grid view daemon starts",
            )
            .const_label("version", version),
        )?;
        registry.register(Box::new(starts.clone()))?;

        let poll_interval_ms = IntGauge::with_opts(Opts::new(
            "r_ems_gridviewd_poll_interval_milliseconds",
            "Configured telemetry poll interval",
        ))?;
        registry.register(Box::new(poll_interval_ms.clone()))?;

        Ok(Self {
            starts,
            poll_interval_ms,
        })
    }

    /// Record a start together with the effective poll interval.
    pub fn started(&self, poll_interval_ms: u64) {
        self.starts.inc();
        self.poll_interval_ms
            .set(i64::try_from(poll_interval_ms).unwrap_or(i64::MAX));
    }
}

/// Poll, fetch and publication counters for a running grid view.
#[derive(Clone, Debug)]
pub struct GridViewMetrics {
    registry: SharedRegistry,
    telemetry_polls: IntCounterVec,
    topology_fetches: IntCounterVec,
    skipped_ticks: IntCounter,
    integrity_violations: IntCounter,
    discarded_responses: IntCounterVec,
    publications: IntCounter,
    scope_changes: IntCounter,
    overloaded: IntGaugeVec,
}

impl GridViewMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let telemetry_polls = IntCounterVec::new(
            Opts::new(
                "r_ems_gridview_telemetry_polls_total",
                "Telemetry fetches by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(telemetry_polls.clone()))?;

        let topology_fetches = IntCounterVec::new(
            Opts::new(
                "r_ems_gridview_topology_fetches_total",
                "Topology fetches by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(topology_fetches.clone()))?;

        let skipped_ticks = IntCounter::with_opts(Opts::new(
            "r_ems_gridview_skipped_ticks_total",
            "Poll ticks dropped because a telemetry fetch was still in flight",
        ))?;
        registry.register(Box::new(skipped_ticks.clone()))?;

        let integrity_violations = IntCounter::with_opts(Opts::new(
            "r_ems_gridview_integrity_violations_total",
            "Lines dropped for referencing unknown nodes",
        ))?;
        registry.register(Box::new(integrity_violations.clone()))?;

        let discarded_responses = IntCounterVec::new(
            Opts::new(
                "r_ems_gridview_discarded_responses_total",
                "Responses discarded because their scope was superseded",
            ),
            &["feed"],
        )?;
        registry.register(Box::new(discarded_responses.clone()))?;

        let publications = IntCounter::with_opts(Opts::new(
            "r_ems_gridview_snapshot_publications_total",
            "Snapshots published to subscribers",
        ))?;
        registry.register(Box::new(publications.clone()))?;

        let scope_changes = IntCounter::with_opts(Opts::new(
            "r_ems_gridview_scope_changes_total",
            "Scope activations, including the initial one",
        ))?;
        registry.register(Box::new(scope_changes.clone()))?;

        let overloaded = IntGaugeVec::new(
            Opts::new(
                "r_ems_gridview_overloaded_elements",
                "Elements above 100% load in the current snapshot",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(overloaded.clone()))?;

        Ok(Self {
            registry,
            telemetry_polls,
            topology_fetches,
            skipped_ticks,
            integrity_violations,
            discarded_responses,
            publications,
            scope_changes,
            overloaded,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_telemetry_poll(&self, success: bool) {
        self.telemetry_polls
            .with_label_values(&[outcome(success)])
            .inc();
    }

    pub fn record_topology_fetch(&self, success: bool) {
        self.topology_fetches
            .with_label_values(&[outcome(success)])
            .inc();
    }

    pub fn inc_skipped_tick(&self) {
        self.skipped_ticks.inc();
    }

    pub fn add_integrity_violations(&self, count: usize) {
        self.integrity_violations.inc_by(count as u64);
    }

    pub fn record_discarded(&self, feed: &str) {
        self.discarded_responses.with_label_values(&[feed]).inc();
    }

    pub fn inc_publication(&self) {
        self.publications.inc();
    }

    pub fn inc_scope_change(&self) {
        self.scope_changes.inc();
    }

    pub fn set_overloaded(&self, nodes: usize, lines: usize) {
        self.overloaded.with_label_values(&["node"]).set(nodes as i64);
        self.overloaded.with_label_values(&["line"]).set(lines as i64);
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &Registry, name: &str, label: Option<(&str, &str)>) -> f64 {
        registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| match label {
                Some((key, value)) => metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == key && pair.get_value() == value),
                None => true,
            })
            .map(|metric| {
                if metric.has_counter() {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                }
            })
            .sum()
    }

    #[test]
    fn gridview_metrics_register_and_count() {
        let registry = new_registry();
        let metrics = GridViewMetrics::new(registry.clone()).unwrap();
        metrics.record_telemetry_poll(true);
        metrics.record_telemetry_poll(false);
        metrics.record_telemetry_poll(false);
        metrics.record_discarded("telemetry");
        metrics.set_overloaded(2, 1);

        assert_eq!(
            counter_value(
                &registry,
                "r_ems_gridview_telemetry_polls_total",
                Some(("outcome", "failure"))
            ),
            2.0
        );
        assert_eq!(
            counter_value(&registry, "r_ems_gridview_discarded_responses_total", None),
            1.0
        );
        assert_eq!(
            counter_value(
                &registry,
                "r_ems_gridview_overloaded_elements",
                Some(("kind", "node"))
            ),
            2.0
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        GridViewMetrics::new(registry.clone()).unwrap();
        assert!(GridViewMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_text_format() {
        let registry = new_registry();
        DaemonMetrics::new(&registry, "0.1.0").unwrap().started(250);
        let exporter = spawn_exporter(registry, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(exporter.addr().port(), 0);

        let response = reqwest::get(format!("http://{}/metrics", exporter.addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            TEXT_FORMAT
        );
        let body = response.text().await.unwrap();
        assert!(body.contains(r#"r_ems_gridviewd_starts_total{version="0.1.0"} 1"#));
        assert!(body.contains("r_ems_gridviewd_poll_interval_milliseconds 250"));
        exporter.shutdown().await.unwrap();
    }

    #[test]
    fn text_response_carries_exposition_content_type() {
        let registry = new_registry();
        GridViewMetrics::new(registry.clone()).unwrap().inc_scope_change();
        let response = text_response(&registry);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], TEXT_FORMAT);
        assert!(render_text(&registry)
            .unwrap()
            .contains("r_ems_gridview_scope_changes_total 1"));
    }
}
