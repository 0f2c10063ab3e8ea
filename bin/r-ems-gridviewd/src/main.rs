//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the R-EMS grid view daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r_ems_common::config::AppConfig;
use r_ems_common::logging::init_tracing;
use r_ems_gridview::{
    GridView, ReconciliationEngine, Scope, SharedSnapshot, TelemetrySource, TopologySource,
};
use r_ems_metrics::{new_registry, spawn_exporter, DaemonMetrics, GridViewMetrics};
use r_ems_net::{GridApiBuilder, HttpGridSource};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-EMS grid view ", env!("CARGO_PKG_VERSION")),
    about = "R-EMS grid view daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "SITE", help = "Restrict the view to one site")]
    site: Option<String>,

    #[arg(
        long,
        value_name = "MS",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Override the telemetry poll interval"
    )]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the live grid view")]
    Run,
    #[command(about = "Fetch topology and telemetry once and print the merged snapshot")]
    Once,
    #[command(about = "Query the upstream telemetry generator state")]
    FeedStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/gridview.toml"));
    candidates.push(PathBuf::from("configs/gridview.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;

    if let Some(site) = cli.site {
        config.scope.site = Some(site);
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.polling.interval = Duration::from_millis(interval);
    }

    init_tracing("r-ems-gridviewd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let scope = Scope::from_selector(config.scope.site.clone());
    let source = Arc::new(HttpGridSource::from_config(&config.source)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, scope, source).await?,
        Commands::Once => fetch_once(&scope, &source).await?,
        Commands::FeedStatus => {
            let status = source
                .fetch_feed_status()
                .await
                .context("feed status request failed")?;
            info!(status = status.as_str(), base_url = %source.base_url(), "feed status");
            println!("{}", status.as_str());
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, scope: Scope, source: Arc<HttpGridSource>) -> Result<()> {
    let registry = new_registry();
    DaemonMetrics::new(&registry, env!("CARGO_PKG_VERSION"))?
        .started(config.polling.interval.as_millis() as u64);
    let view_metrics = GridViewMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_exporter(registry.clone(), config.metrics.listen).await?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let view = Arc::new(
        GridView::builder(source.clone(), source)
            .poll_interval(config.polling.interval)
            .initial_scope(scope.clone())
            .metrics(view_metrics)
            .start(),
    );

    let subscription = view.subscribe(|snapshot: SharedSnapshot| {
        let Some(snapshot) = snapshot else {
            return;
        };
        let summary = snapshot.overload_summary();
        info!(
            nodes = snapshot.nodes.len(),
            lines = snapshot.lines.len(),
            telemetry = snapshot.has_telemetry(),
            load_percent = ?snapshot.load_percent(),
            high = summary.nodes.high + summary.lines.high,
            overloaded = summary.overloaded(),
            "grid snapshot updated"
        );
        if summary.overloaded() > 0 {
            warn!(
                nodes = summary.nodes.overloaded,
                lines = summary.lines.overloaded,
                "grid elements above capacity"
            );
        }
    });

    let api_server = if config.api.enabled {
        match GridApiBuilder::new(config.api.listen, view.clone())
            .with_metrics_registry(registry.clone())
            .spawn()
            .await
        {
            Ok(server) => Some(server),
            Err(err) => {
                warn!(error = %err, "failed to start grid api");
                None
            }
        }
    } else {
        info!("grid api disabled by configuration");
        None
    };

    info!(%scope, interval_ms = config.polling.interval.as_millis() as u64, "grid view running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    subscription.unsubscribe();
    view.stop();

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

async fn fetch_once(scope: &Scope, source: &HttpGridSource) -> Result<()> {
    let topology = source
        .fetch_topology(scope)
        .await
        .context("topology fetch failed")?;
    let mut engine = ReconciliationEngine::new();
    let violations = engine.receive_topology(topology).len();
    if violations > 0 {
        warn!(violations, "topology contained integrity violations");
    }
    match source.fetch_telemetry(scope).await {
        Ok(telemetry) => {
            engine.receive_telemetry(telemetry);
        }
        Err(err) => warn!(error = %err, "telemetry unavailable; printing topology only"),
    }

    let snapshot = engine
        .snapshot()
        .context("no snapshot produced from topology")?;
    println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    Ok(())
}
