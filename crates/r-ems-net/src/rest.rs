//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use prometheus::Registry;
use r_ems_gridview::{GridStatus, GridView, Scope, SharedSnapshot};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Read and scope-control access to a live grid view.
pub trait GridViewProvider: Send + Sync + 'static {
    /// Latest merged snapshot, if any.
    fn snapshot(&self) -> SharedSnapshot;
    /// Current loading/error status.
    fn status(&self) -> GridStatus;
    /// Switch scope. Returns `true` when the scope changed.
    fn set_scope(&self, scope: Scope) -> bool;
}

impl GridViewProvider for GridView {
    fn snapshot(&self) -> SharedSnapshot {
        GridView::snapshot(self)
    }

    fn status(&self) -> GridStatus {
        GridView::status(self)
    }

    fn set_scope(&self, scope: Scope) -> bool {
        GridView::set_scope(self, scope)
    }
}

/// Body accepted by `PUT /grid/scope`. A missing or blank site selects the whole network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScopeRequest {
    /// Site selector.
    #[serde(default)]
    pub site: Option<String>,
}

/// Answer to `PUT /grid/scope`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScopeResponse {
    /// Whether a new scope was activated.
    pub changed: bool,
    /// Scope active after the request.
    pub scope: Scope,
}

struct ApiState {
    provider: Arc<dyn GridViewProvider>,
    metrics: Option<Arc<Registry>>,
}

/// Builder used to configure and spawn the grid view REST API.
#[derive(Clone)]
pub struct GridApiBuilder {
    listen: SocketAddr,
    provider: Arc<dyn GridViewProvider>,
    metrics: Option<Arc<Registry>>,
}

impl GridApiBuilder {
    /// Construct a builder serving `provider` on `listen`.
    pub fn new(listen: SocketAddr, provider: Arc<dyn GridViewProvider>) -> Self {
        Self {
            listen,
            provider,
            metrics: None,
        }
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: Arc<Registry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Bind the listener and serve until the returned handle is shut down.
    pub async fn spawn(self) -> anyhow::Result<GridApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "grid api listening");

        let state = ApiState {
            provider: self.provider,
            metrics: self.metrics,
        };
        let router = Router::new()
            .route("/grid/snapshot", get(get_snapshot))
            .route("/grid/status", get(get_status))
            .route("/grid/scope", put(put_scope))
            .route("/metrics", get(get_metrics))
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "grid api server exited with error");
            }
        });

        Ok(GridApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`GridApiBuilder::spawn`].
pub struct GridApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl GridApiHandle {
    /// Socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

async fn get_snapshot(State(state): State<Arc<ApiState>>) -> Response {
    match state.provider.snapshot() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<GridStatus> {
    Json(state.provider.status())
}

async fn put_scope(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ScopeRequest>,
) -> Json<ScopeResponse> {
    let scope = Scope::from_selector(request.site);
    let changed = state.provider.set_scope(scope.clone());
    info!(%scope, changed, "scope requested over api");
    Json(ScopeResponse { changed, scope })
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };

    r_ems_metrics::text_response(registry)
}
