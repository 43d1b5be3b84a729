//! HTTP server for the Prometheus scrape endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::lifecycle::LifecycleState;
use crate::state::SharedState;

/// Content type of the exposition body.
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    metrics: SharedState,
    lifecycle: LifecycleState,
    metrics_path: String,
}

/// Create the HTTP router.
fn create_router(metrics: SharedState, lifecycle: LifecycleState, metrics_path: &str) -> Router {
    let state = AppState {
        metrics,
        lifecycle,
        metrics_path: metrics_path.to_string(),
    };

    Router::new()
        .route("/", get(landing_handler))
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn landing_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>P1 Exporter</title></head>\n\
         <body>\n\
         <h1>P1 Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        path = state.metrics_path
    ))
}

/// Render every metric key from the current state.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => {
            debug!(bytes = body.len(), "Served scrape");
            (StatusCode::OK, [(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics\n",
            )
                .into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Ready once running and at least one telegram has been ingested.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if !state.lifecycle.is_running() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not ready - {}\n", state.lifecycle.current()),
        )
            .into_response();
    }

    if state.metrics.stats().telegrams == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no telegram received yet\n",
        )
            .into_response();
    }

    (StatusCode::OK, "ready\n").into_response()
}

/// Wait until the shutdown flag is raised or its sender is dropped.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("HTTP server shutting down");
}

/// HTTP server configuration.
pub struct HttpServer {
    metrics: SharedState,
    lifecycle: LifecycleState,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        metrics: SharedState,
        lifecycle: LifecycleState,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            metrics,
            lifecycle,
            listen_addr,
            metrics_path,
        }
    }

    /// Bind the listening socket without serving yet.
    pub async fn bind(self) -> anyhow::Result<BoundServer> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        let router = create_router(self.metrics, self.lifecycle, &self.metrics_path);

        Ok(BoundServer {
            listener,
            router,
            metrics_path: self.metrics_path,
        })
    }

    /// Bind and serve until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.bind().await?.run(shutdown).await
    }
}

/// A server whose socket is bound and ready to accept scrapes.
pub struct BoundServer {
    listener: TcpListener,
    router: Router,
    metrics_path: String,
}

impl BoundServer {
    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal is received. In-flight requests are
    /// allowed to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
