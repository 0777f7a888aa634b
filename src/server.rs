//! HTTP server for exposing Prometheus metrics.
//!
//! This module provides an Axum-based HTTP server that runs a scrape and serves
//! the metric store on the configured metrics path, a landing page on `/` and
//! a `/health` endpoint for health checks.

use crate::error::{ExporterError, Result};
use crate::metrics::MetricsStore;
use crate::scrape::Scraper;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const UNMATCHED_PATH: &str = "unmatched";

/// Shared application state.
#[derive(Clone)]
struct AppState {
    store: Arc<MetricsStore>,
    scraper: Arc<Scraper>,
    metrics_path: Arc<str>,
}

/// Build the exporter router.
pub fn router(metrics_path: &str, store: Arc<MetricsStore>, scraper: Arc<Scraper>) -> Router {
    let state = AppState {
        store,
        scraper,
        metrics_path: Arc::from(metrics_path),
    };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on an already bound listener.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(listener, app)
        .await
        .map_err(|e| ExporterError::Server(e.to_string()))
}

/// Start the HTTP server.
///
/// # Arguments
///
/// * `listen_address` - Address to bind to (e.g., "0.0.0.0:8080")
/// * `metrics_path` - Path the metrics are served on (e.g., "/metrics")
/// * `store` - Metric store rendered on every scrape
/// * `scraper` - Scraper run on every request to `metrics_path`
///
/// # Examples
///
/// ```no_run
/// use pgbackrest_exporter::collector::Collector;
/// use pgbackrest_exporter::metrics::MetricsStore;
/// use pgbackrest_exporter::scrape::{Scraper, Targets};
/// use pgbackrest_exporter::server::start_server;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let store = Arc::new(MetricsStore::new().unwrap());
///     let collector = Arc::new(Collector::new(Arc::clone(&store), None));
///     let mut targets = Targets::new();
///     targets.insert("main".to_string(), "pgbackrest info --output=json".to_string());
///     let scraper = Arc::new(Scraper::new(collector, Arc::new(targets)));
///     start_server("0.0.0.0:8080", "/metrics", store, scraper).await.unwrap();
/// }
/// ```
pub async fn start_server(
    listen_address: &str,
    metrics_path: &str,
    store: Arc<MetricsStore>,
    scraper: Arc<Scraper>,
) -> Result<()> {
    let app = router(metrics_path, store, scraper);

    info!(
        "Starting HTTP server on {}, metrics on {}",
        listen_address, metrics_path
    );

    let listener = TcpListener::bind(listen_address).await?;
    serve(listener, app).await
}

/// Record response time and status of every request.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED_PATH.to_owned());

    let start = Instant::now();
    let response = next.run(request).await;

    state.store.observe_request(
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    info!("Received metrics scrape request");

    // Detached so a client hanging up does not abort running commands
    let scraper = Arc::clone(&state.scraper);
    match tokio::spawn(async move { scraper.run_scrape().await }).await {
        Ok(outcomes) => {
            for outcome in &outcomes {
                debug!(
                    "Target {} finished with exit code {}",
                    outcome.target, outcome.exit_code
                );
            }
        }
        Err(e) => warn!("Scrape task failed: {}", e),
    }

    match state.store.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.store.format_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Handler for /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// Handler for root endpoint.
async fn root_handler(State(state): State<AppState>) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>pgBackRest Exporter</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; }}
        h1 {{ color: #333; }}
        a {{ color: #0066cc; text-decoration: none; }}
        a:hover {{ text-decoration: underline; }}
    </style>
</head>
<body>
    <h1>pgBackRest Exporter</h1>
    <p>Looking for <a href="{path}">{path}</a>?</p>
    <p>{targets} target(s) configured.</p>
</body>
</html>
"#,
        path = state.metrics_path,
        targets = state.scraper.targets().len(),
    );

    (StatusCode::OK, Html(html)).into_response()
}
