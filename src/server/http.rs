//! HTTP frontend: an axum router serving search, status and metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::search::{QueryError, SearchRequest};
use crate::server::ServerContext;

#[derive(Clone)]
struct AppState {
    ctx: Arc<ServerContext>,
}

pub struct HttpServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self { addr, ctx }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let cors_enabled = self.ctx.config.cors_enabled;
        let mut app = create_router(AppState { ctx: self.ctx });

        if cors_enabled {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .allow_origin(Any);
            app = app.layer(cors);
        }

        let app = app.layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.addr)
            .await
            .context("failed to bind HTTP listener")?;
        info!("http frontend listening on http://{}", self.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("http frontend shutting down");
            })
            .await
            .context("http frontend error")?;
        Ok(())
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/search", post(search))
        .route("/api/v1/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn query_error_status(e: &QueryError) -> StatusCode {
    match e {
        QueryError::IndexNotFound(_) => StatusCode::NOT_FOUND,
        QueryError::NotMutable(_) | QueryError::Unsupported(_) => StatusCode::BAD_REQUEST,
        QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> impl IntoResponse {
    match state.ctx.execute_search(&request).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => (
            query_error_status(&e),
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let pairs: serde_json::Map<String, serde_json::Value> = state
        .ctx
        .stats
        .status_pairs()
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    // per-index query statistics over the rolling windows
    let mut indexes = serde_json::Map::new();
    for (name, served) in state.ctx.local.read().iter() {
        let report = served.stats().calculate();
        let mut windows = serde_json::Map::new();
        for interval in crate::index::stats::STAT_INTERVALS {
            let t = report.time[interval as usize];
            windows.insert(
                interval.name().to_string(),
                serde_json::json!({
                    "queries": t.queries,
                    "avg_us": t.avg,
                    "min_us": t.min,
                    "max_us": t.max,
                    "p95_us": t.p95,
                    "p99_us": t.p99,
                }),
            );
        }
        indexes.insert(name.to_string(), serde_json::Value::Object(windows));
    }

    let mut distributed = serde_json::Map::new();
    for (name, dist) in state.ctx.dist.read().iter() {
        let hosts: Vec<String> = dist.all_hosts().iter().map(|a| a.host.url()).collect();
        distributed.insert(
            name.to_string(),
            serde_json::json!({
                "locals": dist.locals.clone(),
                "hosts": hosts,
            }),
        );
    }

    Json(serde_json::json!({
        "status": pairs,
        "indexes": indexes,
        "distributed": distributed,
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.ctx.stats.to_prometheus(),
    )
}
