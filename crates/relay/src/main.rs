mod admin;
mod config;
mod error;
mod metrics;
mod search;
mod store;
mod sync;
mod users;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, RelayConfig, StoreKind};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::metrics::RelayMetrics;
use crate::search::QueryRegistry;
use crate::store::{EntityStore, MemoryStore, SolrStore};
use crate::sync::EntityRegistry;
use crate::ws::SessionRouterState;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let store = build_store(&config).context("failed to initialize card store")?;
    let state = SessionRouterState {
        entities: EntityRegistry::spawn(store.clone()),
        queries: QueryRegistry::spawn(store.clone(), config.search_interval),
        store,
    };
    let app = build_router(state, relay_metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        collection = %config.collection,
        "starting relay server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn build_store(config: &RelayConfig) -> anyhow::Result<EntityStore> {
    match config.store {
        StoreKind::Memory => Ok(EntityStore::Memory(MemoryStore::new(config.collection.clone()))),
        StoreKind::Solr => SolrStore::new(&config.solr_url, config.collection.clone())
            .map(EntityStore::Solr)
            .with_context(|| format!("invalid Solr URL {}", config.solr_url)),
    }
}

fn build_router(state: SessionRouterState, relay_metrics: Arc<RelayMetrics>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics).with_state(relay_metrics))
            .merge(admin::router(state.store.clone()))
            .merge(ws::router(state)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(relay_metrics): State<Arc<RelayMetrics>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        relay_metrics.render_prometheus(),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
