use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::task;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::clients::ClientStore;

use super::client_routes::client_router;
use super::config::ServiceConfig;
use super::pipeline::Pipeline;
use super::queue_routes::queue_router;
use super::state::AppState;
use super::worker::start_worker;
use super::BoxError;

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);
    let pipeline = {
        let config = config.clone();
        Arc::new(
            task::spawn_blocking(move || Pipeline::from_config(&config))
                .await
                .map_err(|err| -> BoxError { err.into() })??,
        )
    };
    let clients_db_path = config.clients_db_path.clone();
    let clients = Arc::new(
        task::spawn_blocking(move || ClientStore::new(clients_db_path))
            .await
            .map_err(|err| -> BoxError { err.into() })??,
    );

    let worker = config
        .worker_enabled
        .then(|| start_worker(pipeline.clone(), config.worker_poll_interval));
    if worker.is_none() {
        info!("background worker disabled; use POST /fetch and POST /process");
    }

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("helpdesk service listening on {}", addr);

    let app = build_router(AppState::new(config.clone(), pipeline.clone(), clients));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    // The worker may be mid-batch, and the pipeline owns a blocking HTTP
    // client; both must be released off the async executor.
    task::spawn_blocking(move || {
        if let Some(mut worker) = worker {
            worker.stop_and_join();
        }
        drop(pipeline);
    })
    .await
    .map_err(|err| -> BoxError { err.into() })?;
    serve_result?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let body_max_bytes = state.config.body_max_bytes;
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .merge(queue_router())
        .merge(client_router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_max_bytes))
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
