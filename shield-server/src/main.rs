//! `shield-server`: the HTTP edge for the artwork protection engine
//! (spec §6, SPEC_FULL.md §1 "built the way the teacher builds its own
//! inference server: axum + tower-http + utoipa").

mod auth;
mod dispatch;
mod routes;
mod settings;
mod store;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use shield_core::engine::PerturbationEngine;
use shield_core::orchestrator::Orchestrator;
use shield_core::verification::VerifierHandle;

use dispatch::Dispatcher;
use settings::{EngineSettings, ServerSettings};
use store::{InMemoryJobStateStore, LocalDiskStore};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ServerSettings>,
    pub dispatcher: Arc<Dispatcher>,
    pub job_store: Arc<InMemoryJobStateStore>,
}

#[derive(OpenApi)]
#[openapi(paths(), components(schemas()))]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let settings = Arc::new(ServerSettings::load()?);
    let engine_settings = EngineSettings::load()?;
    let device = engine_settings.device()?;

    let publisher = Arc::new(LocalDiskStore::new(
        settings.storage_root.clone(),
        settings.r2_public_url.clone(),
    )?);
    let engine = Arc::new(PerturbationEngine::new(device.clone()));
    let verifier = Arc::new(VerifierHandle::new(device.clone()));
    let orchestrator = Arc::new(Orchestrator::new(engine, verifier, publisher, device));

    let job_store = Arc::new(InMemoryJobStateStore::new());
    let dispatcher = Arc::new(Dispatcher::spawn(
        settings.max_containers,
        orchestrator,
        job_store.clone(),
        settings.clone(),
    ));

    let state = AppState {
        settings: settings.clone(),
        dispatcher,
        job_store,
    };

    let protected_routes = Router::new()
        .route("/v1/protect", post(routes::submit_protection))
        .route("/v1/jobs/status", post(routes::bulk_status))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    let app = Router::new()
        .route("/healthz", get(routes::health))
        .merge(protected_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "shield-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
