//! HTTP/WebSocket control surface (spec §4.G/§4.H). Thin axum layer over
//! `fleetctl-core`: no domain logic lives here, only request parsing,
//! validation of path/query parameters, and translating `CoreError` into the
//! documented error envelope.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod ws;

use axum::Router;
use fleetctl_core::{EventHub, ProfileManager, Supervisor};
use fleetctl_p2p::Controller;
use fleetctl_store::HashrateStore;
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub profiles: Arc<ProfileManager>,
    pub event_hub: Arc<EventHub>,
    pub store: Arc<HashrateStore>,
    pub controller: Arc<Controller>,
    pub started_at: SystemTime,
    pub allowed_ws_origins: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let limiter = crate::middleware::new_rate_limiter();

    routes::router(state)
        .layer(axum::middleware::from_fn(crate::middleware::timeout_guard))
        .layer(axum::middleware::from_fn_with_state(limiter, crate::middleware::rate_limit))
        .layer(axum::middleware::from_fn(crate::middleware::structured_logging))
        .layer(axum::middleware::from_fn(crate::middleware::request_id))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(crate::middleware::MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
