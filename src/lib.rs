pub mod api;
pub mod config;
pub mod coordinator;
pub mod detection;
pub mod errors;
pub mod events;
pub mod frame_slot;
pub mod hub;
pub mod ingest;
pub mod mqtt;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod stats;
pub mod utils;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::warn;

pub use config::Config;
pub use errors::{HubError, Result};
pub use hub::Hub;

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    match origin {
        None | Some("*") => CorsLayer::permissive(),
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(origin_header) => CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                CorsLayer::permissive()
            }
        },
    }
}

/// Every HTTP and WebSocket route the hub serves.
pub fn build_router(hub: Arc<Hub>) -> Router {
    let cors = cors_layer(hub.config.server.cors_allow_origin.as_deref());

    Router::new()
        .route("/ws/producer", get(ingest::producer_ws_handler))
        .route("/ws/events", get(api::events_ws_handler))
        .route("/api/producers", get(api::list_producers))
        .route(
            "/api/producers/:producer_id",
            get(api::get_producer).delete(api::evict_producer),
        )
        .route(
            "/api/producers/:producer_id/cameras/:camera_index/settings",
            post(api::update_camera_settings),
        )
        .route(
            "/api/producers/:producer_id/cameras/:camera_index/frame",
            post(ingest::push_frame_handler),
        )
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/start", post(api::start_session))
        .route("/api/sessions/stop", post(api::stop_session))
        .route("/api/sessions/:producer_id/:camera_index", get(api::get_session))
        .route(
            "/api/sessions/:producer_id/:camera_index/recent",
            get(api::recent_detections),
        )
        .route("/api/stats", get(api::get_stats))
        .route("/api/health/sweep", post(api::sweep_now))
        .layer(cors)
        .with_state(hub)
}
