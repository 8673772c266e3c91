//! HTTP API handlers and routing.

pub mod catalogue;
pub mod error;
mod health;
mod intake;
mod upload;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    let download = ServeDir::new(&state.config().download_dir);

    Router::new()
        // Health endpoint
        .merge(health::routes())
        // Intake and catalogue APIs
        .nest("/api", intake::routes().merge(catalogue::routes()))
        // Worker uploads
        .merge(upload::routes())
        // Published images and failure logs
        .nest_service("/download", download)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Application state
        .with_state(state)
}
