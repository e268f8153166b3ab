//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the relay: the liveness probe
//! and the WebSocket endpoint.

use crate::{handlers, state::AppState, ws::ws_handler};
use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
///
/// The WebSocket upgrade is served both at `/` and `/ws`.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}
