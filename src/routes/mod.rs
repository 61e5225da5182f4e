//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the websocket protocol endpoint, the health report and the
//! read-only room REST mirror under a single Axum router.

pub mod rooms;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/health", get(rooms::health))
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{id}", get(rooms::room_info))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
