//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One listener serves everything: the websocket upgrade at `/ws`, a
//! health probe, and the static front-end from `./frontend` as the
//! fallback. Origin and admission policy live in the `ws` handler, not
//! in middleware, because they need per-connection state.

pub mod ws;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let frontend = ServeDir::new("./frontend").append_index_html_on_directories(true);

    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .with_state(state)
        .fallback_service(frontend)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
