pub mod routes;
pub mod ws;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/pool", get(routes::get_pool))
        .route("/api/positions/{account}", get(routes::get_positions))
        .route("/api/events", get(routes::get_events))
        .route("/api/prices", get(routes::get_prices))
        .route("/api/counters", get(routes::get_counters))
        .route("/api/quote", post(routes::post_quote))
        .route("/api/purchase", post(routes::post_purchase))
        .route("/api/exercise", post(routes::post_exercise))
        .route("/api/reassign", post(routes::post_reassign))
        .route("/api/deposit", post(routes::post_deposit))
        .route("/api/withdraw", post(routes::post_withdraw))
        .route("/api/divestment", post(routes::post_divestment))
        .route("/api/approval", post(routes::post_approval))
        .route("/api/transfer", post(routes::post_transfer))
        .route("/api/price", post(routes::post_price))
        .route("/api/process-expired", post(routes::post_process_expired))
        .route("/ws", get(ws::ws_handler))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}
