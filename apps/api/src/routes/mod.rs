pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::intake::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/receipts", post(handlers::handle_register))
        .route("/api/v1/receipts/:id", get(handlers::handle_get_receipt))
        .route(
            "/api/v1/receipts/:id/jobs",
            get(handlers::handle_receipt_jobs).post(handlers::handle_enqueue),
        )
        .route("/api/v1/jobs/:id", get(handlers::handle_get_job))
        .with_state(state)
}
