pub mod health;
pub mod migrations;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/v1/migrations/zoho_deals/run",
            post(migrations::handle_run),
        )
        .route(
            "/api/v1/migrations/:name/checkpoint",
            get(migrations::handle_checkpoint),
        )
        .route(
            "/api/v1/migrations/:name/progress",
            get(migrations::handle_progress),
        )
        .with_state(state)
}
