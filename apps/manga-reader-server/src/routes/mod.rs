//! Route modules for the manga reader server

pub mod health;
pub mod ocr;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Assemble every API route around the shared state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/ocr", ocr::router())
        .with_state(state)
}
