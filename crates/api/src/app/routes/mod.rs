use axum::{routing::get, Router};

pub mod audits;
pub mod inventory;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/stream", get(system::stream))
        .nest("/audits", audits::router())
        .nest("/inventory", inventory::router())
}
