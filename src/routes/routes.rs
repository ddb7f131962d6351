//! Defines routes for the object API.
//!
//! ## Structure
//! - `GET /healthz`, `GET /readyz`: probes
//! - `PUT /{*name}`: upload object
//! - `GET /{*name}`: download object
//!
//! The wildcard `*name` allows nested names like `videos/2025/cats.mp4`.
//! The probe paths take priority over object names.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    object_handlers::{get_object, missing_name, upload_object},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Build and return the router carrying `AppState` to all handlers.
///
/// Axum's default body limit is disabled; uploads enforce the configured
/// object size limit themselves while spooling.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", put(missing_name).get(missing_name))
        .route("/{*name}", put(upload_object).get(get_object))
        .layer(DefaultBodyLimit::disable())
}
