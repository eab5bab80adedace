use axum::Router;

use crate::state::SharedState;

/// Swagger UI.
pub mod docs;
/// Health check.
pub mod health;
/// Progress endpoints.
pub mod progress;

/// Health, progress and documentation routes sharing the server state.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(progress::router())
        .merge(docs::router())
        .with_state(state)
}
