use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// `ok` only when a store is installed, the supervisor reports it healthy and it answers a
/// live health check.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let Some(store) = state.progress_store().await else {
        return HealthResponse::degraded();
    };
    if state.is_degraded() {
        return HealthResponse::degraded();
    }

    match store.health_check().await {
        Ok(()) => HealthResponse::ok(),
        Err(err) => {
            warn!(error = %err, "progress store failed live health check");
            HealthResponse::degraded()
        }
    }
}
