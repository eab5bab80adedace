use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::health::HealthResponse, services::health_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/healthcheck",
    tag = "health",
    responses((status = 200, description = "Service status (`ok` or `degraded`)", body = HealthResponse))
)]
/// Report whether a progress store is installed and reachable.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<HealthResponse> {
    let status = health_service::health_status(&state).await;
    Json(status)
}

/// Configure the health routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    use super::*;
    use crate::{dao::progress_store::MemoryProgressStore, state::AppState};

    async fn status_of(state: SharedState) -> String {
        let response = router()
            .with_state(state)
            .oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        body["status"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn reports_degraded_without_store() {
        assert_eq!(status_of(AppState::new()).await, "degraded");
        assert_eq!(
            status_of(AppState::with_store(Arc::new(MemoryProgressStore::new()))).await,
            "ok"
        );
    }
}
