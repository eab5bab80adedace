use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, header::AUTHORIZATION},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::progress::{SaveProgressRequest, Snapshot},
    error::AppError,
    services::progress_service,
    state::SharedState,
};

/// Progress endpoints; every route requires a bearer token.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/progress/{user_id}", post(save_progress))
        .route("/progress/{user_id}/{activity_type}", get(load_progress))
        .route(
            "/progress/{user_id}/{activity_type}/history",
            get(progress_history),
        )
        .route_layer(middleware::from_fn(require_bearer_token))
}

/// Latest snapshot of one activity.
#[utoipa::path(
    get,
    path = "/progress/{user_id}/{activity_type}",
    tag = "progress",
    params(
        ("user_id" = String, Path, description = "Owner of the progress"),
        ("activity_type" = String, Path, description = "Activity identifier, e.g. `quiz`")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Latest snapshot", body = Snapshot),
        (status = 404, description = "Nothing saved yet"),
        (status = 401, description = "Missing bearer token"),
        (status = 503, description = "Progress store unavailable")
    )
)]
pub async fn load_progress(
    State(state): State<SharedState>,
    Path((user_id, activity_type)): Path<(String, String)>,
) -> Result<Json<Snapshot>, AppError> {
    let snapshot = progress_service::load_progress(&state, user_id, activity_type).await?;
    Ok(Json(snapshot))
}

/// Upsert a snapshot; the running total is computed server-side.
#[utoipa::path(
    post,
    path = "/progress/{user_id}",
    tag = "progress",
    params(("user_id" = String, Path, description = "Owner of the progress")),
    request_body = SaveProgressRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Snapshot stored", body = Snapshot),
        (status = 400, description = "Malformed snapshot payload"),
        (status = 401, description = "Missing bearer token"),
        (status = 409, description = "Record contended by concurrent writers"),
        (status = 503, description = "Progress store unavailable")
    )
)]
pub async fn save_progress(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Valid(Json(payload)): Valid<Json<SaveProgressRequest>>,
) -> Result<Json<Snapshot>, AppError> {
    let snapshot = progress_service::save_progress(&state, user_id, payload).await?;
    Ok(Json(snapshot))
}

/// Past snapshots of one activity, newest first.
#[utoipa::path(
    get,
    path = "/progress/{user_id}/{activity_type}/history",
    tag = "progress",
    params(
        ("user_id" = String, Path, description = "Owner of the progress"),
        ("activity_type" = String, Path, description = "Activity identifier, e.g. `quiz`")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Past snapshots", body = [Snapshot]),
        (status = 401, description = "Missing bearer token"),
        (status = 503, description = "Progress store unavailable")
    )
)]
pub async fn progress_history(
    State(state): State<SharedState>,
    Path((user_id, activity_type)): Path<(String, String)>,
) -> Result<Json<Vec<Snapshot>>, AppError> {
    let history = progress_service::progress_history(&state, user_id, activity_type).await?;
    Ok(Json(history))
}

/// Token issuance is external; only its presence is checked here.
async fn require_bearer_token(req: Request<Body>, next: Next) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    match token {
        Some(_) => Ok(next.run(req).await),
        None => Err(AppError::Unauthorized(
            "missing bearer token in `Authorization` header".into(),
        )),
    }
}
