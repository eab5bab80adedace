use validator::Validate;

use crate::{
    dao::models::ProgressKey,
    dto::{
        progress::{SaveProgressRequest, Snapshot},
        validation::validate_activity_type,
    },
    error::ServiceError,
    state::SharedState,
};

/// Latest snapshot of `(user_id, activity_type)`.
pub async fn load_progress(
    state: &SharedState,
    user_id: String,
    activity_type: String,
) -> Result<Snapshot, ServiceError> {
    let key = progress_key(user_id, activity_type)?;
    let store = state.require_progress_store().await?;
    let entity = store.find(key.clone()).await?;
    entity
        .map(|entity| entity.current)
        .ok_or(ServiceError::NotFound {
            user_id: key.user_id,
            activity_type: key.activity_type,
        })
}

/// Upsert a save: the running total accumulates and the version increments.
pub async fn save_progress(
    state: &SharedState,
    user_id: String,
    request: SaveProgressRequest,
) -> Result<Snapshot, ServiceError> {
    request.validate()?;
    let key = progress_key(user_id, request.activity_type.clone())?;
    let store = state.require_progress_store().await?;
    let snapshot = store.upsert(key, request).await?;
    Ok(snapshot)
}

/// Past snapshots, newest first; empty when nothing was saved.
pub async fn progress_history(
    state: &SharedState,
    user_id: String,
    activity_type: String,
) -> Result<Vec<Snapshot>, ServiceError> {
    let key = progress_key(user_id, activity_type)?;
    let store = state.require_progress_store().await?;
    let entity = store.find(key).await?;
    Ok(entity.map(|entity| entity.history).unwrap_or_default())
}

fn progress_key(user_id: String, activity_type: String) -> Result<ProgressKey, ServiceError> {
    if user_id.trim().is_empty() {
        return Err(ServiceError::InvalidInput("user id must not be empty".into()));
    }
    validate_activity_type(&activity_type).map_err(|err| {
        ServiceError::InvalidInput(
            err.message
                .map(|message| message.into_owned())
                .unwrap_or_else(|| err.code.into_owned()),
        )
    })?;
    Ok(ProgressKey::new(user_id, activity_type))
}
