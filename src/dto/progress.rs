use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use utoipa::ToSchema;
use validator::Validate;

use crate::dto::validation::{validate_activity_type, validate_state_object};

/// One full, versioned copy of an activity's persisted state plus its bookkeeping metadata.
///
/// `state` is opaque to the engine: it is produced and interpreted by the activity layer only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Activity (mini-game) this snapshot belongs to, e.g. `quiz` or `farm`.
    pub activity_type: String,
    /// Activity-owned state blob.
    #[schema(value_type = Object)]
    pub state: Value,
    /// Running total of play time in seconds, computed by the remote store.
    pub total_elapsed_time: u64,
    /// Session seconds. In a remote answer, the seconds credited by that save; in the live
    /// snapshot, the full play time of the current session, which only grows.
    pub session_elapsed_time: u64,
    /// Instant of the remote save that produced this snapshot.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub saved_at: OffsetDateTime,
    /// Number of successful saves for this activity (0 when never saved).
    pub version: u64,
}

impl Snapshot {
    /// Build the snapshot used on the very first run of an activity, before anything was saved.
    pub fn initial(activity_type: impl Into<String>, state: Value) -> Self {
        Self {
            activity_type: activity_type.into(),
            state,
            total_elapsed_time: 0,
            session_elapsed_time: 0,
            saved_at: OffsetDateTime::UNIX_EPOCH,
            version: 0,
        }
    }

    /// Whether this snapshot has ever been acknowledged by the remote store.
    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }
}

/// Payload posted to the remote store to upsert an activity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveProgressRequest {
    /// Activity the save belongs to.
    #[validate(custom(function = "validate_activity_type"))]
    pub activity_type: String,
    /// Activity-owned state blob.
    #[validate(custom(function = "validate_state_object"))]
    #[schema(value_type = Object)]
    pub state: Value,
    /// Session seconds to add to the stored running total.
    pub session_elapsed_time: u64,
}

impl SaveProgressRequest {
    /// Save of `state` crediting `session_elapsed_time` seconds.
    pub fn new(activity_type: impl Into<String>, state: Value, session_elapsed_time: u64) -> Self {
        Self {
            activity_type: activity_type.into(),
            state,
            session_elapsed_time,
        }
    }
}
