use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::dto::progress::{SaveProgressRequest, Snapshot};

/// Number of past snapshots retained per (identity, activity) record.
pub const HISTORY_LIMIT: usize = 50;

/// Client-local copy of an activity's state, one record per storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCacheRecord {
    /// Activity-owned state blob.
    pub state: Value,
    /// Instant the record was written to the cache.
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
    /// Running total known when the record was written.
    pub total_elapsed_time: u64,
    /// Session seconds known when the record was written.
    pub session_elapsed_time: u64,
}

impl LocalCacheRecord {
    /// Mirror a remote snapshot, stamping the record with the snapshot's own save instant so a
    /// later comparison sees both copies as equally fresh.
    pub fn mirror(snapshot: &Snapshot) -> Self {
        Self {
            state: snapshot.state.clone(),
            cached_at: snapshot.saved_at,
            total_elapsed_time: snapshot.total_elapsed_time,
            session_elapsed_time: snapshot.session_elapsed_time,
        }
    }

    /// Capture the live snapshot as a manual local save made at `cached_at`.
    pub fn capture(snapshot: &Snapshot, session_elapsed_time: u64, cached_at: OffsetDateTime) -> Self {
        Self {
            state: snapshot.state.clone(),
            cached_at,
            total_elapsed_time: snapshot.total_elapsed_time,
            session_elapsed_time,
        }
    }

    /// Rebuild an unsaved snapshot from the cached record (used when the remote store is
    /// unreachable at startup).
    pub fn into_snapshot(self, activity_type: impl Into<String>) -> Snapshot {
        Snapshot {
            activity_type: activity_type.into(),
            state: self.state,
            total_elapsed_time: self.total_elapsed_time,
            session_elapsed_time: 0,
            saved_at: self.cached_at,
            version: 0,
        }
    }
}

/// Key of the authoritative remote record: one per (identity, activity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    /// Owner of the record.
    pub user_id: String,
    /// Activity the record belongs to.
    pub activity_type: String,
}

impl ProgressKey {
    /// Key of `activity_type` owned by `user_id`.
    pub fn new(user_id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            activity_type: activity_type.into(),
        }
    }
}

/// Remote progress record persisted by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntity {
    /// Owner of the record.
    pub user_id: String,
    /// Latest acknowledged snapshot.
    pub current: Snapshot,
    /// Past snapshots, newest first, bounded to [`HISTORY_LIMIT`] entries.
    pub history: Vec<Snapshot>,
}

impl ProgressEntity {
    /// Create the record for the first save of an (identity, activity) pair.
    pub fn first_save(user_id: impl Into<String>, request: SaveProgressRequest, now: OffsetDateTime) -> Self {
        let current = Snapshot {
            activity_type: request.activity_type,
            state: request.state,
            total_elapsed_time: request.session_elapsed_time,
            session_elapsed_time: request.session_elapsed_time,
            saved_at: now,
            version: 1,
        };

        Self {
            user_id: user_id.into(),
            history: vec![current.clone()],
            current,
        }
    }

    /// Apply a save on top of the existing record and return the new snapshot.
    ///
    /// The running total accumulates the credited session seconds, the version increments by
    /// one and `saved_at` is forced strictly past the previous save even if the wall clock
    /// stalled or went backwards.
    pub fn apply_save(&mut self, request: SaveProgressRequest, now: OffsetDateTime) -> &Snapshot {
        let floor = self.current.saved_at + Duration::milliseconds(1);
        let saved_at = if now >= floor { now } else { floor };

        self.current = Snapshot {
            activity_type: request.activity_type,
            state: request.state,
            total_elapsed_time: self
                .current
                .total_elapsed_time
                .saturating_add(request.session_elapsed_time),
            session_elapsed_time: request.session_elapsed_time,
            saved_at,
            version: self.current.version + 1,
        };

        self.history.insert(0, self.current.clone());
        self.history.truncate(HISTORY_LIMIT);
        &self.current
    }
}

/// Upsert rule shared by every store backend: create on first save, accumulate afterwards.
pub fn upsert_entity(
    existing: Option<ProgressEntity>,
    key: &ProgressKey,
    request: SaveProgressRequest,
    now: OffsetDateTime,
) -> ProgressEntity {
    match existing {
        Some(mut entity) => {
            entity.apply_save(request, now);
            entity
        }
        None => ProgressEntity::first_save(key.user_id.clone(), request, now),
    }
}
