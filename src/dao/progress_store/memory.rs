use std::{future::ready, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use time::OffsetDateTime;

use crate::{
    dao::{
        models::{ProgressEntity, ProgressKey},
        progress_store::ProgressStore,
        storage::StorageResult,
    },
    dto::progress::{SaveProgressRequest, Snapshot},
};

/// Process-local progress store. The map shard lock held by `entry` serializes concurrent
/// upserts of the same key.
#[derive(Clone, Default)]
pub struct MemoryProgressStore {
    records: Arc<DashMap<ProgressKey, ProgressEntity>>,
}

impl MemoryProgressStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of (identity, activity) records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was saved yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn upsert_now(&self, key: ProgressKey, request: SaveProgressRequest) -> Snapshot {
        let now = OffsetDateTime::now_utc();
        match self.records.entry(key) {
            Entry::Occupied(mut occupied) => occupied.get_mut().apply_save(request, now).clone(),
            Entry::Vacant(vacant) => {
                let entity = ProgressEntity::first_save(vacant.key().user_id.clone(), request, now);
                let snapshot = entity.current.clone();
                vacant.insert(entity);
                snapshot
            }
        }
    }
}

impl ProgressStore for MemoryProgressStore {
    fn find(&self, key: ProgressKey) -> BoxFuture<'static, StorageResult<Option<ProgressEntity>>> {
        let found = self.records.get(&key).map(|entry| entry.value().clone());
        Box::pin(ready(Ok(found)))
    }

    fn upsert(
        &self,
        key: ProgressKey,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, StorageResult<Snapshot>> {
        let snapshot = self.upsert_now(key, request);
        Box::pin(ready(Ok(snapshot)))
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(ready(Ok(())))
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(ready(Ok(())))
    }
}
