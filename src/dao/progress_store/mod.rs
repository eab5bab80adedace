/// CouchDB backend.
#[cfg(feature = "couch-store")]
pub mod couchdb;
/// In-memory backend.
pub mod memory;

use futures::future::BoxFuture;

use crate::dao::models::{ProgressEntity, ProgressKey};
use crate::dao::storage::StorageResult;
use crate::dto::progress::{SaveProgressRequest, Snapshot};

pub use memory::MemoryProgressStore;

/// Abstraction over the remote persistence layer holding one progress record per
/// (identity, activity) pair.
pub trait ProgressStore: Send + Sync {
    /// Fetch the record for `key`, `None` when nothing was ever saved.
    fn find(&self, key: ProgressKey) -> BoxFuture<'static, StorageResult<Option<ProgressEntity>>>;
    /// Upsert a save for `key` and return the resulting snapshot.
    fn upsert(
        &self,
        key: ProgressKey,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, StorageResult<Snapshot>>;
    /// Cheap liveness check of the backend.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Attempt to restore a lost connection.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
