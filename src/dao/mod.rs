/// Client-local cache of the active activity record.
pub mod local_cache;
/// Persistence model definitions.
pub mod models;
/// Remote progress store backends.
pub mod progress_store;
/// Storage abstraction layer for database operations.
pub mod storage;
