/// Active-task extraction for resume prompts.
pub mod active_tasks;
/// Last-write-wins reconciliation of the local cache and the remote store.
pub mod conflict_resolver;
/// OpenAPI documentation generation.
pub mod documentation;
/// Client-side progress engine facade.
pub mod engine;
/// Health check service.
pub mod health_service;
/// Server-side progress operations.
pub mod progress_service;
/// Progress store reconnect loop.
pub mod storage_supervisor;
