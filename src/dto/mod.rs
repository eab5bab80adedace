/// Health check payloads.
pub mod health;
/// Snapshot model and the save payload exchanged with the remote store.
pub mod progress;
/// Validation helpers shared by request payloads.
pub mod validation;
