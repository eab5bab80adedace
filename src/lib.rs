//! Progress persistence engine: debounced autosave, session clock, inactivity timeout and
//! last-write-wins reconciliation, plus the reference remote store served by `progress-server`.

/// Engine configuration.
pub mod config;
/// Local cache and remote store backends.
pub mod dao;
/// Wire models.
pub mod dto;
/// Server error types.
pub mod error;
/// Persistence gateways and identity collaborators.
pub mod gateway;
/// HTTP routes of the progress server.
pub mod routes;
/// Engine facade and server services.
pub mod services;
/// Scheduler, timers and server state.
pub mod state;

pub use config::EngineConfig;
pub use services::engine::ProgressEngine;
