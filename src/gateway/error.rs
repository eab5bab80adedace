//! Errors raised by persistence gateways.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Convenient result alias returning [`GatewayError`] failures.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures of a remote load or save.
///
/// A missing remote record is not an error: `load` returns `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No usable bearer token; callers degrade to local-only mode.
    #[error("no bearer token available")]
    AuthMissing,
    /// The request never produced a response.
    #[error("request to `{path}` failed")]
    Network {
        /// Request path.
        path: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The remote store answered with an unexpected status.
    #[error("remote store responded with status {status} for `{path}`")]
    Server {
        /// Request path.
        path: String,
        /// Status returned by the store.
        status: StatusCode,
    },
    /// The snapshot payload was rejected as malformed.
    #[error("snapshot payload rejected: {0}")]
    Validation(String),
    /// The response body did not match the snapshot shape.
    #[error("failed to decode response from `{path}`")]
    Decode {
        /// Request path.
        path: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The configured gateway URL cannot address progress endpoints.
    #[error("invalid gateway url `{url}`")]
    InvalidUrl {
        /// Rejected URL.
        url: String,
    },
    /// An in-process store failed.
    #[error("progress store failed")]
    Store(#[from] StorageError),
    /// Building the HTTP client failed.
    #[error("failed to build gateway client")]
    ClientBuilder {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The owning engine was disposed while the request was in flight.
    #[error("request cancelled")]
    Cancelled,
    /// The request did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Whether this failure means "run local-only" rather than "surface an error".
    pub fn is_auth_missing(&self) -> bool {
        matches!(self, GatewayError::AuthMissing)
    }
}
