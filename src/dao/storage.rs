use std::error::Error;
use thiserror::Error;

/// Result alias for progress store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a progress store backend, whatever database sits behind it.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or failed the request.
    #[error("{backend} progress store unavailable: {detail}")]
    BackendUnavailable {
        /// Backend name, e.g. `couchdb`.
        backend: &'static str,
        /// Human-readable summary of the failure.
        detail: String,
        /// Backend-specific cause.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Concurrent writers kept invalidating the read-modify-write of one record.
    #[error("progress record `{key}` still contended after {attempts} attempt(s)")]
    Contended {
        /// Storage key of the contended record.
        key: String,
        /// Write attempts made before giving up.
        attempts: u32,
    },
}

impl StorageError {
    /// Wrap a failure of `backend`.
    pub fn unavailable(
        backend: &'static str,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        StorageError::BackendUnavailable {
            backend,
            detail: source.to_string(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Refused;

    #[test]
    fn unavailable_names_backend_and_cause() {
        let err = StorageError::unavailable("couchdb", Refused);
        assert_eq!(
            err.to_string(),
            "couchdb progress store unavailable: connection refused"
        );
        assert!(err.source().is_some());
    }
}
