use std::{env, time::Duration};

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DATABASE: &str = "progress";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration describing how to reach the CouchDB progress database.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server URL, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Database holding the progress documents.
    pub database: String,
    /// Basic-auth username and password.
    pub credentials: Option<(String, String)>,
    /// Upper bound of a single CouchDB request.
    pub request_timeout: Duration,
}

impl CouchConfig {
    /// Configuration for `database` on the server at `base_url`, without credentials.
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: database.into(),
            credentials: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Attach basic-auth credentials to the configuration.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Read `COUCH_BASE_URL`, `COUCH_DB`, `COUCH_USERNAME` and `COUCH_PASSWORD`.
    ///
    /// Returns `Ok(None)` when `COUCH_BASE_URL` is not set, meaning CouchDB is not wanted.
    /// A username without a password (or the reverse) is rejected.
    pub fn from_env() -> CouchResult<Option<Self>> {
        let Some(base_url) = non_empty_var("COUCH_BASE_URL") else {
            return Ok(None);
        };
        let database = non_empty_var("COUCH_DB").unwrap_or_else(|| DEFAULT_DATABASE.into());
        let mut config = Self::new(base_url, database);

        match (non_empty_var("COUCH_USERNAME"), non_empty_var("COUCH_PASSWORD")) {
            (Some(username), Some(password)) => {
                config = config.with_credentials(username, password);
            }
            (Some(_), None) => {
                return Err(CouchDaoError::MissingEnvVar {
                    var: "COUCH_PASSWORD",
                });
            }
            (None, Some(_)) => {
                return Err(CouchDaoError::MissingEnvVar {
                    var: "COUCH_USERNAME",
                });
            }
            (None, None) => {}
        }

        Ok(Some(config))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
