//! Engine configuration loading.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::{
    gateway::{GatewayResult, HttpGateway},
    state::{scheduler::SchedulerConfig, session_timeout::SessionTimeoutConfig},
};

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/progress.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PROGRESS_SYNC_CONFIG_PATH";

/// Immutable runtime configuration of the progress engine.
///
/// Every field is optional in the JSON file; durations are expressed in milliseconds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Mutations closer than this to the last flush are debounced.
    #[serde(rename = "min_flush_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_flush_interval: Duration,
    /// Debounce delay of write-hot mutations.
    #[serde(rename = "autosave_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub autosave_interval: Duration,
    /// Inactivity before the sign-out warning.
    #[serde(rename = "session_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub session_timeout: Duration,
    /// Minimum spacing between honored activity resets.
    #[serde(rename = "min_activity_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_activity_interval: Duration,
    /// Length of the sign-out countdown.
    #[serde(rename = "auto_logout_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub auto_logout_timeout: Duration,
    /// Period of the session clock and countdown ticks.
    #[serde(rename = "clock_tick_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub clock_tick: Duration,
    /// Upper bound of the final flush on shutdown.
    #[serde(rename = "shutdown_flush_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown_flush_timeout: Duration,
    /// Upper bound of a single remote request.
    #[serde(rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Directory holding the local cache records.
    pub cache_dir: PathBuf,
    /// Prefix of local cache storage keys.
    pub storage_key_prefix: String,
    /// Base URL of the remote progress store; local-only play when absent.
    pub gateway_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_flush_interval: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10 * 60),
            min_activity_interval: Duration::from_secs(60),
            auto_logout_timeout: Duration::from_secs(60),
            clock_tick: Duration::from_secs(1),
            shutdown_flush_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            cache_dir: PathBuf::from(".progress-cache"),
            storage_key_prefix: "progress".into(),
            gateway_url: None,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        Self::load_from(&resolve_config_path())
    }

    /// Load the configuration from `path`, falling back to built-in defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded progress engine config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Autosave scheduler settings.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_flush_interval: self.min_flush_interval,
            autosave_interval: self.autosave_interval,
            request_timeout: self.request_timeout,
            shutdown_flush_timeout: self.shutdown_flush_timeout,
        }
    }

    /// Session timeout settings.
    pub fn session_timeout(&self) -> SessionTimeoutConfig {
        SessionTimeoutConfig {
            session_timeout: self.session_timeout,
            auto_logout_timeout: self.auto_logout_timeout,
            min_activity_interval: self.min_activity_interval,
            countdown_tick: self.clock_tick,
        }
    }

    /// HTTP gateway to `gateway_url`, or `None` for local-only play.
    pub fn http_gateway(&self) -> GatewayResult<Option<HttpGateway>> {
        self.gateway_url
            .as_deref()
            .map(|url| HttpGateway::new(url, self.request_timeout))
            .transpose()
    }

    /// Local cache storage key of `activity_type`.
    pub fn storage_key(&self, activity_type: &str) -> String {
        format!("{}::{}", self.storage_key_prefix, activity_type)
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
