//! Store configuration.
//!
//! Loaded from YAML files and environment variables; every section falls back
//! to defaults so an empty configuration yields a usable session.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "realtime-store.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "REALTIME_STORE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "REALTIME_STORE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "REALTIME_STORE_LOG";

/// Reference acknowledgement window for mutations.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Main store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Session identity and handshake parameters.
    pub session: SessionConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Mutation request handling.
    pub requests: RequestConfig,
    /// Projection behaviour.
    pub projection: ProjectionConfig,
}

impl StoreConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `realtime-store.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create config for testing: short request window, fast reconnects.
    pub fn for_test() -> Self {
        Self {
            reconnect: ReconnectConfig {
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                factor: 1.5,
            },
            requests: RequestConfig {
                timeout_ms: 500,
                ..RequestConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Session identity and handshake parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Branch the session is scoped to.
    pub branch_id: String,
    /// Default module for reads, events without `moduleId`, and mutations.
    pub module_id: String,
    /// Role label sent in the handshake.
    pub role: String,
    /// Language preference sent in the handshake.
    pub lang: Option<String>,
    /// Requested history length.
    pub history_limit: u32,
    /// Reconnect after unexpected closes.
    pub auto_reconnect: bool,
    /// Server URL (used by network transports).
    pub url: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            branch_id: "main".to_string(),
            module_id: "pos".to_string(),
            role: "client".to_string(),
            lang: None,
            history_limit: 50,
            auto_reconnect: true,
            url: "ws://localhost:3001/ws".to_string(),
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for the delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive failures.
    pub factor: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 1.5,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

/// Mutation request configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Acknowledgement window.
    pub timeout_ms: u64,
    /// How long an outbound frame waits for the transport to open.
    /// Defaults to the acknowledgement window.
    pub send_wait_ms: Option<u64>,
    /// Tables whose `update` requires a numeric `version`.
    pub version_controlled_tables: BTreeSet<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            send_wait_ms: None,
            version_controlled_tables: BTreeSet::from(["order_header".to_string()]),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn send_wait(&self) -> Duration {
        Duration::from_millis(self.send_wait_ms.unwrap_or(self.timeout_ms))
    }
}

/// How event versions interact with the module version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Every event carrying a version overwrites the module version.
    #[default]
    Overwrite,
    /// Events whose version is not greater than the module version are ignored.
    Monotonic,
}

/// Projection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub version_policy: VersionPolicy,
    /// Copy identity fields from `recordRef` onto appended payloads lacking them.
    pub stamp_identity: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            version_policy: VersionPolicy::Overwrite,
            stamp_identity: true,
        }
    }
}
