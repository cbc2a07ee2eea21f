//! Configuration settings for rqmux

use config::{Config, Environment, File};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use super::defaults;
use crate::classify::{ErrorCategory, ErrorClassifier};
use crate::dispatcher::PollFailurePolicy;
use crate::error::{Error, Result};

/// Top-level configuration: where to connect, how to retry, how to tick
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    /// Extra error classifications applied on top of the built-in table
    #[serde(default)]
    pub classifications: Vec<ClassificationRule>,

    /// Log level (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG env var
    #[serde(default)]
    pub log_level: Option<String>,
}

impl MuxConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: MuxConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(config)
    }

    /// Load configuration using config-rs (file + environment variables)
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name(defaults::CONFIG_FILE).required(false));
        }

        // RQMUX__CONNECTION__HOST, RQMUX__RETRY__DELAY_MS, ...
        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator(defaults::ENV_SEPARATOR)
                .separator(defaults::ENV_SEPARATOR),
        );

        let config: MuxConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() && self.connection.socket.is_none() {
            return Err(Error::Config(
                "connection.host or connection.socket is required".into(),
            ));
        }
        if self.connection.port == 0 {
            return Err(Error::Config("connection.port must not be 0".into()));
        }
        if self.dispatcher.tick_interval_ms == 0 {
            return Err(Error::Config(
                "dispatcher.tick_interval_ms must be greater than 0".into(),
            ));
        }
        if let Some(level) = &self.log_level {
            const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
            if !LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                return Err(Error::Config(format!("Unknown log_level: {}", level)));
            }
        }
        for rule in &self.classifications {
            if rule.operation.is_empty() {
                return Err(Error::Config(format!(
                    "classification for code {} has no operation",
                    rule.code
                )));
            }
        }
        Ok(())
    }

    /// Register the configured classifications on `classifier`.
    pub fn apply_classifications(&self, classifier: &ErrorClassifier) {
        for rule in &self.classifications {
            classifier.add(rule.operation.clone(), rule.code, rule.category);
        }
    }
}

/// Where and as whom to connect
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Unix socket path; takes precedence over host and port
    #[serde(default)]
    pub socket: Option<String>,

    /// Ask for a persistent, kept-alive connection
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_host() -> String {
    defaults::HOST.to_string()
}
fn default_user() -> String {
    defaults::USER.to_string()
}
fn default_port() -> u16 {
    defaults::PORT
}
fn default_persistent() -> bool {
    defaults::PERSISTENT
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            user: default_user(),
            password: String::new(),
            database: None,
            port: default_port(),
            socket: None,
            persistent: default_persistent(),
        }
    }
}

impl ConnectionSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Host as handed to the client, with the `p:` marker for persistent
    /// connections.
    pub fn effective_host(&self) -> String {
        if self.persistent && !self.host.starts_with("p:") {
            format!("p:{}", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Host without any persistence marker.
    pub fn bare_host(&self) -> &str {
        self.host.strip_prefix("p:").unwrap_or(&self.host)
    }

    /// Connection URL in the form accepted by `mysql_async::Opts::from_url`.
    pub fn to_url(&self) -> String {
        let mut url = format!("mysql://{}", self.user);
        if !self.password.is_empty() {
            url.push(':');
            url.push_str(&self.password);
        }
        url.push_str(&format!("@{}:{}", self.bare_host(), self.port));
        if let Some(database) = &self.database {
            url.push('/');
            url.push_str(database);
        }
        if let Some(socket) = &self.socket {
            url.push_str("?socket=");
            url.push_str(socket);
        }
        url
    }
}

// keeps the password out of logs
impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// How hard to try establishing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt (0 = unbounded)
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Stop retrying once this much time has passed (0 = never)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Base delay between attempts
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_retry_count() -> u32 {
    defaults::MAX_RETRY_COUNT
}
fn default_timeout_ms() -> u64 {
    defaults::RETRY_TIMEOUT_MS
}
fn default_delay_ms() -> u64 {
    defaults::RETRY_DELAY_MS
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            timeout_ms: default_timeout_ms(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn new(max_retry_count: u32, timeout_ms: u64, delay_ms: u64) -> Self {
        Self {
            max_retry_count,
            timeout_ms,
            delay_ms,
        }
    }

    /// Retry limit, `None` when unbounded.
    pub fn max_retries(&self) -> Option<u32> {
        (self.max_retry_count > 0).then_some(self.max_retry_count)
    }

    /// Overall time limit, `None` when unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Delay before the next attempt: the base delay plus up to 1% jitter.
    pub fn backoff(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.delay_ms / 100);
        Duration::from_millis(self.delay_ms.saturating_add(jitter))
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub poll_failure_policy: PollFailurePolicy,
}

fn default_tick_interval_ms() -> u64 {
    defaults::TICK_INTERVAL_MS
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            poll_failure_policy: PollFailurePolicy::default(),
        }
    }
}

impl DispatcherSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// One `(operation, code) -> category` entry for the error classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub operation: String,
    pub code: i32,
    pub category: ErrorCategory,
}
