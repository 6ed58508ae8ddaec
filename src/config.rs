//! Runtime configuration for the dispatcher and workers.
//!
//! All settings are read once into a [`Settings`] value, which is then split
//! into the per-component configs ([`QueueConfig`], [`DispatcherConfig`],
//! [`WorkerConfig`]) that are passed to constructors. Nothing reads the
//! environment after startup.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::execution::{LauncherConfig, LauncherKind};
use crate::provision::{CertSource, ProvisionConfig, SecretSource};
use crate::scheduler::{DispatcherConfig, WorkerConfig};
use crate::storage::{schema, QueueConfig};

/// Longest lease a worker may hold before it is considered abandoned.
pub const MAX_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Complete configuration for a deployment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deployment environment name, used in owner ids and provisioning names.
    pub environment: String,

    // Queue store
    /// Queue store connection URL (`postgres://…` or `sqlite:…`).
    pub database_url: String,
    /// Name of the queue table.
    pub queue_table: String,
    /// Rows with `retry_count` at or above this value are never claimed.
    pub retry_ceiling: i32,
    /// Upper bound on acquiring a queue-store connection.
    pub db_acquire_timeout: Duration,

    // Dispatch
    /// Rows handed to each worker.
    pub batch_size: usize,
    /// Maximum workers launched per dispatch cycle.
    pub max_workers: usize,
    /// Age after which a `processing` row is considered abandoned.
    pub stale_threshold: Duration,
    /// Interval between dispatch cycles in loop mode.
    pub dispatch_interval: Duration,
    /// Whether dispatch cycles requeue `failed` rows below the retry ceiling.
    pub retry_failed: bool,

    // Worker
    /// External processing endpoint.
    pub endpoint_url: String,
    /// Timeout for a single external call.
    pub call_timeout: Duration,
    /// Wall-clock budget for one worker process.
    pub wall_clock_timeout: Duration,
    /// Owner id assigned by the dispatcher at launch time.
    pub owner_id: Option<String>,

    // Launching
    /// How workers are launched.
    pub launcher: LauncherKind,
    /// Container image for Docker-launched workers.
    pub worker_image: String,
    /// Docker network for worker containers.
    pub docker_network: Option<String>,

    // Provisioning
    /// Where queue-store credentials come from.
    pub secret_source: SecretSource,
    /// Secret name override; defaults to `{environment}-queue-credentials`.
    pub secret_name: Option<String>,
    /// Where mutual-TLS material comes from.
    pub cert_source: CertSource,
    /// Lets `work` call the endpoint without a client certificate.
    pub allow_plaintext: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),

            database_url: "postgres://localhost/queue".to_string(),
            queue_table: "queue_entries".to_string(),
            retry_ceiling: 3,
            db_acquire_timeout: Duration::from_secs(30),

            batch_size: 8,
            max_workers: 25,
            stale_threshold: Duration::from_secs(30 * 60),
            dispatch_interval: Duration::from_secs(60),
            retry_failed: false,

            endpoint_url: "https://api.example.com/process".to_string(),
            call_timeout: Duration::from_secs(30),
            wall_clock_timeout: Duration::from_secs(60),
            owner_id: None,

            launcher: LauncherKind::Docker,
            worker_image: "queue-dispatch:latest".to_string(),
            docker_network: None,

            secret_source: SecretSource::None,
            secret_name: None,
            cert_source: CertSource::None,
            allow_plaintext: false,
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: queue store URL (required)
    /// - `QUEUE_ENVIRONMENT`: deployment name (default: dev)
    /// - `QUEUE_TABLE`: queue table name (default: queue_entries)
    /// - `QUEUE_RETRY_CEILING`: retry ceiling (default: 3)
    /// - `QUEUE_DB_ACQUIRE_TIMEOUT_SECS`: connection acquire timeout (default: 30)
    /// - `QUEUE_BATCH_SIZE`: rows per worker (default: 8)
    /// - `QUEUE_MAX_WORKERS`: worker launches per cycle (default: 25)
    /// - `QUEUE_STALE_THRESHOLD_MINUTES`: stale threshold (default: 30)
    /// - `QUEUE_DISPATCH_INTERVAL_SECS`: loop interval (default: 60)
    /// - `QUEUE_RETRY_FAILED`: requeue failed rows each cycle (default: false)
    /// - `QUEUE_ENDPOINT_URL`: external endpoint
    /// - `QUEUE_CALL_TIMEOUT_SECS`: per-call timeout (default: 30)
    /// - `QUEUE_WALL_CLOCK_TIMEOUT_SECS`: worker budget (default: 60)
    /// - `QUEUE_WORKER_OWNER_ID`: owner id set by the dispatcher
    /// - `QUEUE_LAUNCHER`: `docker` or `process` (default: docker)
    /// - `QUEUE_WORKER_IMAGE`: worker container image
    /// - `QUEUE_DOCKER_NETWORK`: worker container network
    /// - `QUEUE_SECRET_SOURCE`: `none`, `env` or `dir:<path>` (default: none)
    /// - `QUEUE_SECRET_NAME`: credentials secret name
    /// - `QUEUE_CERT_SOURCE`: `none`, `dir:<path>` or `http:<base-url>` (default: none)
    /// - `QUEUE_ALLOW_PLAINTEXT`: run workers without a client certificate (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None)
    }

    /// Like [`Settings::from_env`], but `database_url` (when given) takes the
    /// place of `DATABASE_URL`.
    pub fn from_env_with(database_url: Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("QUEUE_ENVIRONMENT") {
            config.environment = val;
        }

        // Queue store - DATABASE_URL is required
        config.database_url = match database_url {
            Some(url) => url,
            None => std::env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?,
        };

        if let Ok(val) = std::env::var("QUEUE_TABLE") {
            config.queue_table = val;
        }

        if let Ok(val) = std::env::var("QUEUE_RETRY_CEILING") {
            config.retry_ceiling = parse_env_value(&val, "QUEUE_RETRY_CEILING")?;
        }

        if let Ok(val) = std::env::var("QUEUE_DB_ACQUIRE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_DB_ACQUIRE_TIMEOUT_SECS")?;
            config.db_acquire_timeout = Duration::from_secs(secs);
        }

        // Dispatch
        if let Ok(val) = std::env::var("QUEUE_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "QUEUE_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("QUEUE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "QUEUE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("QUEUE_STALE_THRESHOLD_MINUTES") {
            config.stale_threshold = parse_env_minutes(&val, "QUEUE_STALE_THRESHOLD_MINUTES")?;
        }

        if let Ok(val) = std::env::var("QUEUE_DISPATCH_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_DISPATCH_INTERVAL_SECS")?;
            config.dispatch_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("QUEUE_RETRY_FAILED") {
            config.retry_failed = parse_env_bool(&val, "QUEUE_RETRY_FAILED")?;
        }

        // Worker
        if let Ok(val) = std::env::var("QUEUE_ENDPOINT_URL") {
            config.endpoint_url = val;
        }

        if let Ok(val) = std::env::var("QUEUE_CALL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_CALL_TIMEOUT_SECS")?;
            config.call_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("QUEUE_WALL_CLOCK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_WALL_CLOCK_TIMEOUT_SECS")?;
            config.wall_clock_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("QUEUE_WORKER_OWNER_ID") {
            config.owner_id = Some(val);
        }

        // Launching
        if let Ok(val) = std::env::var("QUEUE_LAUNCHER") {
            config.launcher = parse_env_value(&val, "QUEUE_LAUNCHER")?;
        }

        if let Ok(val) = std::env::var("QUEUE_WORKER_IMAGE") {
            config.worker_image = val;
        }

        if let Ok(val) = std::env::var("QUEUE_DOCKER_NETWORK") {
            config.docker_network = Some(val);
        }

        // Provisioning
        if let Ok(val) = std::env::var("QUEUE_SECRET_SOURCE") {
            config.secret_source = parse_env_value(&val, "QUEUE_SECRET_SOURCE")?;
        }

        if let Ok(val) = std::env::var("QUEUE_SECRET_NAME") {
            config.secret_name = Some(val);
        }

        if let Ok(val) = std::env::var("QUEUE_CERT_SOURCE") {
            config.cert_source = parse_env_value(&val, "QUEUE_CERT_SOURCE")?;
        }

        if let Ok(val) = std::env::var("QUEUE_ALLOW_PLAINTEXT") {
            config.allow_plaintext = parse_env_bool(&val, "QUEUE_ALLOW_PLAINTEXT")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "environment cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        // The table name is interpolated into every statement.
        if !schema::is_valid_table_name(&self.queue_table) {
            return Err(ConfigError::ValidationFailed(format!(
                "queue_table '{}' is not a valid SQL identifier",
                self.queue_table
            )));
        }

        if self.retry_ceiling <= 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_ceiling must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.stale_threshold.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stale_threshold must be greater than 0".to_string(),
            ));
        }

        if self.stale_threshold > MAX_STALE_THRESHOLD {
            return Err(ConfigError::ValidationFailed(format!(
                "stale_threshold must not exceed {} minutes",
                MAX_STALE_THRESHOLD.as_secs() / 60
            )));
        }

        if self.dispatch_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dispatch_interval must be greater than 0".to_string(),
            ));
        }

        if self.endpoint_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "endpoint_url cannot be empty".to_string(),
            ));
        }

        if self.call_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.wall_clock_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "wall_clock_timeout must be greater than 0".to_string(),
            ));
        }

        if self.worker_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker_image cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Queue-store settings shared by the dispatcher and workers.
    pub fn queue(&self) -> QueueConfig {
        QueueConfig::new(&self.queue_table)
            .with_retry_ceiling(self.retry_ceiling)
            .with_acquire_timeout(self.db_acquire_timeout)
    }

    /// Settings for a dispatcher.
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig::new(&self.environment)
            .with_batch_size(self.batch_size)
            .with_max_workers(self.max_workers)
            .with_stale_threshold(self.stale_threshold)
            .with_interval(self.dispatch_interval)
            .with_retry_failed(self.retry_failed)
    }

    /// Settings for a worker owning `owner_id`.
    pub fn worker(&self, owner_id: impl Into<String>) -> WorkerConfig {
        WorkerConfig::new(owner_id)
            .with_batch_size(self.batch_size)
            .with_wall_clock_timeout(self.wall_clock_timeout)
    }

    /// Settings for the worker launcher.
    ///
    /// Workers inherit this process's `DATABASE_URL`, `RUST_LOG` and
    /// `QUEUE_*` variables.
    pub fn launcher(&self) -> LauncherConfig {
        let mut config = LauncherConfig::new(self.launcher)
            .with_image(&self.worker_image)
            .with_inherited_env(LauncherConfig::forwarded_env());
        if let Some(network) = &self.docker_network {
            config = config.with_network(network);
        }
        config
    }

    /// Settings for worker provisioning.
    pub fn provision(&self) -> ProvisionConfig {
        let mut config = ProvisionConfig::new(&self.environment)
            .with_secret_source(self.secret_source.clone())
            .with_cert_source(self.cert_source.clone())
            .with_client_cert_required(!self.allow_plaintext);
        if let Some(name) = &self.secret_name {
            config = config.with_secret_name(name);
        }
        config
    }

    /// Credentials secret name for this environment.
    pub fn secret_name(&self) -> String {
        self.provision().secret_name()
    }

    /// Builder method to set the environment name.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the queue table name.
    pub fn with_queue_table(mut self, table: impl Into<String>) -> Self {
        self.queue_table = table.into();
        self
    }

    /// Builder method to set the retry ceiling.
    pub fn with_retry_ceiling(mut self, ceiling: i32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Builder method to set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method to set the per-cycle worker cap.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Builder method to set the stale threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Builder method to set the endpoint URL.
    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = url.into();
        self
    }

    /// Builder method to set the external call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Builder method to set the worker wall-clock budget.
    pub fn with_wall_clock_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_timeout = timeout;
        self
    }

    /// Builder method to allow workers without a client certificate.
    pub fn with_allow_plaintext(mut self, allow: bool) -> Self {
        self.allow_plaintext = allow;
        self
    }

    /// Builder method to set the launcher kind.
    pub fn with_launcher(mut self, launcher: LauncherKind) -> Self {
        self.launcher = launcher;
        self
    }
}

/// Parses a whole number of minutes into a `Duration`.
fn parse_env_minutes(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let minutes: u64 = parse_env_value(value, key)?;
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{minutes} minutes is out of range"),
        })
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let config = Settings::default();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.max_workers, 25);
        assert_eq!(config.stale_threshold, Duration::from_secs(1800));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.wall_clock_timeout, Duration::from_secs(60));
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.dispatch_interval, Duration::from_secs(60));
        assert!(!config.retry_failed);
        assert_eq!(config.launcher, LauncherKind::Docker);
    }

    #[test]
    fn test_settings_builder() {
        let config = Settings::new()
            .with_environment("prod")
            .with_database_url("sqlite::memory:")
            .with_queue_table("work_items")
            .with_retry_ceiling(5)
            .with_batch_size(4)
            .with_max_workers(10)
            .with_stale_threshold(Duration::from_secs(600))
            .with_endpoint_url("https://processor.internal/run")
            .with_call_timeout(Duration::from_secs(5))
            .with_launcher(LauncherKind::Process);

        assert_eq!(config.environment, "prod");
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.queue_table, "work_items");
        assert_eq!(config.retry_ceiling, 5);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.stale_threshold, Duration::from_secs(600));
        assert_eq!(config.endpoint_url, "https://processor.internal/run");
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.launcher, LauncherKind::Process);
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let result = Settings::default().with_batch_size(0).validate();
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_allows_zero_max_workers() {
        assert!(Settings::default().with_max_workers(0).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_injected_table_name() {
        let result = Settings::default()
            .with_queue_table("entries; DROP TABLE users")
            .validate();
        assert!(result.unwrap_err().to_string().contains("queue_table"));
    }

    #[test]
    fn test_validation_zero_retry_ceiling() {
        let result = Settings::default().with_retry_ceiling(0).validate();
        assert!(result.unwrap_err().to_string().contains("retry_ceiling"));
    }

    #[test]
    fn test_validation_zero_timeouts() {
        let result = Settings::default()
            .with_call_timeout(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("call_timeout"));

        let result = Settings::default()
            .with_wall_clock_timeout(Duration::ZERO)
            .validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("wall_clock_timeout"));
    }

    #[test]
    fn test_validation_empty_database_url() {
        let result = Settings::default().with_database_url("").validate();
        assert!(result.unwrap_err().to_string().contains("database_url"));
    }

    #[test]
    fn test_component_configs() {
        let settings = Settings::default()
            .with_environment("staging")
            .with_batch_size(5)
            .with_max_workers(7);

        let dispatcher = settings.dispatcher();
        assert_eq!(dispatcher.environment, "staging");
        assert_eq!(dispatcher.batch_size, 5);
        assert_eq!(dispatcher.max_workers, 7);

        let worker = settings.worker("staging-1");
        assert_eq!(worker.owner_id, "staging-1");
        assert_eq!(worker.batch_size, 5);

        let queue = settings.queue();
        assert_eq!(queue.table, "queue_entries");
        assert_eq!(queue.retry_ceiling, 3);

        let provision = settings.provision();
        assert_eq!(provision.environment, "staging");
        assert_eq!(provision.secret_source, SecretSource::None);
        assert!(provision.require_client_cert);
        assert!(!settings.clone().with_allow_plaintext(true).provision().require_client_cert);

        let launcher = settings.launcher();
        assert_eq!(launcher.kind, LauncherKind::Docker);
        assert_eq!(launcher.image, "queue-dispatch:latest");
    }

    #[test]
    fn test_secret_name_default() {
        let settings = Settings::default().with_environment("prod");
        assert_eq!(settings.secret_name(), "prod-queue-credentials");
    }

    #[test]
    fn test_validation_stale_threshold_bounds() {
        let config = Settings::default().with_stale_threshold(MAX_STALE_THRESHOLD);
        assert!(config.validate().is_ok());

        let config = Settings::default()
            .with_stale_threshold(MAX_STALE_THRESHOLD + Duration::from_secs(60));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_parse_env_minutes() {
        assert_eq!(
            parse_env_minutes("30", "K").unwrap(),
            Duration::from_secs(1800)
        );
        assert!(matches!(
            parse_env_minutes(&u64::MAX.to_string(), "K"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(parse_env_minutes("soon", "K").is_err());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("DATABASE_URL".to_string());
        assert!(err.to_string().contains("DATABASE_URL"));

        let err = ConfigError::InvalidValue {
            key: "QUEUE_BATCH_SIZE".to_string(),
            message: "could not parse 'x'".to_string(),
        };
        assert!(err.to_string().contains("QUEUE_BATCH_SIZE"));
    }
}
