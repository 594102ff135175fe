//! Configuration, read from the environment (and `.env`) once at startup.
//!
//! Everything here is consumed at construction; nothing is mutable while
//! the manager runs.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::domain::LogLevel;
use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Typed access over a key -> value lookup. Empty strings count as unset.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.opt(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw,
                    reason: e.to_string(),
                }),
        }
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn secs_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub manager: ManagerConfig,
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    /// Build config from process environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let config = Self {
            server: ServerConfig::from_env(&env)?,
            manager: ManagerConfig::from_env(&env)?,
            logging: LoggingConfig::from_env(&env)?,
            dispatch: DispatchConfig::from_env(&env)?,
        };
        config.manager.validate()?;
        Ok(config)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let m = &self.manager;
        tracing::info!("Config loaded:");
        tracing::info!(
            "  server:    {}:{} api_workers={}",
            self.server.host,
            self.server.port,
            self.server.api_workers
        );
        tracing::info!(
            "  engine:    workers={} queue_size={} max_attempts={} timeout={:?}",
            m.engine_workers,
            m.queue_capacity,
            m.max_attempts,
            m.task_timeout
        );
        tracing::info!(
            "  retention: released={:?} orphaned={:?} gc_every={:?} shutdown_grace={:?}",
            m.retention,
            m.orphan_retention,
            m.gc_interval,
            m.shutdown_grace
        );
        tracing::info!(
            "  logging:   service={} debug={} (enabled={})",
            self.logging.service_level,
            self.logging.debug_level,
            self.logging.debug_enabled
        );
        tracing::info!(
            "  dispatch:  mq={} topic={}",
            self.dispatch.backend,
            self.dispatch.topic
        );
    }
}

// ── Server ────────────────────────────────────────────────────

/// Transport-side settings. Owned by the HTTP layer; carried here so the
/// startup summary shows the full concurrency picture.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request-handling concurrency, independent of `engine_workers`.
    pub api_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_workers: 4,
        }
    }
}

impl ServerConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            host: env.or("HOST", &d.host),
            port: env.parse_or("PORT", d.port)?,
            api_workers: env.parse_or("API_WORKERS", d.api_workers)?,
        })
    }
}

// ── Task manager ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ManagerConfig {
    /// Number of concurrent engine workers (`ENGINE_WORKERS`).
    pub engine_workers: usize,
    /// Bounded queue capacity (`TASK_QUEUE_SIZE`).
    pub queue_capacity: usize,
    /// Default per-task execution timeout; `None` waits forever.
    pub task_timeout: Option<Duration>,
    /// Maximum dispatches per task, first attempt included.
    pub max_attempts: u32,
    /// How long a released task (result consumed or delivered) stays queryable.
    pub retention: Duration,
    /// How long a finished task nobody collected stays queryable.
    pub orphan_retention: Duration,
    pub gc_interval: Duration,
    /// How long shutdown waits for in-flight tasks before failing them.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            engine_workers: 2,
            queue_capacity: 1000,
            task_timeout: None,
            max_attempts: 1,
            retention: Duration::from_secs(300),
            orphan_retention: Duration::from_secs(3600),
            gc_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            engine_workers: env.parse_or("ENGINE_WORKERS", d.engine_workers)?,
            queue_capacity: env.parse_or("TASK_QUEUE_SIZE", d.queue_capacity)?,
            task_timeout: env.millis("TASK_TIMEOUT_MS")?,
            max_attempts: env.parse_or("MAX_ATTEMPTS", d.max_attempts)?,
            retention: env.secs_or("TASK_RETENTION_SECS", d.retention)?,
            orphan_retention: env.secs_or("TASK_ORPHAN_RETENTION_SECS", d.orphan_retention)?,
            gc_interval: env.secs_or("GC_INTERVAL_SECS", d.gc_interval)?,
            shutdown_grace: env.millis("SHUTDOWN_GRACE_MS")?.unwrap_or(d.shutdown_grace),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_workers == 0 {
            return Err(ConfigError::Zero("ENGINE_WORKERS"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("TASK_QUEUE_SIZE"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("MAX_ATTEMPTS"));
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Zero("TASK_TIMEOUT_MS"));
        }
        if self.gc_interval.is_zero() {
            return Err(ConfigError::Zero("GC_INTERVAL_SECS"));
        }
        Ok(())
    }
}

// ── Logging ───────────────────────────────────────────────────

/// Per-channel log settings. The two channels are filtered independently.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub service_level: LogLevel,
    pub debug_level: LogLevel,
    pub debug_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_level: LogLevel::Info,
            debug_level: LogLevel::Debug,
            debug_enabled: true,
        }
    }
}

impl LoggingConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            service_level: env.parse_or("SERVICE_LOG_LEVEL", d.service_level)?,
            debug_level: env.parse_or("DEBUG_LOG_LEVEL", d.debug_level)?,
            debug_enabled: env.parse_or("DEBUG_LOG_ENABLED", d.debug_enabled)?,
        })
    }

    /// `EnvFilter` directives selecting each channel's tracing target.
    pub fn filter_directives(&self) -> String {
        let debug = if self.debug_enabled {
            self.debug_level.as_str()
        } else {
            "off"
        };
        format!(
            "info,{}={},{}={}",
            crate::impls::SERVICE_TARGET,
            self.service_level,
            crate::impls::DEBUG_TARGET,
            debug
        )
    }
}

// ── Result dispatch ───────────────────────────────────────────

/// Message-queue backend used to deliver ASYNC results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MqBackend {
    /// Delivery disabled; results are only queryable.
    #[default]
    None,
    /// In-process buffer, for tests and local runs.
    Memory,
}

impl FromStr for MqBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(MqBackend::None),
            "memory" => Ok(MqBackend::Memory),
            other => Err(ConfigError::Unsupported {
                key: "MQ_TYPE",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for MqBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MqBackend::None => "none",
            MqBackend::Memory => "memory",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchConfig {
    pub backend: MqBackend,
    pub topic: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backend: MqBackend::None,
            topic: "task_status".to_string(),
        }
    }
}

impl DispatchConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let backend = match env.opt("MQ_TYPE") {
            Some(raw) => raw.parse()?,
            None => d.backend,
        };
        Ok(Self {
            backend,
            topic: env.or("MQ_TOPIC", &d.topic),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.api_workers, 4);
        assert_eq!(config.manager.engine_workers, 2);
        assert_eq!(config.manager.queue_capacity, 1000);
        assert_eq!(config.manager.task_timeout, None);
        assert_eq!(config.dispatch.backend, MqBackend::None);
        assert_eq!(config.dispatch.topic, "task_status");
    }

    #[test]
    fn reads_manager_settings() {
        let config = load(&[
            ("ENGINE_WORKERS", "8"),
            ("TASK_QUEUE_SIZE", "16"),
            ("TASK_TIMEOUT_MS", "1500"),
            ("MAX_ATTEMPTS", "3"),
            ("SHUTDOWN_GRACE_MS", "250"),
            ("MQ_TYPE", "memory"),
        ])
        .unwrap();
        assert_eq!(config.manager.engine_workers, 8);
        assert_eq!(config.manager.queue_capacity, 16);
        assert_eq!(config.manager.task_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.manager.max_attempts, 3);
        assert_eq!(config.manager.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.dispatch.backend, MqBackend::Memory);
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = load(&[("ENGINE_WORKERS", ""), ("HOST", "  ")]).unwrap();
        assert_eq!(config.manager.engine_workers, 2);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[rstest]
    #[case("ENGINE_WORKERS", "two")]
    #[case("PORT", "99999")]
    #[case("TASK_TIMEOUT_MS", "-1")]
    #[case("DEBUG_LOG_ENABLED", "maybe")]
    #[case("SERVICE_LOG_LEVEL", "loud")]
    fn malformed_values_are_errors(#[case] key: &str, #[case] value: &str) {
        let err = load(&[(key, value)]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[rstest]
    #[case("ENGINE_WORKERS")]
    #[case("TASK_QUEUE_SIZE")]
    #[case("MAX_ATTEMPTS")]
    #[case("TASK_TIMEOUT_MS")]
    fn zero_is_rejected(#[case] key: &str) {
        let err = load(&[(key, "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Zero(_)), "{err}");
    }

    #[test]
    fn unknown_mq_backend_is_unsupported() {
        let err = load(&[("MQ_TYPE", "kafka")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Unsupported {
                key: "MQ_TYPE",
                value: "kafka".to_string()
            }
        );
    }

    #[rstest]
    #[case(LogLevel::Info, LogLevel::Debug, true, "info,loom::service=info,loom::debug=debug")]
    #[case(LogLevel::Warn, LogLevel::Info, true, "info,loom::service=warn,loom::debug=info")]
    #[case(LogLevel::Info, LogLevel::Debug, false, "info,loom::service=info,loom::debug=off")]
    fn channel_filters_are_independent(
        #[case] service_level: LogLevel,
        #[case] debug_level: LogLevel,
        #[case] debug_enabled: bool,
        #[case] expected: &str,
    ) {
        let logging = LoggingConfig {
            service_level,
            debug_level,
            debug_enabled,
        };
        assert_eq!(logging.filter_directives(), expected);
    }
}
