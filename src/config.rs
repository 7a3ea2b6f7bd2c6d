use crate::error::app_error::SessionError;
use crate::models::activity::ActivityEvent;
use chrono::{DateTime, TimeDelta, Utc};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SESSION_KEY: &str = "session_data";
pub const DEFAULT_ATTEMPTS_KEY: &str = "login_attempts";

const MAX_DURATION_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub policy: SessionPolicy,
    pub storage: StorageConfig,
    pub activity: ActivityConfig,
    pub logging: LoggingConfig,
}

/// Timing and lockout policy for the session engine.
///
/// All durations are milliseconds so the same values can come from a TOML file or
/// `SENTINEL_POLICY__*` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub session_timeout_ms: u64,
    pub remember_me_ms: u64,
    pub max_attempts: u32,
    pub lockout_ms: u64,
    pub retention_ms: u64,
    pub check_interval_ms: u64,
    /// When set, `extend_session` reuses the remember-me window for remembered sessions
    /// instead of always falling back to `session_timeout_ms`.
    pub extend_uses_remember_me: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
    Redis,
    Postgres,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: String,
    pub url: String,
    pub session_key: String,
    pub attempts_key: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ActivityConfig {
    pub events: Vec<ActivityEvent>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30 * 60 * 1000,
            remember_me_ms: 30 * 24 * 60 * 60 * 1000,
            max_attempts: 5,
            lockout_ms: 15 * 60 * 1000,
            retention_ms: 24 * 60 * 60 * 1000,
            check_interval_ms: 60 * 1000,
            extend_uses_remember_me: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: ".sentinel".to_string(),
            url: String::new(),
            session_key: DEFAULT_SESSION_KEY.to_string(),
            attempts_key: DEFAULT_ATTEMPTS_KEY.to_string(),
            max_connections: 4,
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            events: ActivityEvent::ALL.to_vec(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl SessionPolicy {
    pub fn session_timeout(&self) -> TimeDelta {
        millis(self.session_timeout_ms)
    }

    pub fn remember_me(&self) -> TimeDelta {
        millis(self.remember_me_ms)
    }

    pub fn lockout(&self) -> TimeDelta {
        millis(self.lockout_ms)
    }

    pub fn retention(&self) -> TimeDelta {
        millis(self.retention_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_attempts == 0 {
            return Err(SessionError::InvalidConfiguration("max_attempts must be at least 1".to_string()));
        }

        let durations = [
            ("session_timeout_ms", self.session_timeout_ms),
            ("remember_me_ms", self.remember_me_ms),
            ("lockout_ms", self.lockout_ms),
            ("retention_ms", self.retention_ms),
            ("check_interval_ms", self.check_interval_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(SessionError::InvalidConfiguration(format!("{name} must be greater than zero")));
            }
            if value > MAX_DURATION_MS {
                return Err(SessionError::InvalidConfiguration(format!("{name} exceeds ten years")));
            }
        }

        // A lockout outliving the retention window would be pruned away while still active.
        if self.retention_ms < self.lockout_ms {
            return Err(SessionError::InvalidConfiguration(
                "retention_ms must be at least as long as lockout_ms".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from multiple sources in priority order:
    /// 1. Built-in defaults
    /// 2. Sentinel.toml (if it exists)
    /// 3. Environment variables (prefixed with SENTINEL_, nested with "__", e.g. SENTINEL_POLICY__MAX_ATTEMPTS)
    pub fn load() -> Result<Self, SessionError> {
        let config: Config = Self::figment()?.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment() -> Result<Figment, SessionError> {
        let defaults = toml::to_string(&Config::default())?;

        Ok(Figment::new()
            .merge(Toml::string(&defaults))
            .merge(Toml::file("Sentinel.toml"))
            .merge(Env::prefixed("SENTINEL_").split("__")))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        self.policy.validate()?;

        if self.activity.events.is_empty() {
            return Err(SessionError::InvalidConfiguration("activity.events must not be empty".to_string()));
        }

        if matches!(self.storage.backend, StorageBackend::Redis | StorageBackend::Postgres) && self.storage.url.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(format!(
                "storage.url is required for the {:?} backend",
                self.storage.backend
            )));
        }

        if self.storage.session_key == self.storage.attempts_key {
            return Err(SessionError::InvalidConfiguration(
                "storage.session_key and storage.attempts_key must differ".to_string(),
            ));
        }

        Ok(())
    }
}

pub(crate) fn millis(ms: u64) -> TimeDelta {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    TimeDelta::try_milliseconds(ms).unwrap_or(TimeDelta::MAX)
}

/// `at + delta`, saturating at the maximum representable instant.
pub(crate) fn offset(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
