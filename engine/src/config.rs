//! Engine configuration.

use std::env;
use std::time::Duration;

/// Default number of failed pushes before an operation is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between two pushed operations.
pub const DEFAULT_PUSH_DELAY: Duration = Duration::from_millis(100);

/// Configuration of an [`OfflineStorage`](crate::OfflineStorage) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// SQLite URL of the local database
    pub database_url: String,
    /// Base URL of the remote table API, if any
    pub remote_url: Option<String>,
    /// Failed pushes before an operation is abandoned
    pub max_retries: u32,
    /// Pause between pushed operations
    pub push_delay: Duration,
    /// Auto-sync period; `None` leaves syncing to the caller
    pub auto_sync_interval: Option<Duration>,
    /// Run a sync as soon as connectivity comes back
    pub sync_on_reconnect: bool,
    /// Abandon operations the remote rejected with a permanent (4xx) error
    /// instead of spending the remaining retries on them
    pub fail_fast_on_permanent: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://harbor.db".to_string(),
            remote_url: None,
            max_retries: DEFAULT_MAX_RETRIES,
            push_delay: DEFAULT_PUSH_DELAY,
            auto_sync_interval: None,
            sync_on_reconnect: true,
            fail_fast_on_permanent: false,
        }
    }
}

impl SyncConfig {
    /// Configuration for a local database URL with default sync settings.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Configuration backed by a private in-memory database (useful for testing).
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    #[must_use]
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    #[must_use]
    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    #[must_use]
    pub fn with_auto_sync(mut self, interval: Duration) -> Self {
        self.auto_sync_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_sync_on_reconnect(mut self, enabled: bool) -> Self {
        self.sync_on_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_fail_fast_on_permanent(mut self, enabled: bool) -> Self {
        self.fail_fast_on_permanent = enabled;
        self
    }

    /// Load configuration from `HARBOR_*` environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HARBOR_DATABASE_URL` | `sqlite://harbor.db` |
    /// | `HARBOR_REMOTE_URL` | unset |
    /// | `HARBOR_MAX_RETRIES` | `3` |
    /// | `HARBOR_PUSH_DELAY_MS` | `100` |
    /// | `HARBOR_AUTO_SYNC_SECS` | unset (disabled) |
    /// | `HARBOR_SYNC_ON_RECONNECT` | `true` |
    /// | `HARBOR_FAIL_FAST` | `false` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let parse_u64 = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(key)
                .map(|value| value.trim().parse().map_err(|_| ConfigError::Invalid(key)))
                .transpose()
        };
        let parse_bool = |key: &'static str, default: bool| -> Result<bool, ConfigError> {
            match lookup(key).as_deref().map(str::trim) {
                None => Ok(default),
                Some("1" | "true" | "yes") => Ok(true),
                Some("0" | "false" | "no") => Ok(false),
                Some(_) => Err(ConfigError::Invalid(key)),
            }
        };

        let max_retries = match parse_u64("HARBOR_MAX_RETRIES")? {
            Some(n) => u32::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid("HARBOR_MAX_RETRIES"))?,
            None => defaults.max_retries,
        };

        Ok(Self {
            database_url: lookup("HARBOR_DATABASE_URL").unwrap_or(defaults.database_url),
            remote_url: lookup("HARBOR_REMOTE_URL").filter(|url| !url.trim().is_empty()),
            max_retries,
            push_delay: parse_u64("HARBOR_PUSH_DELAY_MS")?
                .map_or(defaults.push_delay, Duration::from_millis),
            auto_sync_interval: parse_u64("HARBOR_AUTO_SYNC_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            sync_on_reconnect: parse_bool("HARBOR_SYNC_ON_RECONNECT", defaults.sync_on_reconnect)?,
            fail_fast_on_permanent: parse_bool(
                "HARBOR_FAIL_FAST",
                defaults.fail_fast_on_permanent,
            )?,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {0}")]
    Invalid(&'static str),
}
