//! Server settings read from the environment.

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Upper bound of the connection pool
    pub max_connections: u32,
    /// How long a handler waits for a pooled connection
    pub acquire_timeout: Duration,
}

impl Config {
    pub const DEFAULT_PORT: u16 = 3000;
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Load configuration from environment variables.
    ///
    /// `HOST`, `PORT`, `DATABASE_URL`, `DB_MAX_CONNECTIONS` and
    /// `DB_ACQUIRE_TIMEOUT_SECS` are read; only `DATABASE_URL` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let positive = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or(ConfigError::Invalid(key))
                })
                .transpose()
        };

        let port = match lookup("PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT"))?,
            None => Self::DEFAULT_PORT,
        };

        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let max_connections = match positive("DB_MAX_CONNECTIONS")? {
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::Invalid("DB_MAX_CONNECTIONS"))?,
            None => Self::DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            database_url,
            max_connections,
            acquire_timeout: positive("DB_ACQUIRE_TIMEOUT_SECS")?
                .map_or(Self::DEFAULT_ACQUIRE_TIMEOUT, Duration::from_secs),
        })
    }

    /// Socket address the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid {0} value")]
    Invalid(&'static str),
}
