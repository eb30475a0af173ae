use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Deserializer};

use crate::error::SqlTableError;

const DEFAULT_MAX_SIZE: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS negotiation policy, named after libpq's `sslmode` values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// # Errors
    /// Returns `SqlTableError::ConfigError` for an unknown mode name.
    pub fn parse(value: &str) -> Result<Self, SqlTableError> {
        <Self as ValueEnum>::from_str(value, true)
            .map_err(|e| SqlTableError::ConfigError(format!("invalid sslmode {value:?}: {e}")))
    }
}

/// Connection and pool settings for one PostgreSQL database.
#[derive(Clone, Deserialize)]
pub struct PostgresConfig {
    pub dbname: Option<String>,
    #[serde(default = "default_host")]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
    pub ssl_root_cert: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    /// Idle connections the pool keeps open.
    pub min_size: Option<u32>,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    /// How long a scope waits for a pooled connection, in seconds when deserialized.
    #[serde(
        default = "default_acquire_timeout",
        deserialize_with = "deserialize_seconds"
    )]
    pub acquire_timeout: Duration,
}

fn default_host() -> Option<String> {
    Some("localhost".to_string())
}

#[allow(clippy::unnecessary_wraps)]
fn default_port() -> Option<u16> {
    Some(5432)
}

fn default_max_size() -> u32 {
    DEFAULT_MAX_SIZE
}

fn default_acquire_timeout() -> Duration {
    DEFAULT_ACQUIRE_TIMEOUT
}

fn deserialize_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let seconds = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dbname: None,
            host: default_host(),
            port: default_port(),
            user: None,
            password: None,
            ssl_mode: SslMode::default(),
            ssl_root_cert: None,
            ssl_cert: None,
            ssl_key: None,
            min_size: None,
            max_size: DEFAULT_MAX_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("dbname", &self.dbname)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl PostgresConfig {
    #[must_use]
    pub fn new(dbname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            dbname: Some(dbname.into()),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Settings from the libpq environment variables (`PGHOST`, `PGPORT`,
    /// `PGDATABASE`, `PGUSER`, `PGPASSWORD`, `PGSSLMODE`, `PGSSLROOTCERT`,
    /// `PGSSLCERT`, `PGSSLKEY`). Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns `SqlTableError::ConfigError` if `PGPORT` or `PGSSLMODE` is malformed.
    pub fn from_env() -> Result<Self, SqlTableError> {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        let mut config = Self {
            dbname: var("PGDATABASE"),
            user: var("PGUSER"),
            password: var("PGPASSWORD"),
            ssl_root_cert: var("PGSSLROOTCERT").map(PathBuf::from),
            ssl_cert: var("PGSSLCERT").map(PathBuf::from),
            ssl_key: var("PGSSLKEY").map(PathBuf::from),
            ..Self::default()
        };
        if let Some(host) = var("PGHOST") {
            config.host = Some(host);
        }
        if let Some(port) = var("PGPORT") {
            config.port = Some(port.parse().map_err(|e| {
                SqlTableError::ConfigError(format!("invalid PGPORT {port:?}: {e}"))
            })?);
        }
        if let Some(mode) = var("PGSSLMODE") {
            config.ssl_mode = SslMode::parse(&mode)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_pool_size(mut self, min_size: Option<u32>, max_size: u32) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Check that all required fields are present and the pool bounds make sense.
    ///
    /// # Errors
    /// Returns `SqlTableError::ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), SqlTableError> {
        if self.dbname.is_none() {
            return Err(SqlTableError::ConfigError("dbname is required".to_string()));
        }
        if self.host.is_none() {
            return Err(SqlTableError::ConfigError("host is required".to_string()));
        }
        if self.port.is_none() {
            return Err(SqlTableError::ConfigError("port is required".to_string()));
        }
        if self.user.is_none() {
            return Err(SqlTableError::ConfigError("user is required".to_string()));
        }
        if self.max_size == 0 {
            return Err(SqlTableError::ConfigError(
                "max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size.is_some_and(|min| min > self.max_size) {
            return Err(SqlTableError::ConfigError(
                "min_size must not exceed max_size".to_string(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(SqlTableError::ConfigError(
                "acquire_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Driver-level connection settings.
    pub(crate) fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        if let Some(dbname) = &self.dbname {
            pg.dbname(dbname);
        }
        if let Some(host) = &self.host {
            pg.host(host);
        }
        if let Some(port) = self.port {
            pg.port(port);
        }
        if let Some(user) = &self.user {
            pg.user(user);
        }
        if let Some(password) = &self.password {
            pg.password(password);
        }
        pg.ssl_mode(match self.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        });
        pg.connect_timeout(self.acquire_timeout);
        pg
    }
}

type ConfigProvider = Box<dyn FnOnce() -> Result<PostgresConfig, SqlTableError> + Send>;
type AsyncConfigProvider =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<PostgresConfig, SqlTableError>> + Send>;

/// Where `Database::connect` gets its settings from. Providers are called
/// exactly once.
pub enum ConfigSource {
    Value(PostgresConfig),
    Provider(ConfigProvider),
    AsyncProvider(AsyncConfigProvider),
}

impl ConfigSource {
    pub fn provider<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<PostgresConfig, SqlTableError> + Send + 'static,
    {
        Self::Provider(Box::new(f))
    }

    pub fn async_provider<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<PostgresConfig, SqlTableError>> + Send + 'static,
    {
        Self::AsyncProvider(Box::new(move || Box::pin(f())))
    }

    /// # Errors
    /// Propagates the provider's error.
    pub async fn resolve(self) -> Result<PostgresConfig, SqlTableError> {
        match self {
            Self::Value(config) => Ok(config),
            Self::Provider(f) => f(),
            Self::AsyncProvider(f) => f().await,
        }
    }
}

impl From<PostgresConfig> for ConfigSource {
    fn from(config: PostgresConfig) -> Self {
        Self::Value(config)
    }
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(config) => f.debug_tuple("Value").field(config).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
            Self::AsyncProvider(_) => f.write_str("AsyncProvider(..)"),
        }
    }
}
