use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use bb8::{ManageConnection, Pool};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::config::{PostgresConfig, SslMode};
use crate::error::SqlTableError;

#[derive(Clone)]
enum Connector {
    Plain,
    #[cfg(feature = "tls")]
    Tls(postgres_openssl::MakeTlsConnector),
}

/// bb8 manager for Postgres clients.
#[derive(Clone)]
pub struct PgManager {
    config: tokio_postgres::Config,
    connector: Connector,
}

impl PgManager {
    /// # Errors
    /// Returns `SqlTableError::ConfigError` if TLS is requested but cannot be set up.
    pub fn new(config: &PostgresConfig) -> Result<Self, SqlTableError> {
        Ok(Self {
            config: config.to_pg_config(),
            connector: connector(config)?,
        })
    }

    /// Build a pool from this manager, sized and timed per `config`.
    ///
    /// # Errors
    /// Returns `SqlTableError::ConnectionError` if pool creation fails.
    pub async fn build_pool(self, config: &PostgresConfig) -> Result<Pool<PgManager>, SqlTableError> {
        debug!(
            host = ?config.host,
            dbname = ?config.dbname,
            max_size = config.max_size,
            "building postgres pool"
        );
        Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_size)
            .connection_timeout(config.acquire_timeout)
            .build(self)
            .await
            .map_err(|e| SqlTableError::ConnectionError(format!("postgres pool error: {e}")))
    }
}

/// A pooled client. Once marked broken it is discarded instead of being
/// handed out again, e.g. when its session state is unknown.
pub struct PgConnection {
    client: Client,
    broken: AtomicBool,
}

impl PgConnection {
    fn new(client: Client) -> Self {
        Self {
            client,
            broken: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire) || self.client.is_closed()
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl ManageConnection for PgManager {
    type Connection = PgConnection;
    type Error = tokio_postgres::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        let connector = self.connector.clone();
        async move {
            debug!(hosts = ?cfg.get_hosts(), db = ?cfg.get_dbname(), "connect start");
            let client = match connector {
                Connector::Plain => {
                    let (client, connection) = cfg.connect(NoTls).await?;
                    tokio::spawn(async move {
                        if let Err(e) = connection.await
                            && !e.is_closed()
                        {
                            warn!(error = %e, "postgres connection error");
                        }
                    });
                    client
                }
                #[cfg(feature = "tls")]
                Connector::Tls(tls) => {
                    let (client, connection) = cfg.connect(tls).await?;
                    tokio::spawn(async move {
                        if let Err(e) = connection.await
                            && !e.is_closed()
                        {
                            warn!(error = %e, "postgres connection error");
                        }
                    });
                    client
                }
            };
            debug!("connect established");
            Ok(PgConnection::new(client))
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.simple_query("SELECT 1").await.map(|_| ()) }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}

#[cfg(not(feature = "tls"))]
fn connector(config: &PostgresConfig) -> Result<Connector, SqlTableError> {
    match config.ssl_mode {
        SslMode::Disable => Ok(Connector::Plain),
        mode => Err(SqlTableError::ConfigError(format!(
            "sslmode {mode:?} requires the `tls` feature"
        ))),
    }
}

#[cfg(feature = "tls")]
fn connector(config: &PostgresConfig) -> Result<Connector, SqlTableError> {
    use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};

    if config.ssl_mode == SslMode::Disable {
        return Ok(Connector::Plain);
    }
    let tls_error = |e: openssl::error::ErrorStack| SqlTableError::ConfigError(format!("tls setup: {e}"));

    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_error)?;
    if let Some(path) = config.ssl_root_cert.as_deref() {
        builder.set_ca_file(path).map_err(tls_error)?;
    }
    if let Some(path) = config.ssl_cert.as_deref() {
        builder.set_certificate_chain_file(path).map_err(tls_error)?;
    }
    if let Some(path) = config.ssl_key.as_deref() {
        builder
            .set_private_key_file(path, SslFiletype::PEM)
            .map_err(tls_error)?;
    }
    match config.ssl_mode {
        SslMode::Prefer | SslMode::Require => builder.set_verify(SslVerifyMode::NONE),
        _ => builder.set_verify(SslVerifyMode::PEER),
    }

    let mut tls = postgres_openssl::MakeTlsConnector::new(builder.build());
    if config.ssl_mode != SslMode::VerifyFull {
        tls.set_callback(|connect, _domain| {
            connect.set_verify_hostname(false);
            Ok(())
        });
    }
    Ok(Connector::Tls(tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "tls"))]
    #[test]
    fn tls_modes_need_the_feature() {
        let config = PostgresConfig {
            ssl_mode: SslMode::Require,
            ..PostgresConfig::new("db", "app")
        };
        let err = PgManager::new(&config).err().unwrap();
        assert!(matches!(err, SqlTableError::ConfigError(_)));
    }

    #[test]
    fn plain_manager_carries_connection_settings() {
        let config = PostgresConfig {
            port: Some(6543),
            ..PostgresConfig::new("db", "app")
        };
        let manager = PgManager::new(&config).unwrap();
        assert_eq!(manager.config.get_dbname(), Some("db"));
        assert_eq!(manager.config.get_user(), Some("app"));
        assert_eq!(manager.config.get_ports(), &[6543]);
    }
}
