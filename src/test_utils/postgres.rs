use postgresql_embedded::PostgreSQL;
use tokio_postgres::NoTls;
use tracing::{info, warn};

use super::SHARED_RUNTIME;
use crate::postgres::PostgresConfig;

/// A running embedded `PostgreSQL` instance.
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub port: u16,
    /// Working settings for the created database, with the server's
    /// generated credentials.
    pub config: PostgresConfig,
}

/// Set up an embedded `PostgreSQL` instance and create `dbname` on it.
///
/// # Errors
/// Returns an error if the embedded server cannot be set up or started, or if
/// database provisioning or the post-start connectivity check fails.
pub fn setup_postgres_embedded(
    dbname: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    SHARED_RUNTIME.block_on(async {
        let mut postgresql = PostgreSQL::default();

        // Bundled binaries, so nothing is downloaded here.
        postgresql.setup().await?;
        postgresql.start().await?;

        let settings = postgresql.settings();
        let port = settings.port;
        let config = PostgresConfig {
            host: Some(settings.host.clone()),
            port: Some(port),
            password: Some(settings.password.clone()),
            ..PostgresConfig::new(dbname, settings.username.clone())
        };

        postgresql.create_database(dbname).await?;

        // Quick connection test
        let (client, connection) = config.to_pg_config().connect(NoTls).await?;
        let driver = tokio::spawn(connection);
        client.simple_query("SELECT 1").await?;
        drop(client);
        if let Ok(Err(e)) = driver.await {
            warn!(error = %e, "embedded postgres check connection ended with error");
        }

        info!(port, dbname, "embedded postgres started");
        Ok(EmbeddedPostgres {
            postgresql,
            port,
            config,
        })
    })
}

/// Stop a previously started embedded `PostgreSQL` instance.
pub fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    let EmbeddedPostgres { postgresql, .. } = postgres;
    SHARED_RUNTIME.block_on(async move {
        if let Err(e) = postgresql.stop().await {
            warn!(error = %e, "failed to stop embedded postgres");
        }
    });
}
