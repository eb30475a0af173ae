#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use sql_table::test_utils::{setup_postgres_embedded, stop_postgres_embedded};
use sql_table::{Database, PostgresConfig, SqlTableError};

/// Start an embedded server, connect a pool of `max_size` connections and run
/// `test` against it on a fresh runtime. The server is stopped afterwards
/// whatever the outcome.
pub fn with_database<F, Fut>(
    dbname: &str,
    max_size: u32,
    test: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(Database) -> Fut,
    Fut: Future<Output = Result<(), SqlTableError>>,
{
    with_config(
        dbname,
        |config| config.with_pool_size(None, max_size),
        test,
    )
}

/// Like [`with_database`] with full control over the pool settings.
pub fn with_config<C, F, Fut>(
    dbname: &str,
    configure: C,
    test: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    C: FnOnce(PostgresConfig) -> PostgresConfig,
    F: FnOnce(Database) -> Fut,
    Fut: Future<Output = Result<(), SqlTableError>>,
{
    init_tracing();
    let pg = setup_postgres_embedded(dbname)?;
    let config = configure(pg.config.clone());

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async move {
        let db = Database::connect(config).await?;
        test(db).await
    });
    drop(rt);

    stop_postgres_embedded(pg);
    result?;
    Ok(())
}

pub fn short_timeout(config: PostgresConfig) -> PostgresConfig {
    config
        .with_pool_size(None, 1)
        .with_acquire_timeout(Duration::from_millis(250))
}

/// Route library events to the test harness output; set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
