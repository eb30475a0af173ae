//! Connection and transaction management.
//!
//! A [`Database`] owns the bb8 pool and a table of per-context state. Scopes
//! opened by the same logical context (tokio task, or thread outside a task)
//! share one pooled connection and at most one transaction; different
//! contexts never see each other's connection.

mod scope;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bb8::{Pool, PooledConnection, RunError};
use futures_util::TryStreamExt;
use tracing::{debug, info, trace};

use crate::codec::CodecRegistry;
use crate::context::{ContextKey, ContextRegistry, Installed};
use crate::error::SqlTableError;
use crate::postgres::query::{execute_on_client, query_on_client};
use crate::postgres::{ConfigSource, PgManager};
use crate::results::{RowStream, row_stream};
use crate::statement::{PlaceholderStyle, Statement};
use crate::types::FieldType;

pub use scope::Scope;

pub(crate) type Pooled = PooledConnection<'static, PgManager>;

struct Inner {
    pool: Pool<PgManager>,
    contexts: ContextRegistry<Pooled>,
    registry: CodecRegistry,
    acquire_timeout: Duration,
}

impl Inner {
    /// A statement the server rejected leaves the context's transaction
    /// rollback-only.
    fn note_failure(&self, key: ContextKey, err: &SqlTableError) {
        if err.aborts_transaction() {
            self.contexts.mark_aborted(key, || err.to_string());
        }
    }

    fn observe<T>(&self, key: ContextKey, result: Result<T, SqlTableError>) -> Result<T, SqlTableError> {
        if let Err(err) = &result {
            self.note_failure(key, err);
        }
        result
    }
}

/// Pooled PostgreSQL access with reentrant, per-context scopes.
///
/// Cheap to clone; clones share the pool and the context table.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Resolve the configuration once, validate it and build the pool.
    ///
    /// # Errors
    /// Returns `SqlTableError::ConfigError` for invalid settings or
    /// `SqlTableError::ConnectionError` if the pool cannot be created.
    pub async fn connect(source: impl Into<ConfigSource>) -> Result<Self, SqlTableError> {
        Self::connect_with_registry(source, CodecRegistry::default()).await
    }

    /// Like [`Database::connect`], with codec overrides used by every table
    /// built on this database.
    ///
    /// # Errors
    /// See [`Database::connect`].
    pub async fn connect_with_registry(
        source: impl Into<ConfigSource>,
        registry: CodecRegistry,
    ) -> Result<Self, SqlTableError> {
        let config = source.into().resolve().await?;
        config.validate()?;
        let pool = PgManager::new(&config)?.build_pool(&config).await?;
        info!(
            host = ?config.host,
            dbname = ?config.dbname,
            max_size = config.max_size,
            "database pool ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                contexts: ContextRegistry::default(),
                registry,
                acquire_timeout: config.acquire_timeout,
            }),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &CodecRegistry {
        &self.inner.registry
    }

    /// Native column type for a field type under this database's registry.
    ///
    /// # Errors
    /// Returns `SqlTableError::UnsupportedType` when no codec applies.
    pub fn sql_type(&self, field_type: &FieldType) -> Result<String, SqlTableError> {
        self.inner.registry.sql_type(field_type)
    }

    /// Enter a connection scope for the calling context.
    ///
    /// # Errors
    /// Returns `SqlTableError::PoolTimeout` if no connection frees up in time.
    pub async fn connection(&self) -> Result<Scope, SqlTableError> {
        self.enter(ContextKey::current(), false).await
    }

    /// Enter a transaction scope for the calling context. Only the outermost
    /// scope issues `BEGIN`.
    ///
    /// # Errors
    /// Returns `SqlTableError::PoolTimeout` if no connection frees up in time,
    /// or the driver error if `BEGIN` fails.
    pub async fn transaction(&self) -> Result<Scope, SqlTableError> {
        self.enter(ContextKey::current(), true).await
    }

    /// [`Database::connection`] for an explicit context.
    ///
    /// # Errors
    /// See [`Database::connection`].
    pub async fn connection_for(&self, key: ContextKey) -> Result<Scope, SqlTableError> {
        self.enter(key, false).await
    }

    /// [`Database::transaction`] for an explicit context.
    ///
    /// # Errors
    /// See [`Database::transaction`].
    pub async fn transaction_for(&self, key: ContextKey) -> Result<Scope, SqlTableError> {
        self.enter(key, true).await
    }

    /// Run `f` inside a transaction scope, committing on `Ok` and rolling
    /// back on `Err`.
    ///
    /// ```rust,no_run
    /// # use sql_table::{Database, PostgresConfig, SqlTableError};
    /// # async fn demo(db: Database) -> Result<(), SqlTableError> {
    /// db.transaction_with(|db| async move {
    ///     db.execute_batch("UPDATE counters SET n = n + 1").await
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// The closure's error, or a scope entry/exit failure.
    pub async fn transaction_with<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlTableError> + fmt::Display,
    {
        let scope = self.transaction().await?;
        let result = f(self.clone()).await;
        scope.finish(result).await
    }

    /// Run `f` inside a connection scope.
    ///
    /// # Errors
    /// The closure's error, or a scope entry failure.
    pub async fn connection_with<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlTableError> + fmt::Display,
    {
        let scope = self.connection().await?;
        let result = f(self.clone()).await;
        scope.finish(result).await
    }

    async fn enter(&self, key: ContextKey, transactional: bool) -> Result<Scope, SqlTableError> {
        if let Some((_, depth)) = self.inner.contexts.reenter(key) {
            trace!(context = %key, depth, "entered nested scope");
            return Ok(Scope::new(self.clone(), key, depth));
        }

        let connection = Arc::new(self.checkout().await?);
        let client = Arc::clone(&connection);
        if let Installed::Joined { unused, depth } =
            self.inner.contexts.install(key, connection, transactional)
        {
            // Another scope of this context installed first; ours goes back.
            drop(client);
            drop(unused);
            trace!(context = %key, depth, "joined scope entered concurrently; extra connection returned");
            return Ok(Scope::new(self.clone(), key, depth));
        }
        // From here on the scope guard owns the release.
        let scope = Scope::new(self.clone(), key, 1);
        if transactional {
            if let Err(e) = client.batch_execute("BEGIN").await {
                scope.discard();
                return Err(e.into());
            }
            debug!(context = %key, "transaction started");
        } else {
            trace!(context = %key, "connection checked out");
        }
        Ok(scope)
    }

    async fn checkout(&self) -> Result<Pooled, SqlTableError> {
        self.inner.pool.get_owned().await.map_err(|e| match e {
            RunError::TimedOut => SqlTableError::PoolTimeout(self.inner.acquire_timeout),
            RunError::User(e) => {
                SqlTableError::ConnectionError(format!("postgres checkout error: {e}"))
            }
        })
    }

    /// Run a statement on the calling context's connection and stream its rows.
    ///
    /// # Errors
    /// Returns `SqlTableError::NoActiveConnection` outside any scope.
    pub async fn execute(&self, statement: &Statement) -> Result<RowStream, SqlTableError> {
        self.execute_for(ContextKey::current(), statement).await
    }

    /// [`Database::execute`] for an explicit context.
    ///
    /// # Errors
    /// See [`Database::execute`].
    pub async fn execute_for(
        &self,
        key: ContextKey,
        statement: &Statement,
    ) -> Result<RowStream, SqlTableError> {
        let (connection, _) = self
            .inner
            .contexts
            .current(key)
            .ok_or(SqlTableError::NoActiveConnection)?;
        let rendered = statement.render(PlaceholderStyle::Postgres)?;
        let started = query_on_client(&connection, &rendered.sql, &rendered.params).await;
        let rows = self.inner.observe(key, started)?;
        let inner = Arc::clone(&self.inner);
        let rows: RowStream = Box::pin(
            row_stream(rows, connection).inspect_err(move |err| inner.note_failure(key, err)),
        );
        Ok(rows)
    }

    /// Run a mutating statement and return the number of affected rows.
    ///
    /// # Errors
    /// Returns `SqlTableError::NoActiveConnection` outside any scope and
    /// `SqlTableError::NoActiveTransaction` if the scope has no transaction.
    pub async fn execute_dml(&self, statement: &Statement) -> Result<u64, SqlTableError> {
        self.execute_dml_for(ContextKey::current(), statement).await
    }

    /// [`Database::execute_dml`] for an explicit context.
    ///
    /// # Errors
    /// See [`Database::execute_dml`].
    pub async fn execute_dml_for(
        &self,
        key: ContextKey,
        statement: &Statement,
    ) -> Result<u64, SqlTableError> {
        let connection = self.transactional_connection(key)?;
        let rendered = statement.render(PlaceholderStyle::Postgres)?;
        let result = execute_on_client(&connection, &rendered.sql, &rendered.params).await;
        self.inner.observe(key, result)
    }

    /// Run raw SQL text without parameters (DDL, admin statements) inside the
    /// calling context's transaction.
    ///
    /// # Errors
    /// Same scope requirements as [`Database::execute_dml`].
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SqlTableError> {
        let key = ContextKey::current();
        let connection = self.transactional_connection(key)?;
        trace!(sql, "batch");
        let result = connection.batch_execute(sql).await.map_err(SqlTableError::from);
        self.inner.observe(key, result)
    }

    fn transactional_connection(&self, key: ContextKey) -> Result<Arc<Pooled>, SqlTableError> {
        match self.inner.contexts.current(key) {
            None => Err(SqlTableError::NoActiveConnection),
            Some((_, false)) => Err(SqlTableError::NoActiveTransaction),
            Some((connection, true)) => Ok(connection),
        }
    }

    /// Number of scopes the calling context has open; 0 when idle.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.contexts.depth(ContextKey::current())
    }

    /// Number of scopes an explicit context has open.
    #[must_use]
    pub fn depth_for(&self, key: ContextKey) -> usize {
        self.inner.contexts.depth(key)
    }

    /// Whether the calling context has an open transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.inner
            .contexts
            .current(ContextKey::current())
            .is_some_and(|(_, in_transaction)| in_transaction)
    }

    /// Whether the calling context's transaction has become rollback-only:
    /// a statement in it failed on the server, or a scope exited out of
    /// order. Committing it rolls back and reports
    /// `SqlTableError::TransactionAborted`.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.inner.contexts.is_aborted(ContextKey::current())
    }

    /// Number of contexts currently holding a pooled connection.
    #[must_use]
    pub fn active_contexts(&self) -> usize {
        self.inner.contexts.active()
    }

    /// Pool occupancy as reported by bb8.
    #[must_use]
    pub fn pool_state(&self) -> bb8::State {
        self.inner.pool.state()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("pool", &self.inner.pool.state())
            .field("active_contexts", &self.inner.contexts.active())
            .field("acquire_timeout", &self.inner.acquire_timeout)
            .finish_non_exhaustive()
    }
}
