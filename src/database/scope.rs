use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tracing::{debug, trace, warn};

use super::{Database, Pooled};
use crate::context::{ContextKey, Finalize, Release};
use crate::error::SqlTableError;

/// One entered connection or transaction scope.
///
/// Scopes of the same context nest: only the outermost one commits or rolls
/// back and hands the connection back to the pool. Exit explicitly with
/// [`commit`](Scope::commit), [`rollback`](Scope::rollback) or
/// [`finish`](Scope::finish). A scope dropped without exiting is treated as
/// failed: its depth is released at once and, if it was the outermost
/// transaction scope, the rollback runs on a spawned task.
///
/// Scopes must exit innermost first. Exiting a scope while scopes nested in
/// it are still open fails with `SqlTableError::ScopeOrder` and leaves the
/// transaction rollback-only; the last scope to exit then rolls it back.
#[must_use = "a scope rolls back when dropped without commit"]
pub struct Scope {
    database: Database,
    key: ContextKey,
    depth: usize,
    finished: bool,
}

impl Scope {
    pub(super) fn new(database: Database, key: ContextKey, depth: usize) -> Self {
        Self {
            database,
            key,
            depth,
            finished: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// Nesting depth this scope was entered at; 1 is the first scope of its
    /// context.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this is the first scope its context entered.
    #[must_use]
    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    /// Whether a statement in this scope's transaction failed on the server
    /// or a scope exited out of order. Such a transaction only rolls back.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.database.inner.contexts.is_aborted(self.key)
    }

    /// Leave the scope successfully. Commits if this is the last open
    /// transaction scope.
    ///
    /// # Errors
    /// Returns `SqlTableError::PostgresError` if `COMMIT` fails,
    /// `SqlTableError::TransactionAborted` if the transaction was
    /// rollback-only and got rolled back instead, and
    /// `SqlTableError::ScopeOrder` if inner scopes are still open.
    pub async fn commit(mut self) -> Result<(), SqlTableError> {
        self.exit(true, None).await
    }

    /// Leave the scope as failed. Rolls back if this is the last open
    /// transaction scope.
    ///
    /// # Errors
    /// Returns `SqlTableError::RollbackFailure` if `ROLLBACK` fails and
    /// `SqlTableError::ScopeOrder` if inner scopes are still open.
    pub async fn rollback(mut self) -> Result<(), SqlTableError> {
        self.exit(false, None).await
    }

    /// Leave the scope according to `result` and hand it back. A failed
    /// rollback replaces the original error.
    ///
    /// # Errors
    /// The original error, or the commit/rollback failure.
    pub async fn finish<T, E>(mut self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<SqlTableError> + fmt::Display,
    {
        match result {
            Ok(value) => {
                self.exit(true, None).await?;
                Ok(value)
            }
            Err(err) => match self.exit(false, Some(err.to_string())).await {
                Ok(()) => Err(err),
                Err(rollback) => Err(E::from(rollback)),
            },
        }
    }

    /// Leave without any transaction control, for a scope whose `BEGIN`
    /// never took effect.
    pub(super) fn discard(mut self) {
        self.finished = true;
        if let Release::Nested(open) = self.database.inner.contexts.release(self.key, self.depth) {
            trace!(context = %self.key, open, "discarded nested scope");
        }
    }

    async fn exit(&mut self, commit: bool, original: Option<String>) -> Result<(), SqlTableError> {
        self.finished = true;
        match self.database.inner.contexts.release(self.key, self.depth) {
            Release::Nested(open) => {
                trace!(context = %self.key, open, "left nested scope");
                Ok(())
            }
            Release::OutOfOrder { depth, open } => {
                warn!(context = %self.key, depth, open, "scope exited before its inner scopes");
                Err(SqlTableError::ScopeOrder(format!(
                    "scope at depth {depth} exited with {open} inner scope(s) open; \
                     any open transaction will roll back"
                )))
            }
            Release::Missing => Err(SqlTableError::NoActiveConnection),
            Release::Outermost(finalize) => {
                let key = self.key;
                // Runs detached so that cancelling the caller cannot leave a
                // half-finished transaction on a pooled connection.
                tokio::spawn(finalize_outermost(key, finalize, commit, original))
                    .await
                    .map_err(|e| SqlTableError::ExecutionError(format!("finalize task failed: {e}")))?
            }
        }
    }
}

async fn finalize_outermost(
    key: ContextKey,
    finalize: Finalize<Pooled>,
    commit: bool,
    original: Option<String>,
) -> Result<(), SqlTableError> {
    let Finalize {
        connection,
        in_transaction,
        aborted,
    } = finalize;
    if !in_transaction {
        trace!(context = %key, "connection returned");
        return Ok(());
    }
    if commit && aborted.is_none() {
        connection.batch_execute("COMMIT").await?;
        debug!(context = %key, "transaction committed");
        return Ok(());
    }
    let reason = match (commit, original, aborted) {
        (true, _, Some(aborted)) => aborted,
        (_, Some(original), _) => original,
        (_, None, Some(aborted)) => aborted,
        (_, None, None) => "explicit rollback".to_string(),
    };
    match connection.batch_execute("ROLLBACK").await {
        Ok(()) if commit => {
            debug!(context = %key, reason = %reason, "rollback-only transaction rolled back on commit");
            Err(SqlTableError::TransactionAborted(reason))
        }
        Ok(()) => {
            debug!(context = %key, "transaction rolled back");
            Ok(())
        }
        Err(source) => {
            warn!(context = %key, error = %source, "rollback failed");
            connection.mark_broken();
            Err(SqlTableError::RollbackFailure {
                source,
                original: reason,
            })
        }
    }
}

/// Upper bound on a rollback run without the caller's runtime.
const DETACHED_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_rollback(key: ContextKey, connection: Arc<Pooled>) {
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = connection.batch_execute("ROLLBACK").await {
                warn!(context = %key, error = %e, "rollback of abandoned transaction failed");
                connection.mark_broken();
            }
        });
        return;
    }
    // Dropped outside any runtime: roll back on a private one. A connection
    // whose rollback does not complete is discarded by the pool.
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(context = %key, error = %e, "no runtime to roll back abandoned transaction");
            connection.mark_broken();
            return;
        }
    };
    runtime.block_on(async move {
        match tokio::time::timeout(DETACHED_ROLLBACK_TIMEOUT, connection.batch_execute("ROLLBACK"))
            .await
        {
            Ok(Ok(())) => debug!(context = %key, "abandoned transaction rolled back"),
            Ok(Err(e)) => {
                warn!(context = %key, error = %e, "rollback of abandoned transaction failed");
                connection.mark_broken();
            }
            Err(_) => {
                warn!(context = %key, "rollback of abandoned transaction timed out");
                connection.mark_broken();
            }
        }
        // Returned to the pool while a runtime is current.
        drop(connection);
    });
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.database.inner.contexts.release(self.key, self.depth) {
            Release::Outermost(Finalize {
                connection,
                in_transaction: true,
                ..
            }) => {
                warn!(context = %self.key, "transaction scope dropped without exit; rolling back");
                spawn_rollback(self.key, connection);
            }
            Release::Nested(open) => {
                trace!(context = %self.key, open, "nested scope dropped");
            }
            Release::OutOfOrder { depth, open } => {
                warn!(context = %self.key, depth, open, "scope dropped before its inner scopes");
            }
            Release::Outermost(_) | Release::Missing => {}
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("key", &self.key)
            .field("depth", &self.depth)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
