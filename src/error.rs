use std::time::Duration;

use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum SqlTableError {
    /// No codec and no structural rule applies to the field type.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// The pool could not hand out a connection within the configured wait.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// A statement was issued while the calling context holds no connection scope.
    #[error("No active connection in the current context")]
    NoActiveConnection,

    /// A mutating statement was issued in a connection scope with no open transaction.
    #[error("No active transaction in the current context")]
    NoActiveTransaction,

    #[error("Row already exists in {0}")]
    AlreadyExists(String),

    #[error("Row not found in {0}")]
    NotFound(String),

    /// Rolling back at the outermost scope failed. Carries the message of the
    /// error that triggered the rollback, if any.
    #[error("Rollback failed: {source} (while handling: {original})")]
    RollbackFailure {
        #[source]
        source: tokio_postgres::Error,
        original: String,
    },

    /// A commit was requested but the transaction could no longer commit,
    /// so it was rolled back. Carries the reason it became rollback-only.
    #[error("Transaction rolled back instead of committed: {0}")]
    TransactionAborted(String),

    /// A scope exited while scopes nested inside it were still open.
    #[error("Scope exited out of order: {0}")]
    ScopeOrder(String),

    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),
}

impl SqlTableError {
    /// Whether the caller may reasonably retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolTimeout(_) => true,
            Self::PostgresError(err) => err.code().is_some_and(|code| {
                *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
            }),
            _ => false,
        }
    }

    /// True when the database rejected a write because of a unique constraint.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::PostgresError(err) => err.code() == Some(&SqlState::UNIQUE_VIOLATION),
            _ => false,
        }
    }

    /// Whether the server saw this failure, which leaves any open transaction
    /// unable to commit.
    pub(crate) fn aborts_transaction(&self) -> bool {
        match self {
            Self::PostgresError(err) => err.as_db_error().is_some() || err.is_closed(),
            _ => false,
        }
    }
}
