#![cfg(feature = "test-utils")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{short_timeout, with_config, with_database};
use futures_util::TryStreamExt;
use sql_table::prelude::*;
use sql_table::{ContextKey, SqlValue};
use tokio::sync::Barrier;

record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Entry {
        pub id: i64,
        pub note: String,
    }
}

fn entry(id: i64) -> Entry {
    Entry {
        id,
        note: format!("entry {id}"),
    }
}

async fn entries(db: &Database, name: &str) -> Result<Table<Entry>, SqlTableError> {
    let table: Table<Entry> = Table::new(name, db, "id")?;
    let tx = db.transaction().await?;
    let created = table.create().await;
    tx.finish(created).await?;
    Ok(table)
}

async fn committed_count(db: &Database, table: &Table<Entry>) -> Result<i64, SqlTableError> {
    let scope = db.connection().await?;
    let count = table.count(None).await;
    scope.finish(count).await
}

async fn backend_pid(db: &Database) -> Result<i64, SqlTableError> {
    let rows: Vec<Row> = db
        .execute(&Statement::from("SELECT pg_backend_pid() AS pid"))
        .await?
        .try_collect()
        .await?;
    match rows.first().and_then(|row| row.get("pid")) {
        Some(SqlValue::Int(pid)) => Ok(*pid),
        other => Err(SqlTableError::DecodeError(format!("unexpected pid {other:?}"))),
    }
}

#[test]
fn nested_scopes_share_one_transaction() -> Result<(), Box<dyn std::error::Error>> {
    with_database("nested_db", 2, |db| async move {
        let table = entries(&db, "nested").await?;

        let outer = db.transaction().await?;
        assert!(outer.is_outermost());
        table.insert(&entry(1)).await?;

        let inner = db.transaction().await?;
        assert_eq!(inner.depth(), 2);
        assert_eq!(db.depth(), 2);
        assert_eq!(db.active_contexts(), 1);
        table.insert(&entry(2)).await?;
        inner.commit().await?;

        // The inner commit only left the scope.
        assert!(db.in_transaction());
        assert_eq!(db.depth(), 1);
        assert_eq!(table.count(None).await?, 2);

        outer.rollback().await?;
        assert_eq!(db.depth(), 0);
        assert!(!db.in_transaction());
        assert_eq!(committed_count(&db, &table).await?, 0);
        Ok(())
    })
}

#[test]
fn closure_error_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
    with_database("closure_db", 2, |db| async move {
        let table = entries(&db, "closure").await?;

        let result: Result<(), SqlTableError> = db
            .transaction_with(|_| {
                let table = table.clone();
                async move {
                    table.insert(&entry(1)).await?;
                    table.insert(&entry(1)).await
                }
            })
            .await;
        assert!(matches!(result, Err(SqlTableError::AlreadyExists(_))));
        assert_eq!(committed_count(&db, &table).await?, 0);

        db.transaction_with(|_| {
            let table = table.clone();
            async move { table.insert(&entry(1)).await }
        })
        .await?;
        assert_eq!(committed_count(&db, &table).await?, 1);
        Ok(())
    })
}

#[test]
fn connection_scope_then_nested_transaction_cannot_write() -> Result<(), Box<dyn std::error::Error>>
{
    with_database("conn_outer_db", 2, |db| async move {
        let table = entries(&db, "conn_outer").await?;

        let outer = db.connection().await?;
        let inner = db.transaction().await?;
        assert_eq!(inner.depth(), 2);
        assert!(!db.in_transaction());
        let err = table.insert(&entry(1)).await.unwrap_err();
        assert!(matches!(err, SqlTableError::NoActiveTransaction));
        inner.commit().await?;
        outer.commit().await
    })
}

#[test]
fn tasks_get_isolated_transactions() -> Result<(), Box<dyn std::error::Error>> {
    with_database("isolation_db", 4, |db| async move {
        let table = entries(&db, "isolation").await?;
        let barrier = Arc::new(Barrier::new(2));

        let spawn_writer = |id: i64, commit: bool| {
            let db = db.clone();
            let table = table.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let tx = db.transaction().await?;
                table.insert(&entry(id)).await?;
                // Each task sees only its own uncommitted row.
                assert_eq!(table.count(None).await?, 1);
                barrier.wait().await;
                assert_eq!(db.active_contexts(), 2);
                barrier.wait().await;
                if commit {
                    tx.commit().await
                } else {
                    tx.rollback().await
                }
            })
        };

        let committed = spawn_writer(1, true);
        let rolled_back = spawn_writer(2, false);
        committed
            .await
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))??;
        rolled_back
            .await
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))??;

        assert_eq!(db.active_contexts(), 0);
        let scope = db.connection().await?;
        assert_eq!(table.read(&1_i64).await?, Some(entry(1)));
        assert_eq!(table.read(&2_i64).await?, None);
        scope.commit().await
    })
}

#[test]
fn explicit_contexts_are_independent() -> Result<(), Box<dyn std::error::Error>> {
    with_database("explicit_db", 4, |db| async move {
        let first = ContextKey::unique();
        let second = ContextKey::unique();

        let a = db.connection_for(first).await?;
        let b = db.transaction_for(second).await?;
        assert_ne!(a.key(), b.key());
        assert_eq!(db.depth_for(first), 1);
        assert_eq!(db.depth_for(second), 1);
        assert_eq!(db.depth(), 0);
        assert_eq!(db.active_contexts(), 2);

        let err = db
            .execute_dml_for(first, &Statement::from("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SqlTableError::NoActiveTransaction));
        assert_eq!(
            db.execute_dml_for(second, &Statement::from("SELECT 1"))
                .await?,
            1
        );

        b.commit().await?;
        a.commit().await?;
        assert_eq!(db.active_contexts(), 0);
        Ok(())
    })
}

#[test]
fn dropped_scope_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
    with_database("dropped_db", 2, |db| async move {
        let table = entries(&db, "dropped").await?;

        let writer = {
            let db = db.clone();
            let table = table.clone();
            tokio::spawn(async move {
                let _tx = db.transaction().await?;
                table.insert(&entry(7)).await?;
                Ok::<_, SqlTableError>(())
            })
        };
        writer
            .await
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))??;

        assert_eq!(db.active_contexts(), 0);
        assert_eq!(committed_count(&db, &table).await?, 0);
        Ok(())
    })
}

#[test]
fn exhausted_pool_times_out() -> Result<(), Box<dyn std::error::Error>> {
    with_config("timeout_db", short_timeout, |db| async move {
        let holder = db.connection().await?;

        let other = db.clone();
        let waited = tokio::spawn(async move { other.connection().await.map(|_| ()) })
            .await
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))?;
        let err = waited.unwrap_err();
        assert!(matches!(err, SqlTableError::PoolTimeout(_)), "{err}");
        assert!(err.is_retryable());

        holder.commit().await?;

        // Released connections are handed out again.
        let next = tokio::spawn(async move {
            let scope = db.connection().await?;
            scope.commit().await
        });
        tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))?
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))?
    })
}

#[test]
fn outer_failure_discards_inner_work() -> Result<(), Box<dyn std::error::Error>> {
    with_database("three_levels_db", 2, |db| async move {
        let table = entries(&db, "three_levels").await?;

        let result: Result<(), SqlTableError> = db
            .transaction_with(|db| {
                let table = table.clone();
                async move {
                    db.transaction_with(|db| {
                        let table = table.clone();
                        async move {
                            db.transaction_with(|db| {
                                let table = table.clone();
                                async move {
                                    assert_eq!(db.depth(), 3);
                                    table.insert(&entry(1)).await
                                }
                            })
                            .await
                        }
                    })
                    .await?;
                    Err(SqlTableError::ExecutionError("outer step failed".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(SqlTableError::ExecutionError(_))));
        assert_eq!(db.depth(), 0);
        assert_eq!(committed_count(&db, &table).await?, 0);
        Ok(())
    })
}

#[test]
fn unique_index_violation_blocks_commit() -> Result<(), Box<dyn std::error::Error>> {
    with_database("unique_note_db", 2, |db| async move {
        let table = entries(&db, "unique_note").await?;
        let tx = db.transaction().await?;
        let indexed = table.create_index("unique_note_idx", &["note"], true).await;
        tx.finish(indexed).await?;

        let tx = db.transaction().await?;
        table
            .insert(&Entry {
                id: 1,
                note: "x".into(),
            })
            .await?;
        let err = table
            .insert(&Entry {
                id: 2,
                note: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_unique_violation(), "{err}");
        assert!(!matches!(err, SqlTableError::AlreadyExists(_)));
        assert!(tx.is_rollback_only());

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, SqlTableError::TransactionAborted(_)), "{err}");
        assert_eq!(db.active_contexts(), 0);
        assert_eq!(committed_count(&db, &table).await?, 0);
        Ok(())
    })
}

#[test]
fn failed_statements_turn_commit_into_rollback() -> Result<(), Box<dyn std::error::Error>> {
    with_database("failed_stmt_db", 2, |db| async move {
        let table = entries(&db, "failed_stmt").await?;

        let tx = db.transaction().await?;
        table.insert(&entry(1)).await?;
        assert!(db.execute_batch("UPDATE no_such_table SET x = 1").await.is_err());
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, SqlTableError::TransactionAborted(_)), "{err}");
        assert_eq!(committed_count(&db, &table).await?, 0);

        // The error may arrive with the first row rather than at query start.
        let tx = db.transaction().await?;
        table.insert(&entry(2)).await?;
        let division = Statement::from("SELECT 1 / (id - id) AS boom FROM failed_stmt");
        let rows: Result<Vec<Row>, SqlTableError> = match db.execute(&division).await {
            Ok(stream) => stream.try_collect().await,
            Err(e) => Err(e),
        };
        assert!(rows.is_err());
        assert!(db.is_rollback_only());
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, SqlTableError::TransactionAborted(_)), "{err}");
        assert_eq!(committed_count(&db, &table).await?, 0);

        // Without a transaction there is nothing to poison.
        let scope = db.connection().await?;
        assert!(db.execute(&Statement::from("SELECT * FROM no_such_table")).await.is_err());
        assert!(!db.is_rollback_only());
        scope.commit().await?;

        // Rolling back a poisoned transaction on purpose is not an error.
        let tx = db.transaction().await?;
        assert!(db.execute_batch("SELECT * FROM no_such_table").await.is_err());
        tx.rollback().await
    })
}

#[test]
fn outer_exit_before_inner_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
    with_database("out_of_order_db", 2, |db| async move {
        let table = entries(&db, "out_of_order").await?;

        let outer = db.transaction().await?;
        let inner = db.transaction().await?;
        table.insert(&entry(1)).await?;

        let err = outer.rollback().await.unwrap_err();
        assert!(matches!(err, SqlTableError::ScopeOrder(_)), "{err}");
        assert_eq!(db.depth(), 1);
        assert!(db.in_transaction());
        assert!(db.is_rollback_only());

        // The surviving scope cannot undo the outer decision.
        let err = inner.commit().await.unwrap_err();
        assert!(matches!(err, SqlTableError::TransactionAborted(_)), "{err}");
        assert_eq!(db.depth(), 0);
        assert_eq!(committed_count(&db, &table).await?, 0);

        // Committing the outer scope early is refused the same way.
        let outer = db.transaction().await?;
        let inner = db.transaction().await?;
        table.insert(&entry(2)).await?;
        let err = outer.commit().await.unwrap_err();
        assert!(matches!(err, SqlTableError::ScopeOrder(_)), "{err}");
        assert!(matches!(
            inner.commit().await,
            Err(SqlTableError::TransactionAborted(_))
        ));
        assert_eq!(committed_count(&db, &table).await?, 0);
        Ok(())
    })
}

#[test]
fn failed_rollback_keeps_the_original_error() -> Result<(), Box<dyn std::error::Error>> {
    with_database("rollback_failure_db", 2, |db| async move {
        let table = entries(&db, "rollback_failure").await?;

        let tx = db.transaction().await?;
        table.insert(&entry(1)).await?;
        let pid = backend_pid(&db).await?;

        let killer = {
            let db = db.clone();
            tokio::spawn(async move {
                let scope = db.connection().await?;
                let terminate = Statement::new()
                    .text("SELECT pg_terminate_backend(")
                    .param(pid)
                    .text(")");
                let result = match db.execute(&terminate).await {
                    Ok(rows) => rows.try_collect::<Vec<Row>>().await.map(|_| ()),
                    Err(e) => Err(e),
                };
                scope.finish(result).await
            })
        };
        killer
            .await
            .map_err(|e| SqlTableError::ExecutionError(e.to_string()))??;

        // Termination is asynchronous; wait until the session is gone.
        let mut gone = false;
        for _ in 0..50 {
            let alive = match db.execute(&Statement::from("SELECT 1")).await {
                Ok(rows) => rows.try_collect::<Vec<Row>>().await.is_ok(),
                Err(_) => false,
            };
            if !alive {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "backend {pid} was not terminated");

        let result: Result<(), SqlTableError> = tx
            .finish(Err(SqlTableError::ExecutionError("step failed".into())))
            .await;
        match result {
            Err(SqlTableError::RollbackFailure { original, .. }) => {
                assert!(original.contains("step failed"), "{original}");
            }
            other => panic!("expected a rollback failure, got {other:?}"),
        }
        assert_eq!(db.active_contexts(), 0);

        // The dead connection is not handed out again.
        assert_eq!(committed_count(&db, &table).await?, 0);
        Ok(())
    })
}

#[test]
fn scope_dropped_off_runtime_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
    with_database("off_runtime_db", 1, |db| async move {
        let table = entries(&db, "off_runtime").await?;

        let tx = db.transaction().await?;
        table.insert(&entry(1)).await?;
        std::thread::spawn(move || drop(tx))
            .join()
            .map_err(|_| SqlTableError::ExecutionError("drop thread panicked".into()))?;
        assert_eq!(db.active_contexts(), 0);

        // With a single pooled connection, a transaction left open on it
        // would show its own uncommitted row here.
        assert_eq!(committed_count(&db, &table).await?, 0);

        let tx = db.transaction().await?;
        table.insert(&entry(1)).await?;
        tx.commit().await?;
        assert_eq!(committed_count(&db, &table).await?, 1);
        Ok(())
    })
}
