//! Typed CRUD over one PostgreSQL table.
//!
//! ```rust,no_run
//! use sql_table::{Database, PostgresConfig, SqlTableError, Statement, Table, record};
//! use futures_util::TryStreamExt;
//! use uuid::Uuid;
//!
//! record! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Item {
//!         pub key: Uuid,
//!         pub name: Option<String>,
//!         pub count: Option<i64>,
//!     }
//! }
//!
//! # async fn demo() -> Result<(), SqlTableError> {
//! let db = Database::connect(PostgresConfig::new("app", "app")).await?;
//! let items: Table<Item> = Table::new("items", &db, "key")?;
//!
//! let tx = db.transaction().await?;
//! let result = async {
//!     items.create().await?;
//!     let key = Uuid::new_v4();
//!     items.insert(&Item { key, name: Some("a".into()), count: Some(1) }).await?;
//!     let small: Vec<Item> = items
//!         .records(Some(&Statement::new().text("count < ").param(10_i64)))
//!         .await?
//!         .try_collect()
//!         .await?;
//!     Ok::<_, SqlTableError>(small.len())
//! }
//! .await;
//! tx.finish(result).await?;
//! # Ok(())
//! # }
//! ```

mod descriptor;

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt};
use tracing::debug;

use crate::codec::CodecRegistry;
use crate::database::Database;
use crate::error::SqlTableError;
use crate::postgres::SqlValue;
use crate::record::{Record, ValueMap};
use crate::results::RecordStream;
use crate::statement::Statement;
use crate::types::{FieldValue, Value};

pub use descriptor::{Column, TableDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Column subset, filter, ordering and paging for [`Table::select_with`].
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    columns: Option<Vec<String>>,
    filter: Option<Statement>,
    order_by: Vec<(String, Order)>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl SelectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only return these columns.
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Condition appended after `WHERE`.
    #[must_use]
    pub fn filter(mut self, filter: Statement) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// A table of `R` records keyed by one of its fields.
///
/// Every operation runs on the calling context's current scope; mutations
/// need an open transaction.
pub struct Table<R> {
    database: Database,
    descriptor: Arc<TableDescriptor>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Table<R> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            descriptor: Arc::clone(&self.descriptor),
            _record: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.descriptor.name())
            .field("primary_key", &self.descriptor.primary_key().name())
            .finish_non_exhaustive()
    }
}

impl<R: Record + 'static> Table<R> {
    /// Resolve codecs for every field with the database's registry.
    ///
    /// # Errors
    /// Returns `SqlTableError::UnsupportedType` if a field has no codec, or
    /// `SqlTableError::ConfigError` if `primary_key` is not a field of `R`.
    pub fn new(
        name: impl Into<String>,
        database: &Database,
        primary_key: &str,
    ) -> Result<Self, SqlTableError> {
        Self::with_registry(name, database, primary_key, database.registry())
    }

    /// Like [`Table::new`] with a table-specific codec registry.
    ///
    /// # Errors
    /// See [`Table::new`].
    pub fn with_registry(
        name: impl Into<String>,
        database: &Database,
        primary_key: &str,
        registry: &CodecRegistry,
    ) -> Result<Self, SqlTableError> {
        let descriptor = TableDescriptor::new(name, &R::schema(), primary_key, registry)?;
        debug!(
            table = descriptor.name(),
            columns = descriptor.columns().len(),
            "table descriptor built"
        );
        Ok(Self {
            database: database.clone(),
            descriptor: Arc::new(descriptor),
            _record: PhantomData,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    #[must_use]
    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// # Errors
    /// Returns `SqlTableError::AlreadyExists` if a row with the same key
    /// exists. Other constraint violations, such as a unique secondary index,
    /// surface as the driver error and leave the transaction rollback-only.
    pub async fn insert(&self, record: &R) -> Result<(), SqlTableError> {
        let values = record.to_values();
        let statement = self.descriptor.insert(&values);
        match self.database.execute_dml(&statement).await? {
            0 => Err(self.already_exists(&values)),
            _ => Ok(()),
        }
    }

    /// The record with this key, or `None`.
    ///
    /// # Errors
    /// Returns `SqlTableError::NoActiveConnection` outside a scope, or a
    /// decode error if the stored row does not fit `R`.
    pub async fn read<K: FieldValue>(&self, key: &K) -> Result<Option<R>, SqlTableError> {
        let statement = self.descriptor.read(key.to_value());
        let mut rows = self.database.execute(&statement).await?;
        match rows.try_next().await? {
            Some(row) => {
                let values = self.descriptor.decode_row(row)?;
                R::from_values(values).map(Some)
            }
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns `SqlTableError::NotFound` if no row has the record's key.
    pub async fn update(&self, record: &R) -> Result<(), SqlTableError> {
        let values = record.to_values();
        let statement = self.descriptor.update(&values);
        if self.database.execute_dml(&statement).await? == 0 {
            return Err(self.not_found(&self.key_of(&values)));
        }
        Ok(())
    }

    /// Insert, or overwrite every non-key column if the key exists.
    ///
    /// # Errors
    /// Scope and driver errors only.
    pub async fn upsert(&self, record: &R) -> Result<(), SqlTableError> {
        let statement = self.descriptor.upsert(&record.to_values());
        self.database.execute_dml(&statement).await?;
        Ok(())
    }

    /// # Errors
    /// Returns `SqlTableError::NotFound` if no row has this key.
    pub async fn delete<K: FieldValue>(&self, key: &K) -> Result<(), SqlTableError> {
        let key = key.to_value();
        let statement = self.descriptor.delete(key.clone());
        if self.database.execute_dml(&statement).await? == 0 {
            return Err(self.not_found(&key));
        }
        Ok(())
    }

    /// Stream rows as field values. `columns` limits the returned fields;
    /// `filter` is appended after `WHERE`.
    ///
    /// # Errors
    /// Returns `SqlTableError::ParameterError` for an unknown column.
    pub async fn select(
        &self,
        columns: Option<&[&str]>,
        filter: Option<&Statement>,
    ) -> Result<RecordStream<ValueMap>, SqlTableError> {
        let mut options = SelectOptions::new();
        if let Some(columns) = columns {
            options = options.columns(columns.iter().copied());
        }
        if let Some(filter) = filter {
            options = options.filter(filter.clone());
        }
        self.select_with(&options).await
    }

    /// [`Table::select`] with ordering and paging.
    ///
    /// # Errors
    /// Returns `SqlTableError::ParameterError` for an unknown column.
    pub async fn select_with(
        &self,
        options: &SelectOptions,
    ) -> Result<RecordStream<ValueMap>, SqlTableError> {
        let statement = self.descriptor.select(options)?;
        let rows = self.database.execute(&statement).await?;
        let descriptor = Arc::clone(&self.descriptor);
        Ok(Box::pin(rows.map(move |row| descriptor.decode_row(row?))))
    }

    /// Stream whole records matching `filter`.
    ///
    /// # Errors
    /// Scope and driver errors; per-row decode errors arrive in the stream.
    pub async fn records(
        &self,
        filter: Option<&Statement>,
    ) -> Result<RecordStream<R>, SqlTableError> {
        let values = self.select(None, filter).await?;
        Ok(Box::pin(
            values.map(|values| values.and_then(R::from_values)),
        ))
    }

    /// Number of rows matching `filter`.
    ///
    /// # Errors
    /// Scope and driver errors.
    pub async fn count(&self, filter: Option<&Statement>) -> Result<i64, SqlTableError> {
        let statement = self.descriptor.count(filter);
        let mut rows = self.database.execute(&statement).await?;
        let row = rows.try_next().await?.ok_or_else(|| {
            SqlTableError::ExecutionError("COUNT returned no row".to_string())
        })?;
        match row.get("count") {
            Some(SqlValue::Int(count)) => Ok(*count),
            other => Err(SqlTableError::DecodeError(format!(
                "unexpected COUNT result {other:?}"
            ))),
        }
    }

    /// Create the table from the record's field layout.
    ///
    /// # Errors
    /// Scope and driver errors.
    pub async fn create(&self) -> Result<(), SqlTableError> {
        self.ddl(self.descriptor.create().to_string()).await
    }

    /// # Errors
    /// Scope and driver errors.
    pub async fn drop(&self) -> Result<(), SqlTableError> {
        self.ddl(self.descriptor.drop_sql()).await
    }

    /// # Errors
    /// Returns `SqlTableError::ParameterError` for an unknown or missing column.
    pub async fn create_index(
        &self,
        name: &str,
        columns: &[&str],
        unique: bool,
    ) -> Result<(), SqlTableError> {
        let sql = self.descriptor.create_index(name, columns, unique)?;
        self.ddl(sql).await
    }

    async fn ddl(&self, sql: String) -> Result<(), SqlTableError> {
        debug!(table = self.descriptor.name(), %sql, "ddl");
        self.database.execute_dml(&Statement::from(sql)).await?;
        Ok(())
    }

    fn key_of(&self, values: &ValueMap) -> Value {
        values
            .get(self.descriptor.primary_key().name())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn already_exists(&self, values: &ValueMap) -> SqlTableError {
        SqlTableError::AlreadyExists(format!(
            "{} for key {}",
            self.descriptor.name(),
            describe(&self.key_of(values))
        ))
    }

    fn not_found(&self, key: &Value) -> SqlTableError {
        SqlTableError::NotFound(format!(
            "{} for key {}",
            self.descriptor.name(),
            describe(key)
        ))
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Text(s) => format!("{s:?}"),
        Value::Int(i) => i.to_string(),
        Value::Uuid(u) => u.to_string(),
        Value::Date(d) => d.to_string(),
        other => other.kind().to_string(),
    }
}
