use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::Client;
use tracing::trace;
use uuid::Uuid;

use super::params::SqlValue;
use crate::error::SqlTableError;

/// Start a streaming query on a client.
///
/// # Errors
/// Returns `SqlTableError::PostgresError` if the statement fails to prepare or bind.
pub(crate) async fn query_on_client(
    client: &Client,
    sql: &str,
    params: &[SqlValue],
) -> Result<tokio_postgres::RowStream, SqlTableError> {
    trace!(sql, params = params.len(), "query");
    Ok(client.query_raw(sql, params.iter()).await?)
}

/// Execute a statement on a client and return the number of affected rows.
///
/// # Errors
/// Returns `SqlTableError::PostgresError` if execution fails.
pub(crate) async fn execute_on_client(
    client: &Client,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, SqlTableError> {
    trace!(sql, params = params.len(), "execute");
    Ok(client.execute_raw(sql, params.iter()).await?)
}

/// Extracts a `SqlValue` from a `tokio_postgres` Row at the given index.
///
/// # Errors
/// Returns `SqlTableError` if the column cannot be retrieved.
pub fn extract_value(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue, SqlTableError> {
    let type_info = row.columns()[idx].type_();

    let value = match type_info.name() {
        "int2" => {
            let val: Option<i16> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v)))
        }
        "int4" => {
            let val: Option<i32> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v)))
        }
        "int8" => {
            let val: Option<i64> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Int)
        }
        "float4" => {
            let val: Option<f32> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v)))
        }
        "float8" => {
            let val: Option<f64> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Float)
        }
        "bool" => {
            let val: Option<bool> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Bool)
        }
        "bytea" => {
            let val: Option<Vec<u8>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Bytes)
        }
        "date" => {
            let val: Option<NaiveDate> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Date)
        }
        "timestamp" => {
            let val: Option<NaiveDateTime> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, |v| SqlValue::Timestamp(v.and_utc()))
        }
        "timestamptz" => {
            let val: Option<DateTime<Utc>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Timestamp)
        }
        "uuid" => {
            let val: Option<Uuid> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Uuid)
        }
        "json" | "jsonb" => {
            let val: Option<JsonValue> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Json)
        }
        "_bool" => {
            let val: Option<Vec<bool>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::BoolArray)
        }
        "_int8" => {
            let val: Option<Vec<i64>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::IntArray)
        }
        "_float8" => {
            let val: Option<Vec<f64>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::FloatArray)
        }
        "_text" | "_varchar" => {
            let val: Option<Vec<String>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::TextArray)
        }
        "_bytea" => {
            let val: Option<Vec<Vec<u8>>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::BytesArray)
        }
        "_date" => {
            let val: Option<Vec<NaiveDate>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::DateArray)
        }
        "_timestamptz" => {
            let val: Option<Vec<DateTime<Utc>>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::TimestampArray)
        }
        "_uuid" => {
            let val: Option<Vec<Uuid>> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::UuidArray)
        }
        // text, varchar, bpchar, name and anything else readable as a string
        _ => {
            let val: Option<String> = row.try_get(idx)?;
            val.map_or(SqlValue::Null, SqlValue::Text)
        }
    };
    Ok(value)
}
