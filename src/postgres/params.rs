use std::error::Error;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes;
use uuid::Uuid;

/// Native wire value bound to, or read from, a PostgreSQL statement.
///
/// Codecs produce these from abstract values; rows are read back into them
/// according to the column's server-side type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(JsonValue),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    TextArray(Vec<String>),
    BytesArray(Vec<Vec<u8>>),
    DateArray(Vec<NaiveDate>),
    TimestampArray(Vec<DateTime<Utc>>),
    UuidArray(Vec<Uuid>),
}

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
            Self::BoolArray(_) => "bool[]",
            Self::IntArray(_) => "int[]",
            Self::FloatArray(_) => "float[]",
            Self::TextArray(_) => "text[]",
            Self::BytesArray(_) => "bytes[]",
            Self::DateArray(_) => "date[]",
            Self::TimestampArray(_) => "timestamp[]",
            Self::UuidArray(_) => "uuid[]",
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql_checked(ty, out),
            // The server may infer a narrower integer type for a parameter.
            SqlValue::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                #[allow(clippy::cast_precision_loss)]
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                _ => i.to_sql_checked(ty, out),
            },
            SqlValue::Float(f) => match *ty {
                #[allow(clippy::cast_possible_truncation)]
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql_checked(ty, out),
            },
            SqlValue::Text(s) => s.to_sql_checked(ty, out),
            SqlValue::Bytes(b) => b.to_sql_checked(ty, out),
            SqlValue::Date(d) => d.to_sql_checked(ty, out),
            SqlValue::Timestamp(dt) => match *ty {
                Type::TIMESTAMP => dt.naive_utc().to_sql(ty, out),
                _ => dt.to_sql_checked(ty, out),
            },
            SqlValue::Uuid(u) => u.to_sql_checked(ty, out),
            SqlValue::Json(doc) => doc.to_sql_checked(ty, out),
            SqlValue::BoolArray(v) => v.to_sql_checked(ty, out),
            SqlValue::IntArray(v) => v.to_sql_checked(ty, out),
            SqlValue::FloatArray(v) => v.to_sql_checked(ty, out),
            SqlValue::TextArray(v) => v.to_sql_checked(ty, out),
            SqlValue::BytesArray(v) => v.to_sql_checked(ty, out),
            SqlValue::DateArray(v) => v.to_sql_checked(ty, out),
            SqlValue::TimestampArray(v) => v.to_sql_checked(ty, out),
            SqlValue::UuidArray(v) => v.to_sql_checked(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        // Per-variant checks happen in `to_sql` via `to_sql_checked`.
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::BOOL
                | Type::BYTEA
                | Type::DATE
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::UUID
                | Type::JSON
                | Type::JSONB
                | Type::BOOL_ARRAY
                | Type::INT8_ARRAY
                | Type::FLOAT8_ARRAY
                | Type::TEXT_ARRAY
                | Type::VARCHAR_ARRAY
                | Type::BYTEA_ARRAY
                | Type::DATE_ARRAY
                | Type::TIMESTAMPTZ_ARRAY
                | Type::UUID_ARRAY
        )
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &SqlValue, ty: &Type) -> Result<Vec<u8>, Box<dyn Error + Sync + Send>> {
        let mut out = bytes::BytesMut::new();
        value.to_sql_checked(ty, &mut out)?;
        Ok(out.to_vec())
    }

    #[test]
    fn ints_narrow_to_inferred_parameter_type() {
        assert_eq!(encode(&SqlValue::Int(7), &Type::INT4).unwrap(), 7i32.to_be_bytes());
        assert_eq!(encode(&SqlValue::Int(7), &Type::INT8).unwrap(), 7i64.to_be_bytes());
        assert!(encode(&SqlValue::Int(i64::MAX), &Type::INT2).is_err());
    }

    #[test]
    fn mismatched_variant_is_rejected_not_corrupted() {
        assert!(encode(&SqlValue::Text("x".into()), &Type::INT8).is_err());
        assert!(encode(&SqlValue::IntArray(vec![1]), &Type::TEXT_ARRAY).is_err());
    }

    #[test]
    fn null_writes_nothing() {
        let mut out = bytes::BytesMut::new();
        let is_null = SqlValue::Null.to_sql_checked(&Type::UUID, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
        assert!(out.is_empty());
    }

    #[test]
    fn unsupported_column_type_is_rejected() {
        assert!(!<SqlValue as ToSql>::accepts(&Type::INET));
    }
}
