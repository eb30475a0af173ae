//! Field codecs: how an abstract field type is stored in a PostgreSQL column
//! and bound as a statement parameter.
//!
//! - `registry`: resolution from `FieldType` to `Codec`, with caller overrides
//! - `json`: structural JSON encoding used by `JSONB` columns

mod json;
mod registry;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::SqlTableError;
use crate::postgres::SqlValue;
use crate::types::{FieldType, Value};

pub use registry::CodecRegistry;

/// Native scalar representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Text,
    Int,
    Float,
    Bool,
    Bytes,
    Date,
    DateTime,
    Uuid,
}

impl ScalarKind {
    /// Scalar kind of a field type, if it is a plain scalar.
    #[must_use]
    pub fn of(field_type: &FieldType) -> Option<Self> {
        match field_type {
            FieldType::Text => Some(Self::Text),
            FieldType::Int => Some(Self::Int),
            FieldType::Float => Some(Self::Float),
            FieldType::Bool => Some(Self::Bool),
            FieldType::Bytes => Some(Self::Bytes),
            FieldType::Date => Some(Self::Date),
            FieldType::DateTime => Some(Self::DateTime),
            FieldType::Uuid => Some(Self::Uuid),
            _ => None,
        }
    }

    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Int => "BIGINT",
            Self::Float => "DOUBLE PRECISION",
            Self::Bool => "BOOLEAN",
            Self::Bytes => "BYTEA",
            Self::Date => "DATE",
            Self::DateTime => "TIMESTAMP WITH TIME ZONE",
            Self::Uuid => "UUID",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Uuid => "uuid",
        }
    }

    /// Canonical string form of a scalar value.
    ///
    /// # Errors
    /// Returns `SqlTableError::ParameterError` if the value is not of this kind.
    pub fn to_text(self, value: &Value) -> Result<String, SqlTableError> {
        let text = match (self, value) {
            (Self::Text, Value::Text(s)) => s.clone(),
            (Self::Int, Value::Int(i)) => i.to_string(),
            (Self::Float, Value::Float(f)) => f.to_string(),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, Value::Int(i)) => (*i as f64).to_string(),
            (Self::Bool, Value::Bool(b)) => b.to_string(),
            (Self::Bytes, Value::Bytes(b)) => BASE64.encode(b),
            (Self::Date, Value::Date(d)) => d.format("%Y-%m-%d").to_string(),
            (Self::DateTime, Value::DateTime(dt)) => {
                dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            }
            (Self::Uuid, Value::Uuid(u)) => u.hyphenated().to_string(),
            (kind, other) => return Err(encode_mismatch(kind.name(), other)),
        };
        Ok(text)
    }

    /// Parse the canonical string form back into a value.
    ///
    /// # Errors
    /// Returns `SqlTableError::DecodeError` if the text does not parse.
    pub fn from_text(self, text: &str) -> Result<Value, SqlTableError> {
        let bad = |e: &dyn std::fmt::Display| {
            SqlTableError::DecodeError(format!("invalid {} text {text:?}: {e}", self.name()))
        };
        let value = match self {
            Self::Text => Value::Text(text.to_string()),
            Self::Int => Value::Int(text.parse().map_err(|e| bad(&e))?),
            Self::Float => Value::Float(text.parse().map_err(|e| bad(&e))?),
            Self::Bool => Value::Bool(text.parse().map_err(|e| bad(&e))?),
            Self::Bytes => Value::Bytes(BASE64.decode(text).map_err(|e| bad(&e))?),
            Self::Date => Value::Date(
                NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| bad(&e))?,
            ),
            Self::DateTime => Value::DateTime(
                DateTime::parse_from_rfc3339(text)
                    .map_err(|e| bad(&e))?
                    .with_timezone(&Utc),
            ),
            Self::Uuid => Value::Uuid(Uuid::parse_str(text).map_err(|e| bad(&e))?),
        };
        Ok(value)
    }

    fn encode(self, value: &Value) -> Result<SqlValue, SqlTableError> {
        let encoded = match (self, value) {
            (Self::Text, Value::Text(s)) => SqlValue::Text(s.clone()),
            (Self::Int, Value::Int(i)) => SqlValue::Int(*i),
            (Self::Float, Value::Float(f)) => SqlValue::Float(*f),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, Value::Int(i)) => SqlValue::Float(*i as f64),
            (Self::Bool, Value::Bool(b)) => SqlValue::Bool(*b),
            (Self::Bytes, Value::Bytes(b)) => SqlValue::Bytes(b.clone()),
            (Self::Date, Value::Date(d)) => SqlValue::Date(*d),
            (Self::DateTime, Value::DateTime(dt)) => SqlValue::Timestamp(*dt),
            (Self::Uuid, Value::Uuid(u)) => SqlValue::Uuid(*u),
            (kind, other) => return Err(encode_mismatch(kind.name(), other)),
        };
        Ok(encoded)
    }

    fn decode(self, value: SqlValue) -> Result<Value, SqlTableError> {
        let decoded = match (self, value) {
            (Self::Text, SqlValue::Text(s)) => Value::Text(s),
            (Self::Int, SqlValue::Int(i)) => Value::Int(i),
            (Self::Float, SqlValue::Float(f)) => Value::Float(f),
            (Self::Bool, SqlValue::Bool(b)) => Value::Bool(b),
            (Self::Bytes, SqlValue::Bytes(b)) => Value::Bytes(b),
            (Self::Date, SqlValue::Date(d)) => Value::Date(d),
            (Self::DateTime, SqlValue::Timestamp(dt)) => Value::DateTime(dt),
            (Self::Uuid, SqlValue::Uuid(u)) => Value::Uuid(u),
            (kind, other) => return Err(decode_mismatch(kind.name(), &other)),
        };
        Ok(decoded)
    }

    fn encode_array(self, items: &[Value]) -> Result<SqlValue, SqlTableError> {
        fn collect<T>(
            items: &[Value],
            kind: ScalarKind,
            pick: impl Fn(&Value) -> Option<T>,
        ) -> Result<Vec<T>, SqlTableError> {
            items
                .iter()
                .map(|item| pick(item).ok_or_else(|| encode_mismatch(kind.name(), item)))
                .collect()
        }

        let encoded = match self {
            Self::Text => SqlValue::TextArray(collect(items, self, |v| {
                v.as_text().map(str::to_string)
            })?),
            Self::Int => SqlValue::IntArray(collect(items, self, Value::as_int)?),
            Self::Float => SqlValue::FloatArray(collect(items, self, |v| match v {
                Value::Float(f) => Some(*f),
                #[allow(clippy::cast_precision_loss)]
                Value::Int(i) => Some(*i as f64),
                _ => None,
            })?),
            Self::Bool => SqlValue::BoolArray(collect(items, self, |v| match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            })?),
            Self::Bytes => SqlValue::BytesArray(collect(items, self, |v| match v {
                Value::Bytes(b) => Some(b.clone()),
                _ => None,
            })?),
            Self::Date => SqlValue::DateArray(collect(items, self, |v| match v {
                Value::Date(d) => Some(*d),
                _ => None,
            })?),
            Self::DateTime => SqlValue::TimestampArray(collect(items, self, |v| match v {
                Value::DateTime(dt) => Some(*dt),
                _ => None,
            })?),
            Self::Uuid => SqlValue::UuidArray(collect(items, self, Value::as_uuid)?),
        };
        Ok(encoded)
    }

    fn decode_array(self, value: SqlValue) -> Result<Value, SqlTableError> {
        let items: Vec<Value> = match (self, value) {
            (Self::Text, SqlValue::TextArray(v)) => v.into_iter().map(Value::Text).collect(),
            (Self::Int, SqlValue::IntArray(v)) => v.into_iter().map(Value::Int).collect(),
            (Self::Float, SqlValue::FloatArray(v)) => v.into_iter().map(Value::Float).collect(),
            (Self::Bool, SqlValue::BoolArray(v)) => v.into_iter().map(Value::Bool).collect(),
            (Self::Bytes, SqlValue::BytesArray(v)) => v.into_iter().map(Value::Bytes).collect(),
            (Self::Date, SqlValue::DateArray(v)) => v.into_iter().map(Value::Date).collect(),
            (Self::DateTime, SqlValue::TimestampArray(v)) => {
                v.into_iter().map(Value::DateTime).collect()
            }
            (Self::Uuid, SqlValue::UuidArray(v)) => v.into_iter().map(Value::Uuid).collect(),
            (kind, other) => return Err(decode_mismatch(&format!("{}[]", kind.name()), &other)),
        };
        Ok(Value::List(items))
    }
}

/// How a codec represents values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// Pass-through native scalar column.
    Native(ScalarKind),
    /// Native array of a scalar.
    Array(ScalarKind),
    /// `JSONB` document, structure driven by the field type.
    Json,
    /// Canonical string form stored in a `TEXT` column.
    Text(ScalarKind),
}

/// Encode/decode pair plus the native column type for one field type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    field_type: FieldType,
    sql_type: String,
    kind: CodecKind,
}

impl Codec {
    #[must_use]
    pub fn native(field_type: FieldType, scalar: ScalarKind) -> Self {
        Self {
            field_type,
            sql_type: scalar.sql_type().to_string(),
            kind: CodecKind::Native(scalar),
        }
    }

    #[must_use]
    pub fn array(field_type: FieldType, element: ScalarKind, element_sql_type: &str) -> Self {
        Self {
            field_type,
            sql_type: format!("{element_sql_type}[]"),
            kind: CodecKind::Array(element),
        }
    }

    #[must_use]
    pub fn json(field_type: FieldType) -> Self {
        Self {
            field_type,
            sql_type: "JSONB".to_string(),
            kind: CodecKind::Json,
        }
    }

    /// Store a scalar as its canonical string in a `TEXT` column.
    #[must_use]
    pub fn text(field_type: FieldType, scalar: ScalarKind) -> Self {
        Self {
            field_type,
            sql_type: "TEXT".to_string(),
            kind: CodecKind::Text(scalar),
        }
    }

    /// Replace the column type used in DDL, keeping the encoding.
    #[must_use]
    pub fn with_sql_type(mut self, sql_type: impl Into<String>) -> Self {
        self.sql_type = sql_type.into();
        self
    }

    #[must_use]
    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    #[must_use]
    pub fn sql_type(&self) -> &str {
        &self.sql_type
    }

    #[must_use]
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Encode an abstract value into its wire representation.
    ///
    /// # Errors
    /// Returns `SqlTableError::ParameterError` if the value does not fit the codec.
    pub fn encode(&self, value: &Value) -> Result<SqlValue, SqlTableError> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        if !self.admits(value) {
            return Err(SqlTableError::ParameterError(format!(
                "{} is not a member of {}",
                json::literal_repr(value),
                self.field_type
            )));
        }
        match self.kind {
            CodecKind::Native(scalar) => scalar.encode(value),
            CodecKind::Array(scalar) => match value {
                Value::List(items) => scalar.encode_array(items),
                other => Err(encode_mismatch("list", other)),
            },
            CodecKind::Json => json::encode(&self.field_type, value).map(SqlValue::Json),
            CodecKind::Text(scalar) => scalar.to_text(value).map(SqlValue::Text),
        }
    }

    /// Decode a wire value back into its abstract form.
    ///
    /// # Errors
    /// Returns `SqlTableError::DecodeError` if the wire value does not fit the codec.
    pub fn decode(&self, value: SqlValue) -> Result<Value, SqlTableError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let decoded = match self.kind {
            CodecKind::Native(scalar) => scalar.decode(value)?,
            CodecKind::Array(scalar) => scalar.decode_array(value)?,
            CodecKind::Json => match value {
                SqlValue::Json(doc) => json::decode(&self.field_type, doc)?,
                other => return Err(decode_mismatch("json", &other)),
            },
            CodecKind::Text(scalar) => match value {
                SqlValue::Text(text) => scalar.from_text(&text)?,
                other => return Err(decode_mismatch("text", &other)),
            },
        };
        if !self.admits(&decoded) {
            return Err(SqlTableError::DecodeError(format!(
                "{} is not a member of {}",
                json::literal_repr(&decoded),
                self.field_type
            )));
        }
        Ok(decoded)
    }

    /// Literal types accept only their members, whatever the column type.
    /// The JSON path checks membership itself.
    fn admits(&self, value: &Value) -> bool {
        match (&self.field_type, self.kind) {
            (FieldType::Literal(members), CodecKind::Native(_) | CodecKind::Text(_)) => {
                members.iter().any(|member| member.matches(value))
            }
            _ => true,
        }
    }
}

fn encode_mismatch(expected: &str, found: &Value) -> SqlTableError {
    SqlTableError::ParameterError(format!("cannot encode {} as {expected}", found.kind()))
}

fn decode_mismatch(expected: &str, found: &SqlValue) -> SqlTableError {
    SqlTableError::DecodeError(format!("cannot decode {} as {expected}", found.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LiteralValue;
    use std::collections::BTreeMap;

    fn registry() -> CodecRegistry {
        CodecRegistry::default()
    }

    fn round_trip(field_type: FieldType, value: Value) {
        let codec = registry().resolve(&field_type).unwrap();
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(encoded).unwrap(), value, "{field_type}");
    }

    #[test]
    fn scalar_round_trips_with_boundaries() {
        round_trip(FieldType::Text, Value::Text(String::new()));
        round_trip(FieldType::Text, Value::Text("string".into()));
        round_trip(FieldType::Int, Value::Int(0));
        round_trip(FieldType::Int, Value::Int(-1));
        round_trip(FieldType::Int, Value::Int(i64::MIN));
        round_trip(FieldType::Float, Value::Float(-2.5));
        round_trip(FieldType::Bool, Value::Bool(false));
        round_trip(FieldType::Bytes, Value::Bytes(Vec::new()));
        round_trip(FieldType::Bytes, Value::Bytes(b"12345".to_vec()));
        round_trip(
            FieldType::Date,
            Value::Date(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap()),
        );
        round_trip(
            FieldType::DateTime,
            Value::DateTime("2019-01-01T01:01:01Z".parse().unwrap()),
        );
        round_trip(FieldType::Uuid, Value::Uuid(Uuid::new_v4()));
    }

    #[test]
    fn null_round_trips_for_every_kind() {
        for field_type in [
            FieldType::Int,
            FieldType::List(Box::new(FieldType::Int)),
            FieldType::Json,
            FieldType::Dict(Box::new(FieldType::Int)),
        ] {
            round_trip(field_type, Value::Null);
        }
    }

    #[test]
    fn collections_round_trip() {
        round_trip(
            FieldType::List(Box::new(FieldType::Int)),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        );
        round_trip(FieldType::List(Box::new(FieldType::Int)), Value::List(vec![]));
        round_trip(
            FieldType::List(Box::new(FieldType::List(Box::new(FieldType::Int)))),
            Value::List(vec![Value::List(vec![Value::Int(1)]), Value::List(vec![])]),
        );
        round_trip(
            FieldType::Dict(Box::new(FieldType::Int)),
            Value::Map(BTreeMap::from([("a".to_string(), Value::Int(1))])),
        );
    }

    #[test]
    fn nested_record_round_trips_through_json() {
        let record = FieldType::Record(vec![
            crate::types::FieldDef::new("a", FieldType::Int, false),
            crate::types::FieldDef::new("when", FieldType::Date, true),
            crate::types::FieldDef::new("raw", FieldType::Bytes, false),
        ]);
        round_trip(
            record,
            Value::Map(BTreeMap::from([
                ("a".to_string(), Value::Int(2)),
                ("when".to_string(), Value::Null),
                ("raw".to_string(), Value::Bytes(vec![0, 255])),
            ])),
        );
    }

    #[test]
    fn literal_round_trips() {
        let mixed = FieldType::Literal(vec![
            LiteralValue::Str("a".into()),
            LiteralValue::Int(1),
            LiteralValue::Bool(true),
        ]);
        round_trip(mixed.clone(), Value::Int(1));
        round_trip(mixed.clone(), Value::Bool(true));
        round_trip(mixed, Value::Text("a".into()));
        round_trip(
            FieldType::Literal(vec![LiteralValue::Int(1), LiteralValue::Int(2)]),
            Value::Int(2),
        );
    }

    #[test]
    fn native_literal_columns_reject_non_members() {
        let letters = FieldType::Literal(vec![
            LiteralValue::Str("a".into()),
            LiteralValue::Str("b".into()),
        ]);
        let codec = registry().resolve(&letters).unwrap();
        assert_eq!(codec.sql_type(), "TEXT");
        let err = codec.encode(&Value::Text("z".into())).unwrap_err();
        assert!(matches!(err, SqlTableError::ParameterError(_)), "{err}");
        let err = codec.decode(SqlValue::Text("z".into())).unwrap_err();
        assert!(matches!(err, SqlTableError::DecodeError(_)), "{err}");
        assert_eq!(codec.encode(&Value::Null).unwrap(), SqlValue::Null);

        let numbers = FieldType::Literal(vec![LiteralValue::Int(1), LiteralValue::Int(2)]);
        let codec = registry().resolve(&numbers).unwrap();
        assert!(codec.encode(&Value::Int(3)).is_err());
        assert!(codec.decode(SqlValue::Int(7)).is_err());
        assert_eq!(codec.decode(SqlValue::Int(2)).unwrap(), Value::Int(2));

        // A text override keeps the membership check.
        let codec = Codec::text(numbers, ScalarKind::Int);
        assert!(codec.encode(&Value::Int(5)).is_err());
        assert_eq!(codec.encode(&Value::Int(1)).unwrap(), SqlValue::Text("1".into()));
    }

    #[test]
    fn text_codec_uses_canonical_strings() {
        let codec = Codec::text(FieldType::Uuid, ScalarKind::Uuid);
        let key: Uuid = "5ea2c35d-7f88-4fca-b76f-e4482f0b28a4".parse().unwrap();
        let encoded = codec.encode(&Value::Uuid(key)).unwrap();
        assert_eq!(
            encoded,
            SqlValue::Text("5ea2c35d-7f88-4fca-b76f-e4482f0b28a4".into())
        );
        assert_eq!(codec.decode(encoded).unwrap(), Value::Uuid(key));
        assert_eq!(codec.sql_type(), "TEXT");
    }

    #[test]
    fn float_codec_widens_ints() {
        let codec = registry().resolve(&FieldType::Float).unwrap();
        assert_eq!(codec.encode(&Value::Int(3)).unwrap(), SqlValue::Float(3.0));
    }

    #[test]
    fn encode_rejects_wrong_shape() {
        let codec = registry().resolve(&FieldType::Int).unwrap();
        let err = codec.encode(&Value::Text("1".into())).unwrap_err();
        assert!(matches!(err, SqlTableError::ParameterError(_)));

        let codec = registry()
            .resolve(&FieldType::List(Box::new(FieldType::Int)))
            .unwrap();
        assert!(codec.encode(&Value::List(vec![Value::Null])).is_err());
    }

    #[test]
    fn decode_rejects_wrong_wire_type() {
        let codec = registry().resolve(&FieldType::Uuid).unwrap();
        let err = codec.decode(SqlValue::Int(1)).unwrap_err();
        assert!(matches!(err, SqlTableError::DecodeError(_)));
    }
}
