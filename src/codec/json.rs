use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Number, Value as JsonValue};

use super::ScalarKind;
use crate::error::SqlTableError;
use crate::types::{FieldType, LiteralValue, Value};

/// Encode a value as a JSON document shaped by its field type.
pub(super) fn encode(field_type: &FieldType, value: &Value) -> Result<JsonValue, SqlTableError> {
    let encoded = match (field_type, value) {
        (_, Value::Null) => JsonValue::Null,
        (_, Value::Json(doc)) => doc.clone(),
        (FieldType::Text, Value::Text(s)) => JsonValue::String(s.clone()),
        (FieldType::Int, Value::Int(i)) => JsonValue::from(*i),
        (FieldType::Float, Value::Float(f)) => float(*f)?,
        (FieldType::Float, Value::Int(i)) => JsonValue::from(*i),
        (FieldType::Bool, Value::Bool(b)) => JsonValue::Bool(*b),
        (FieldType::Bytes | FieldType::Date | FieldType::DateTime | FieldType::Uuid, v) => {
            let kind = ScalarKind::of(field_type).ok_or_else(|| mismatch(field_type, v))?;
            JsonValue::String(kind.to_text(v)?)
        }
        (FieldType::List(inner) | FieldType::Set(inner), Value::List(items)) => JsonValue::Array(
            items
                .iter()
                .map(|item| encode(inner, item))
                .collect::<Result<_, _>>()?,
        ),
        (FieldType::Dict(inner), Value::Map(entries)) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), encode(inner, item)?)))
                .collect::<Result<Map<_, _>, SqlTableError>>()?,
        ),
        (FieldType::Record(fields), Value::Map(entries)) => {
            let mut object = Map::with_capacity(fields.len());
            for field in fields {
                let item = entries.get(&field.name).unwrap_or(&Value::Null);
                object.insert(field.name.clone(), encode(&field.field_type, item)?);
            }
            JsonValue::Object(object)
        }
        (FieldType::Literal(members), v) => {
            if !members.iter().any(|member| member.matches(v)) {
                return Err(SqlTableError::ParameterError(format!(
                    "{} is not a member of {field_type}",
                    v.kind()
                )));
            }
            untyped(v)?
        }
        (FieldType::Json, v) => untyped(v)?,
        (_, v) => return Err(mismatch(field_type, v)),
    };
    Ok(encoded)
}

/// Decode a JSON document back into a value of the given field type.
pub(super) fn decode(field_type: &FieldType, doc: JsonValue) -> Result<Value, SqlTableError> {
    let decoded = match (field_type, doc) {
        (FieldType::Json, doc) => Value::Json(doc),
        (_, JsonValue::Null) => Value::Null,
        (FieldType::Text, JsonValue::String(s)) => Value::Text(s),
        (FieldType::Int, JsonValue::Number(n)) => Value::Int(
            n.as_i64()
                .ok_or_else(|| SqlTableError::DecodeError(format!("{n} is not an integer")))?,
        ),
        (FieldType::Float, JsonValue::Number(n)) => Value::Float(
            n.as_f64()
                .ok_or_else(|| SqlTableError::DecodeError(format!("{n} is not a float")))?,
        ),
        (FieldType::Bool, JsonValue::Bool(b)) => Value::Bool(b),
        (
            FieldType::Bytes | FieldType::Date | FieldType::DateTime | FieldType::Uuid,
            JsonValue::String(s),
        ) => match ScalarKind::of(field_type) {
            Some(kind) => kind.from_text(&s)?,
            None => return Err(unexpected(field_type, &JsonValue::String(s))),
        },
        (FieldType::List(inner) | FieldType::Set(inner), JsonValue::Array(items)) => Value::List(
            items
                .into_iter()
                .map(|item| decode(inner, item))
                .collect::<Result<_, _>>()?,
        ),
        (FieldType::Dict(inner), JsonValue::Object(entries)) => Value::Map(
            entries
                .into_iter()
                .map(|(key, item)| Ok((key, decode(inner, item)?)))
                .collect::<Result<BTreeMap<_, _>, SqlTableError>>()?,
        ),
        (FieldType::Record(fields), JsonValue::Object(mut entries)) => {
            let mut values = BTreeMap::new();
            for field in fields {
                let item = entries.remove(&field.name).unwrap_or(JsonValue::Null);
                values.insert(field.name.clone(), decode(&field.field_type, item)?);
            }
            Value::Map(values)
        }
        (FieldType::Literal(members), doc) => {
            let value = match doc {
                JsonValue::String(s) => Value::Text(s),
                JsonValue::Bool(b) => Value::Bool(b),
                JsonValue::Number(n) if n.is_i64() => Value::Int(n.as_i64().unwrap_or_default()),
                other => return Err(unexpected(field_type, &other)),
            };
            if !members.iter().any(|member| member.matches(&value)) {
                return Err(SqlTableError::DecodeError(format!(
                    "{} is not a member of {field_type}",
                    literal_repr(&value)
                )));
            }
            value
        }
        (_, other) => return Err(unexpected(field_type, &other)),
    };
    Ok(decoded)
}

/// Field-type-free JSON rendering, used for `json` fields and literal members.
fn untyped(value: &Value) -> Result<JsonValue, SqlTableError> {
    let encoded = match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(f) => float(*f)?,
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Bytes(b) => JsonValue::String(BASE64.encode(b)),
        Value::Date(_) => JsonValue::String(ScalarKind::Date.to_text(value)?),
        Value::DateTime(_) => JsonValue::String(ScalarKind::DateTime.to_text(value)?),
        Value::Uuid(u) => JsonValue::String(u.hyphenated().to_string()),
        Value::List(items) => {
            JsonValue::Array(items.iter().map(untyped).collect::<Result<_, _>>()?)
        }
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), untyped(item)?)))
                .collect::<Result<Map<_, _>, SqlTableError>>()?,
        ),
        Value::Json(doc) => doc.clone(),
    };
    Ok(encoded)
}

fn float(f: f64) -> Result<JsonValue, SqlTableError> {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .ok_or_else(|| SqlTableError::ParameterError(format!("{f} cannot be stored as JSON")))
}

pub(super) fn literal_repr(value: &Value) -> String {
    match value {
        Value::Text(s) => format!("{s:?}"),
        Value::Int(i) => i.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.kind().to_string(),
    }
}

fn mismatch(field_type: &FieldType, value: &Value) -> SqlTableError {
    SqlTableError::ParameterError(format!("cannot encode {} as {field_type}", value.kind()))
}

fn unexpected(field_type: &FieldType, doc: &JsonValue) -> SqlTableError {
    SqlTableError::DecodeError(format!("unexpected JSON {doc} for {field_type}"))
}

impl LiteralValue {
    /// Native scalar that can hold every member of a homogeneous literal set.
    pub(super) fn common_scalar(members: &[LiteralValue]) -> Option<ScalarKind> {
        if members.iter().all(|m| matches!(m, LiteralValue::Str(_))) {
            Some(ScalarKind::Text)
        } else if members.iter().all(|m| matches!(m, LiteralValue::Int(_))) {
            Some(ScalarKind::Int)
        } else {
            None
        }
    }
}
