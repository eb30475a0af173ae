use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::SqlTableError;

/// Abstract, schema-level value of a record field or statement parameter.
///
/// This is what records are decomposed into before a codec turns it into a
/// native wire value, and what comes back out of a codec on decode:
/// ```rust
/// use sql_table::Value;
///
/// let values = vec![
///     Value::Int(1),
///     Value::Text("alice".into()),
///     Value::List(vec![Value::Int(1), Value::Int(2)]),
/// ];
/// # let _ = values;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / SQL NULL
    Null,
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    /// Lists and sets. Sets carry no meaningful element order.
    List(Vec<Value>),
    /// Dicts and nested records.
    Map(BTreeMap<String, Value>),
    /// Untyped JSON document.
    Json(JsonValue),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Json(_) => "json",
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let Value::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        if let Value::Uuid(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    /// Best-effort field type for a bare value, used when a statement
    /// parameter is added without an explicit codec.
    #[must_use]
    pub fn infer_type(&self) -> FieldType {
        match self {
            Value::Null | Value::Text(_) => FieldType::Text,
            Value::Bool(_) => FieldType::Bool,
            Value::Int(_) => FieldType::Int,
            Value::Float(_) => FieldType::Float,
            Value::Bytes(_) => FieldType::Bytes,
            Value::Date(_) => FieldType::Date,
            Value::DateTime(_) => FieldType::DateTime,
            Value::Uuid(_) => FieldType::Uuid,
            Value::List(items) => {
                let inner = items
                    .iter()
                    .find(|item| !item.is_null())
                    .map_or(FieldType::Text, Value::infer_type);
                FieldType::List(Box::new(inner))
            }
            Value::Map(_) | Value::Json(_) => FieldType::Json,
        }
    }
}

impl From<LiteralValue> for Value {
    fn from(value: LiteralValue) -> Self {
        match value {
            LiteralValue::Str(s) => Value::Text(s),
            LiteralValue::Int(i) => Value::Int(i),
            LiteralValue::Bool(b) => Value::Bool(b),
        }
    }
}

/// One member of a literal (enumerated) type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiteralValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl LiteralValue {
    /// Whether the abstract value is this literal member.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (LiteralValue::Str(a), Value::Text(b)) => a == b,
            (LiteralValue::Int(a), Value::Int(b)) => a == b,
            (LiteralValue::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        }
    }
}

/// Structural shape of an abstract field type. Computed once per field and
/// used by the codec registry to pick a native representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Text,
    Int,
    Float,
    Bool,
    Bytes,
    Date,
    DateTime,
    Uuid,
    List(Box<FieldType>),
    Set(Box<FieldType>),
    Literal(Vec<LiteralValue>),
    /// String-keyed dictionary with homogeneous values.
    Dict(Box<FieldType>),
    /// Nested record with a fixed set of fields.
    Record(Vec<FieldDef>),
    /// Untyped JSON document.
    Json,
    /// A type from the schema layer with no built-in rule. Only usable with a
    /// registry override.
    Custom(String),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Text => f.write_str("str"),
            FieldType::Int => f.write_str("int"),
            FieldType::Float => f.write_str("float"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::Bytes => f.write_str("bytes"),
            FieldType::Date => f.write_str("date"),
            FieldType::DateTime => f.write_str("datetime"),
            FieldType::Uuid => f.write_str("uuid"),
            FieldType::List(inner) => write!(f, "list[{inner}]"),
            FieldType::Set(inner) => write!(f, "set[{inner}]"),
            FieldType::Literal(members) => {
                f.write_str("literal[")?;
                for (idx, member) in members.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    match member {
                        LiteralValue::Str(s) => write!(f, "{s:?}")?,
                        LiteralValue::Int(i) => write!(f, "{i}")?,
                        LiteralValue::Bool(b) => write!(f, "{b}")?,
                    }
                }
                f.write_str("]")
            }
            FieldType::Dict(inner) => write!(f, "dict[str, {inner}]"),
            FieldType::Record(fields) => write!(f, "record({} fields)", fields.len()),
            FieldType::Json => f.write_str("json"),
            FieldType::Custom(name) => f.write_str(name),
        }
    }
}

/// A named field of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }

    /// Field definition derived from a Rust type's `FieldValue` impl.
    pub fn of<T: FieldValue>(name: impl Into<String>) -> Self {
        Self::new(name, T::field_type(), T::nullable())
    }
}

/// Conversion between a Rust type and its abstract field type / value.
///
/// This is the boundary to the schema layer: anything implementing it can be
/// a record field, a primary key, or a statement parameter.
pub trait FieldValue: Sized {
    fn field_type() -> FieldType;

    /// Whether the field admits an absent value.
    fn nullable() -> bool {
        false
    }

    fn to_value(&self) -> Value;

    /// Build the Rust value back from its abstract form.
    ///
    /// # Errors
    /// Returns `SqlTableError::DecodeError` if the value has the wrong shape.
    fn from_value(value: Value) -> Result<Self, SqlTableError>;
}

pub(crate) fn mismatch(expected: &str, found: &Value) -> SqlTableError {
    SqlTableError::DecodeError(format!("expected {expected}, found {}", found.kind()))
}

macro_rules! impl_scalar_field {
    ($ty:ty, $field_type:expr, $variant:ident) => {
        impl FieldValue for $ty {
            fn field_type() -> FieldType {
                $field_type
            }

            fn to_value(&self) -> Value {
                Value::$variant(self.clone())
            }

            fn from_value(value: Value) -> Result<Self, SqlTableError> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(mismatch(stringify!($ty), &other)),
                }
            }
        }
    };
}

impl_scalar_field!(i64, FieldType::Int, Int);
impl_scalar_field!(bool, FieldType::Bool, Bool);
impl_scalar_field!(String, FieldType::Text, Text);
impl_scalar_field!(Vec<u8>, FieldType::Bytes, Bytes);
impl_scalar_field!(NaiveDate, FieldType::Date, Date);
impl_scalar_field!(DateTime<Utc>, FieldType::DateTime, DateTime);
impl_scalar_field!(Uuid, FieldType::Uuid, Uuid);
impl_scalar_field!(JsonValue, FieldType::Json, Json);

macro_rules! impl_narrow_int_field {
    ($ty:ty) => {
        impl FieldValue for $ty {
            fn field_type() -> FieldType {
                FieldType::Int
            }

            fn to_value(&self) -> Value {
                Value::Int(i64::from(*self))
            }

            fn from_value(value: Value) -> Result<Self, SqlTableError> {
                match value {
                    Value::Int(v) => <$ty>::try_from(v).map_err(|e| {
                        SqlTableError::DecodeError(format!(
                            "{v} out of range for {}: {e}",
                            stringify!($ty)
                        ))
                    }),
                    other => Err(mismatch(stringify!($ty), &other)),
                }
            }
        }
    };
}

impl_narrow_int_field!(i32);
impl_narrow_int_field!(i16);

impl FieldValue for f64 {
    fn field_type() -> FieldType {
        FieldType::Float
    }

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        match value {
            Value::Float(v) => Ok(v),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(v) => Ok(v as f64),
            other => Err(mismatch("f64", &other)),
        }
    }
}

impl FieldValue for f32 {
    fn field_type() -> FieldType {
        FieldType::Float
    }

    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        #[allow(clippy::cast_possible_truncation)]
        f64::from_value(value).map(|v| v as f32)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn field_type() -> FieldType {
        T::field_type()
    }

    fn nullable() -> bool {
        true
    }

    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, FieldValue::to_value)
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

fn list_items(value: Value) -> Result<Vec<Value>, SqlTableError> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(mismatch("list", &other)),
    }
}

impl<T: FieldValue> FieldValue for Vec<T> {
    fn field_type() -> FieldType {
        FieldType::List(Box::new(T::field_type()))
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(FieldValue::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        list_items(value)?.into_iter().map(T::from_value).collect()
    }
}

impl<T: FieldValue + Ord> FieldValue for BTreeSet<T> {
    fn field_type() -> FieldType {
        FieldType::Set(Box::new(T::field_type()))
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(FieldValue::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        list_items(value)?.into_iter().map(T::from_value).collect()
    }
}

impl<T: FieldValue + Eq + Hash> FieldValue for HashSet<T> {
    fn field_type() -> FieldType {
        FieldType::Set(Box::new(T::field_type()))
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(FieldValue::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        list_items(value)?.into_iter().map(T::from_value).collect()
    }
}

impl<T: FieldValue> FieldValue for BTreeMap<String, T> {
    fn field_type() -> FieldType {
        FieldType::Dict(Box::new(T::field_type()))
    }

    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(key, value)| (key.clone(), value.to_value()))
                .collect(),
        )
    }

    fn from_value(value: Value) -> Result<Self, SqlTableError> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(key, value)| T::from_value(value).map(|v| (key, v)))
                .collect(),
            other => Err(mismatch("map", &other)),
        }
    }
}
