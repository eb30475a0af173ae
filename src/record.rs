use std::collections::HashMap;

use crate::error::SqlTableError;
use crate::types::{FieldDef, FieldValue, Value};

/// Ordered field layout of a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<FieldDef>,
}

impl RecordSchema {
    #[must_use]
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

/// Field name to abstract value mapping for one (possibly partial) row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    values: HashMap<String, Value>,
}

impl ValueMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: HashMap::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove a field and convert it into its Rust type. A missing field is
    /// treated as absent (`Value::Null`), so optional fields may be omitted.
    ///
    /// # Errors
    /// Returns `SqlTableError::DecodeError` if the value does not fit `T`.
    pub fn take<T: FieldValue>(&mut self, name: &str) -> Result<T, SqlTableError> {
        let value = self.values.remove(name).unwrap_or(Value::Null);
        T::from_value(value)
            .map_err(|e| SqlTableError::DecodeError(format!("field `{name}`: {e}")))
    }

    /// Like [`ValueMap::get`] but converted; the map keeps its value.
    ///
    /// # Errors
    /// Returns `SqlTableError::DecodeError` if the value does not fit `T`.
    pub fn get_as<T: FieldValue>(&self, name: &str) -> Result<T, SqlTableError> {
        let value = self.values.get(name).cloned().unwrap_or(Value::Null);
        T::from_value(value)
            .map_err(|e| SqlTableError::DecodeError(format!("field `{name}`: {e}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, Value)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A record type that can be stored as one table row.
///
/// Usually derived with [`record!`](crate::record!).
pub trait Record: Sized {
    fn schema() -> RecordSchema;

    fn to_values(&self) -> ValueMap;

    /// # Errors
    /// Returns `SqlTableError::DecodeError` if a field is missing or malformed.
    fn from_values(values: ValueMap) -> Result<Self, SqlTableError>;
}

/// Declare a struct and implement [`Record`] for it. Every field type must
/// implement [`FieldValue`]; `Option<T>` fields are nullable columns.
///
/// ```rust
/// use sql_table::record;
/// use uuid::Uuid;
///
/// record! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Item {
///         pub key: Uuid,
///         pub name: Option<String>,
///         pub count: Option<i64>,
///     }
/// }
/// ```
#[macro_export]
macro_rules! record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )*
        }

        impl $crate::Record for $name {
            fn schema() -> $crate::RecordSchema {
                $crate::RecordSchema::new(vec![
                    $($crate::FieldDef::of::<$ty>(stringify!($field)),)*
                ])
            }

            fn to_values(&self) -> $crate::ValueMap {
                let mut values = $crate::ValueMap::new();
                $(
                    values.insert(
                        stringify!($field),
                        $crate::FieldValue::to_value(&self.$field),
                    );
                )*
                values
            }

            fn from_values(
                mut values: $crate::ValueMap,
            ) -> ::std::result::Result<Self, $crate::SqlTableError> {
                Ok(Self {
                    $($field: values.take::<$ty>(stringify!($field))?,)*
                })
            }
        }
    };
}
