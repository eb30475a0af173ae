use std::collections::HashMap;

use tracing::debug;

use super::{Codec, CodecKind, ScalarKind};
use crate::error::SqlTableError;
use crate::types::{FieldType, LiteralValue};

/// Maps abstract field types to codecs.
///
/// Resolution order: caller overrides, built-in scalars, structural rules
/// (arrays, literals, JSON documents). A type with no applicable rule is
/// rejected with `SqlTableError::UnsupportedType`.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    overrides: HashMap<FieldType, Codec>,
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec that wins over the built-in rules for its field type.
    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.register(codec);
        self
    }

    pub fn register(&mut self, codec: Codec) {
        debug!(field_type = %codec.field_type(), sql_type = codec.sql_type(), "codec override registered");
        self.overrides.insert(codec.field_type().clone(), codec);
    }

    /// # Errors
    /// Returns `SqlTableError::UnsupportedType` when no rule covers the type.
    pub fn resolve(&self, field_type: &FieldType) -> Result<Codec, SqlTableError> {
        if let Some(codec) = self.overrides.get(field_type) {
            return Ok(codec.clone());
        }
        if let Some(scalar) = ScalarKind::of(field_type) {
            return Ok(Codec::native(field_type.clone(), scalar));
        }

        match field_type {
            FieldType::List(inner) | FieldType::Set(inner) => {
                let element = self.resolve(inner)?;
                match element.kind() {
                    CodecKind::Native(scalar) => Ok(Codec::array(
                        field_type.clone(),
                        scalar,
                        element.sql_type(),
                    )),
                    _ => Ok(Codec::json(field_type.clone())),
                }
            }
            FieldType::Literal(members) => {
                if members.is_empty() {
                    return Err(SqlTableError::UnsupportedType(format!(
                        "{field_type} has no members"
                    )));
                }
                Ok(match LiteralValue::common_scalar(members) {
                    Some(scalar) => Codec::native(field_type.clone(), scalar),
                    None => Codec::json(field_type.clone()),
                })
            }
            FieldType::Dict(inner) => {
                self.resolve(inner)?;
                Ok(Codec::json(field_type.clone()))
            }
            FieldType::Record(fields) => {
                for field in fields {
                    self.resolve(&field.field_type)?;
                }
                Ok(Codec::json(field_type.clone()))
            }
            FieldType::Json => Ok(Codec::json(FieldType::Json)),
            _ => Err(SqlTableError::UnsupportedType(field_type.to_string())),
        }
    }

    /// Native column type for a field type.
    ///
    /// # Errors
    /// Returns `SqlTableError::UnsupportedType` when no rule covers the type.
    pub fn sql_type(&self, field_type: &FieldType) -> Result<String, SqlTableError> {
        self.resolve(field_type).map(|codec| codec.sql_type().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldDef;

    fn sql_type(field_type: FieldType) -> String {
        CodecRegistry::default().sql_type(&field_type).unwrap()
    }

    #[test]
    fn scalar_column_types() {
        assert_eq!(sql_type(FieldType::Text), "TEXT");
        assert_eq!(sql_type(FieldType::Int), "BIGINT");
        assert_eq!(sql_type(FieldType::Float), "DOUBLE PRECISION");
        assert_eq!(sql_type(FieldType::Bool), "BOOLEAN");
        assert_eq!(sql_type(FieldType::Bytes), "BYTEA");
        assert_eq!(sql_type(FieldType::Date), "DATE");
        assert_eq!(sql_type(FieldType::DateTime), "TIMESTAMP WITH TIME ZONE");
        assert_eq!(sql_type(FieldType::Uuid), "UUID");
    }

    #[test]
    fn literal_column_types() {
        let strs = FieldType::Literal(vec![
            LiteralValue::Str("a".into()),
            LiteralValue::Str("b".into()),
            LiteralValue::Str("c".into()),
        ]);
        assert_eq!(sql_type(strs), "TEXT");

        let ints = FieldType::Literal(vec![
            LiteralValue::Int(1),
            LiteralValue::Int(2),
            LiteralValue::Int(3),
        ]);
        assert_eq!(sql_type(ints), "BIGINT");

        let mixed = FieldType::Literal(vec![
            LiteralValue::Str("a".into()),
            LiteralValue::Int(1),
            LiteralValue::Bool(true),
        ]);
        assert_eq!(sql_type(mixed), "JSONB");
    }

    #[test]
    fn empty_literal_is_unsupported() {
        let err = CodecRegistry::default()
            .resolve(&FieldType::Literal(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, SqlTableError::UnsupportedType(_)));
    }

    #[test]
    fn collection_column_types() {
        assert_eq!(sql_type(FieldType::List(Box::new(FieldType::Int))), "BIGINT[]");
        assert_eq!(sql_type(FieldType::Set(Box::new(FieldType::Text))), "TEXT[]");
        assert_eq!(
            sql_type(FieldType::List(Box::new(FieldType::List(Box::new(
                FieldType::Int
            ))))),
            "JSONB"
        );
        assert_eq!(sql_type(FieldType::Dict(Box::new(FieldType::Text))), "JSONB");
        assert_eq!(
            sql_type(FieldType::Record(vec![FieldDef::new("a", FieldType::Int, false)])),
            "JSONB"
        );
    }

    #[test]
    fn custom_types_need_an_override() {
        let email = FieldType::Custom("email".into());
        let err = CodecRegistry::default().resolve(&email).unwrap_err();
        assert!(matches!(err, SqlTableError::UnsupportedType(ref name) if name == "email"));
        let err = CodecRegistry::default()
            .resolve(&FieldType::List(Box::new(email.clone())))
            .unwrap_err();
        assert!(matches!(err, SqlTableError::UnsupportedType(_)));

        let registry = CodecRegistry::new()
            .with_codec(Codec::native(email.clone(), ScalarKind::Text).with_sql_type("VARCHAR(254)"));
        assert_eq!(registry.sql_type(&email).unwrap(), "VARCHAR(254)");
        assert_eq!(
            registry
                .sql_type(&FieldType::List(Box::new(email)))
                .unwrap(),
            "VARCHAR(254)[]"
        );
    }

    #[test]
    fn overrides_win_over_builtins() {
        let registry =
            CodecRegistry::new().with_codec(Codec::text(FieldType::Uuid, ScalarKind::Uuid));
        let codec = registry.resolve(&FieldType::Uuid).unwrap();
        assert_eq!(codec.kind(), CodecKind::Text(ScalarKind::Uuid));
        assert_eq!(codec.sql_type(), "TEXT");
    }
}
