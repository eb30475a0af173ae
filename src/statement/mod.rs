//! Composable parameterized SQL.
//!
//! A [`Statement`] is an ordered list of literal text runs and typed
//! parameter slots. Placeholders are numbered only when the statement is
//! rendered, so appending one statement to another never needs fixing up:
//!
//! ```rust
//! use sql_table::{PlaceholderStyle, Statement};
//!
//! let stem = Statement::new().text("SELECT * FROM items WHERE count < ").param(10_i64);
//! let filter = Statement::new().text(" AND name = ").param("a".to_string());
//! let rendered = stem.concat(&filter).render(PlaceholderStyle::Postgres).unwrap();
//! assert_eq!(rendered.sql, "SELECT * FROM items WHERE count < $1 AND name = $2");
//! assert_eq!(rendered.params.len(), 2);
//! ```

mod placeholder;

use std::sync::Arc;

use crate::codec::{Codec, CodecRegistry};
use crate::error::SqlTableError;
use crate::postgres::SqlValue;
use crate::types::{FieldType, FieldValue, Value};

pub use placeholder::PlaceholderStyle;

/// One parameter slot: the abstract value and the codec that binds it.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    value: Value,
    codec: Arc<Codec>,
}

impl Param {
    #[must_use]
    pub fn new(value: Value, codec: Arc<Codec>) -> Self {
        Self { value, codec }
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.codec
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Param(Param),
}

/// Output of [`Statement::render`]: SQL text and the values to bind, in
/// placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    segments: Vec<Segment>,
}

impl Statement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal SQL text. Never put caller-supplied values here.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    /// Append a parameter, binding it with the default codec for `T`.
    #[must_use]
    pub fn param<T: FieldValue>(mut self, value: T) -> Self {
        let value = value.to_value();
        let codec = default_codec(&T::field_type(), &value);
        self.push_param(value, Arc::new(codec));
        self
    }

    /// Append a bare abstract value; its codec is inferred from the value.
    #[must_use]
    pub fn value(mut self, value: Value) -> Self {
        let codec = default_codec(&value.infer_type(), &value);
        self.push_param(value, Arc::new(codec));
        self
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        // Adjacent text runs are merged so segments alternate cleanly.
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(&text);
        } else {
            self.segments.push(Segment::Text(text));
        }
    }

    pub fn push_param(&mut self, value: Value, codec: Arc<Codec>) {
        self.segments.push(Segment::Param(Param::new(value, codec)));
    }

    /// A new statement with `other` appended after `self`.
    #[must_use]
    pub fn concat(&self, other: &Statement) -> Statement {
        let mut combined = self.clone();
        combined.extend(other.clone());
        combined
    }

    pub fn extend(&mut self, other: Statement) {
        for segment in other.segments {
            match segment {
                Segment::Text(text) => self.push_text(text),
                Segment::Param(param) => self.segments.push(Segment::Param(param)),
            }
        }
    }

    /// Join statements with a literal separator, e.g. `", "` or `" AND "`.
    #[must_use]
    pub fn join<I>(separator: &str, parts: I) -> Statement
    where
        I: IntoIterator<Item = Statement>,
    {
        let mut joined = Statement::new();
        for (idx, part) in parts.into_iter().enumerate() {
            if idx > 0 {
                joined.push_text(separator);
            }
            joined.extend(part);
        }
        joined
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Param(_)))
            .count()
    }

    /// Render to SQL text with one placeholder per parameter slot, and the
    /// encoded parameter values in the same order.
    ///
    /// # Errors
    /// Returns `SqlTableError::ParameterError` if a value does not fit its codec.
    pub fn render(&self, style: PlaceholderStyle) -> Result<RenderedStatement, SqlTableError> {
        let mut sql = String::new();
        let mut params = Vec::with_capacity(self.param_count());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Param(param) => {
                    params.push(param.codec.encode(&param.value)?);
                    style.write(&mut sql, params.len());
                }
            }
        }
        Ok(RenderedStatement { sql, params })
    }
}

impl From<&str> for Statement {
    fn from(text: &str) -> Self {
        Statement::new().text(text)
    }
}

impl From<String> for Statement {
    fn from(text: String) -> Self {
        Statement::new().text(text)
    }
}

/// Codec for an ad hoc parameter. Custom types have no default codec, so
/// those fall back to the shape of the value itself.
fn default_codec(field_type: &FieldType, value: &Value) -> Codec {
    let registry = CodecRegistry::default();
    registry
        .resolve(field_type)
        .or_else(|_| registry.resolve(&value.infer_type()))
        .unwrap_or_else(|_| Codec::json(FieldType::Json))
}
