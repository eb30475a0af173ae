//! Typed CRUD over PostgreSQL tables.
//!
//! Records declared with [`record!`] map onto table rows through a
//! [`CodecRegistry`]. Every query runs on the connection of the calling
//! context's scope, opened with [`Database::connection`] or
//! [`Database::transaction`]; nested scopes in the same context reuse it.

pub mod codec;
pub mod context;
pub mod database;
pub mod error;
pub mod postgres;
pub mod prelude;
pub mod record;
pub mod results;
pub mod statement;
pub mod table;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use codec::{Codec, CodecKind, CodecRegistry, ScalarKind};
pub use context::ContextKey;
pub use database::{Database, Scope};
pub use error::SqlTableError;
pub use postgres::{ConfigSource, PostgresConfig, SqlValue, SslMode};
pub use record::{Record, RecordSchema, ValueMap};
pub use results::{RecordStream, Row, RowStream};
pub use statement::{Param, PlaceholderStyle, RenderedStatement, Segment, Statement};
pub use table::{Column, Order, SelectOptions, Table, TableDescriptor};
pub use types::{FieldDef, FieldType, FieldValue, LiteralValue, Value};
