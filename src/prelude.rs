//! Common imports for declaring records and working with tables.

pub use crate::record;
pub use crate::{
    ConfigSource, Database, FieldType, FieldValue, Order, PostgresConfig, Record, Row,
    SelectOptions, SqlTableError, Statement, Table, Value, ValueMap,
};
