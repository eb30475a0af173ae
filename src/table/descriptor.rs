use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{Codec, CodecRegistry};
use crate::error::SqlTableError;
use crate::record::{RecordSchema, ValueMap};
use crate::results::Row;
use crate::statement::Statement;
use crate::types::Value;

use super::{Order, SelectOptions};

/// Quote an identifier for PostgreSQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One column of a table, with the codec resolved for its field type.
#[derive(Debug, Clone)]
pub struct Column {
    name: String,
    quoted: String,
    codec: Arc<Codec>,
    nullable: bool,
}

impl Column {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    #[must_use]
    pub fn nullable(&self) -> bool {
        self.nullable
    }

    fn param(&self, statement: &mut Statement, value: Value) {
        statement.push_param(value, Arc::clone(&self.codec));
    }
}

/// Table name, columns and primary key, with the fixed parts of every
/// statement rendered once at construction.
#[derive(Debug)]
pub struct TableDescriptor {
    name: String,
    quoted: String,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    primary_key: usize,
    select_list: String,
    insert_head: String,
    insert_tail: String,
    upsert_tail: String,
    create_sql: String,
}

impl TableDescriptor {
    /// # Errors
    /// Returns `SqlTableError::UnsupportedType` if a field has no codec, or
    /// `SqlTableError::ConfigError` if `primary_key` is not a field.
    pub fn new(
        name: impl Into<String>,
        schema: &RecordSchema,
        primary_key: &str,
        registry: &CodecRegistry,
    ) -> Result<Self, SqlTableError> {
        let name = name.into();
        let columns = schema
            .fields()
            .iter()
            .map(|field| {
                Ok(Column {
                    name: field.name.clone(),
                    quoted: quote_ident(&field.name),
                    codec: Arc::new(registry.resolve(&field.field_type)?),
                    nullable: field.nullable,
                })
            })
            .collect::<Result<Vec<_>, SqlTableError>>()?;
        if columns.is_empty() {
            return Err(SqlTableError::ConfigError(format!(
                "table {name} has no fields"
            )));
        }
        let index: HashMap<String, usize> = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.name.clone(), idx))
            .collect();
        let primary_key = *index.get(primary_key).ok_or_else(|| {
            SqlTableError::ConfigError(format!(
                "primary key `{primary_key}` is not a field of {name}"
            ))
        })?;

        let quoted = quote_ident(&name);
        let select_list = join_quoted(columns.iter());
        let insert_head = format!("INSERT INTO {quoted} ({select_list}) VALUES (");
        let pk = &columns[primary_key].quoted;
        let non_key: Vec<&Column> = columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != primary_key)
            .map(|(_, column)| column)
            .collect();
        let insert_tail = format!(") ON CONFLICT ({pk}) DO NOTHING");
        let upsert_tail = if non_key.is_empty() {
            insert_tail.clone()
        } else {
            let assignments = non_key
                .iter()
                .map(|column| format!("{0} = EXCLUDED.{0}", column.quoted))
                .collect::<Vec<_>>()
                .join(", ");
            format!(") ON CONFLICT ({pk}) DO UPDATE SET {assignments}")
        };
        let definitions = columns
            .iter()
            .map(|column| {
                let not_null = if column.nullable { "" } else { " NOT NULL" };
                format!("{} {}{not_null}", column.quoted, column.codec.sql_type())
            })
            .collect::<Vec<_>>()
            .join(", ");
        let create_sql = format!("CREATE TABLE {quoted} ({definitions}, PRIMARY KEY ({pk}))");

        Ok(Self {
            name,
            quoted,
            columns,
            index,
            primary_key,
            select_list,
            insert_head,
            insert_tail,
            upsert_tail,
            create_sql,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&idx| &self.columns[idx])
    }

    #[must_use]
    pub fn primary_key(&self) -> &Column {
        &self.columns[self.primary_key]
    }

    fn known_column(&self, name: &str) -> Result<&Column, SqlTableError> {
        self.column(name).ok_or_else(|| {
            SqlTableError::ParameterError(format!("unknown column `{name}` in {}", self.name))
        })
    }

    fn values_statement(&self, head: &str, values: &ValueMap, tail: &str) -> Statement {
        let mut statement = Statement::from(head);
        for (idx, column) in self.columns.iter().enumerate() {
            if idx > 0 {
                statement.push_text(", ");
            }
            column.param(
                &mut statement,
                values.get(&column.name).cloned().unwrap_or(Value::Null),
            );
        }
        statement.push_text(tail);
        statement
    }

    fn key_filter(&self, statement: &mut Statement, key: Value) {
        let pk = self.primary_key();
        statement.push_text(format!(" WHERE {} = ", pk.quoted));
        pk.param(statement, key);
    }

    /// Insert that affects no row when the key already exists.
    pub(crate) fn insert(&self, values: &ValueMap) -> Statement {
        self.values_statement(&self.insert_head, values, &self.insert_tail)
    }

    pub(crate) fn upsert(&self, values: &ValueMap) -> Statement {
        self.values_statement(&self.insert_head, values, &self.upsert_tail)
    }

    pub(crate) fn read(&self, key: Value) -> Statement {
        let mut statement = Statement::from(format!(
            "SELECT {} FROM {}",
            self.select_list, self.quoted
        ));
        self.key_filter(&mut statement, key);
        statement
    }

    pub(crate) fn update(&self, values: &ValueMap) -> Statement {
        let pk = self.primary_key();
        let mut statement = Statement::from(format!("UPDATE {} SET ", self.quoted));
        let non_key = self
            .columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != self.primary_key)
            .map(|(_, column)| column);
        let mut first = true;
        for column in non_key {
            if !first {
                statement.push_text(", ");
            }
            first = false;
            statement.push_text(format!("{} = ", column.quoted));
            column.param(
                &mut statement,
                values.get(&column.name).cloned().unwrap_or(Value::Null),
            );
        }
        if first {
            // Key-only table: a no-op assignment still reports whether the row exists.
            statement.push_text(format!("{0} = {0}", pk.quoted));
        }
        let key = values.get(&pk.name).cloned().unwrap_or(Value::Null);
        self.key_filter(&mut statement, key);
        statement
    }

    pub(crate) fn delete(&self, key: Value) -> Statement {
        let mut statement = Statement::from(format!("DELETE FROM {}", self.quoted));
        self.key_filter(&mut statement, key);
        statement
    }

    pub(crate) fn select(&self, options: &SelectOptions) -> Result<Statement, SqlTableError> {
        let columns = match &options.columns {
            Some(names) => {
                let columns = names
                    .iter()
                    .map(|name| self.known_column(name))
                    .collect::<Result<Vec<_>, _>>()?;
                join_quoted(columns.into_iter())
            }
            None => self.select_list.clone(),
        };
        let mut statement = Statement::from(format!("SELECT {columns} FROM {}", self.quoted));
        Self::push_filter(&mut statement, options.filter.as_ref());
        if !options.order_by.is_empty() {
            let order = options
                .order_by
                .iter()
                .map(|(name, order)| {
                    let column = self.known_column(name)?;
                    let direction = match order {
                        Order::Asc => "ASC",
                        Order::Desc => "DESC",
                    };
                    Ok(format!("{} {direction}", column.quoted))
                })
                .collect::<Result<Vec<_>, SqlTableError>>()?
                .join(", ");
            statement.push_text(format!(" ORDER BY {order}"));
        }
        if let Some(limit) = options.limit {
            statement.push_text(" LIMIT ");
            statement = statement.param(limit);
        }
        if let Some(offset) = options.offset {
            statement.push_text(" OFFSET ");
            statement = statement.param(offset);
        }
        Ok(statement)
    }

    pub(crate) fn count(&self, filter: Option<&Statement>) -> Statement {
        let mut statement = Statement::from(format!("SELECT COUNT(*) AS count FROM {}", self.quoted));
        Self::push_filter(&mut statement, filter);
        statement
    }

    fn push_filter(statement: &mut Statement, filter: Option<&Statement>) {
        if let Some(filter) = filter.filter(|filter| !filter.is_empty()) {
            statement.push_text(" WHERE ");
            statement.extend(filter.clone());
        }
    }

    /// The `CREATE TABLE` statement for this layout.
    #[must_use]
    pub fn create(&self) -> &str {
        &self.create_sql
    }

    #[must_use]
    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE {}", self.quoted)
    }

    pub(crate) fn create_index(
        &self,
        name: &str,
        columns: &[&str],
        unique: bool,
    ) -> Result<String, SqlTableError> {
        if columns.is_empty() {
            return Err(SqlTableError::ParameterError(format!(
                "index {name} needs at least one column"
            )));
        }
        let columns = columns
            .iter()
            .map(|column| self.known_column(column))
            .collect::<Result<Vec<_>, _>>()?;
        let unique = if unique { "UNIQUE " } else { "" };
        Ok(format!(
            "CREATE {unique}INDEX {} ON {} ({})",
            quote_ident(name),
            self.quoted,
            join_quoted(columns.into_iter())
        ))
    }

    /// Decode a result row into field values by column name.
    pub(crate) fn decode_row(&self, row: Row) -> Result<ValueMap, SqlTableError> {
        let mut values = ValueMap::with_capacity(row.len());
        for (name, value) in row.into_pairs() {
            let column = self.column(&name).ok_or_else(|| {
                SqlTableError::DecodeError(format!("unexpected column `{name}` from {}", self.name))
            })?;
            let value = column.codec.decode(value)?;
            values.insert(name, value);
        }
        Ok(values)
    }
}

fn join_quoted<'a>(columns: impl Iterator<Item = &'a Column>) -> String {
    columns
        .map(|column| column.quoted.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
