mod row;

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};

use crate::error::SqlTableError;
use crate::postgres::extract_value;

pub use row::Row;
use row::Columns;

/// Lazy, single-pass sequence of decoded items.
pub type RecordStream<T> = Pin<Box<dyn Stream<Item = Result<T, SqlTableError>> + Send>>;

/// Rows of a query, as column names plus native values.
pub type RowStream = RecordStream<Row>;

/// Adapt a driver row stream. `hold` stays alive until the stream is
/// dropped, which keeps the pooled connection checked out while rows are
/// still being read.
pub(crate) fn row_stream<H>(rows: tokio_postgres::RowStream, hold: H) -> RowStream
where
    H: Send + 'static,
{
    let mut layout: Option<Arc<Columns>> = None;
    Box::pin(rows.map(move |row| {
        let _hold = &hold;
        let row = row?;
        let columns = layout
            .get_or_insert_with(|| {
                Arc::new(Columns::new(
                    row.columns()
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect(),
                ))
            })
            .clone();
        let values = (0..row.len())
            .map(|idx| extract_value(&row, idx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Row::with_columns(columns, values))
    }))
}
