//! Result aggregation.
//!
//! [`ResultBuilder`] is fed every message of an exchange. `RowDescription`
//! resets the pending column set, `DataRow` accumulates, `CommandComplete`
//! emits one [`QueryResult`]. Server errors are collected rather than
//! returned, so the exchange is still read up to its `ReadyForQuery`.
use std::{mem, sync::Arc};

use crate::{
    Error, Result,
    postgres::{BackendMessage, ColumnDescription, DatabaseError, ProtocolError},
    row::{FromRow, Row},
    stream::Flow,
    types::{DecodeError, TypeRegistry},
};

/// Outcome of one statement.
#[derive(Debug, Default, Clone)]
pub struct QueryResult {
    /// Rows inserted, updated, deleted, selected or copied, zero for other commands.
    pub rows_affected: u64,
    /// The command tag, e.g. `INSERT 0 1`.
    pub message: String,
    columns: Arc<[ColumnDescription]>,
    rows: Vec<Row>,
}

impl QueryResult {
    pub(crate) fn new(rows_affected: u64, message: impl Into<String>) -> Self {
        Self { rows_affected, message: message.into(), columns: Arc::new([]), rows: vec![] }
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Decode every row using its [`FromRow`] implementation.
    pub fn decode<R: FromRow>(self) -> Result<Vec<R>, DecodeError> {
        self.rows.into_iter().map(R::from_row).collect()
    }
}

/// Results of every statement in a batch, in execution order.
#[derive(Debug, Default, Clone)]
pub struct StatementResult {
    results: Vec<QueryResult>,
}

impl StatementResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&QueryResult> {
        self.results.get(idx)
    }

    pub fn first(&self) -> Option<&QueryResult> {
        self.results.first()
    }

    pub fn last(&self) -> Option<&QueryResult> {
        self.results.last()
    }

    /// Sum of [`QueryResult::rows_affected`].
    pub fn rows_affected(&self) -> u64 {
        self.results.iter().map(|r| r.rows_affected).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueryResult> {
        self.results.iter()
    }
}

impl IntoIterator for StatementResult {
    type Item = QueryResult;

    type IntoIter = std::vec::IntoIter<QueryResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl From<Vec<QueryResult>> for StatementResult {
    fn from(results: Vec<QueryResult>) -> Self {
        Self { results }
    }
}

impl From<StatementResult> for Vec<QueryResult> {
    fn from(value: StatementResult) -> Self {
        value.results
    }
}

/// Collects the messages of one exchange into a [`StatementResult`].
pub(crate) struct ResultBuilder {
    registry: Arc<TypeRegistry>,
    columns: Arc<[ColumnDescription]>,
    rows: Vec<Row>,
    results: Vec<QueryResult>,
    errors: Vec<DatabaseError>,
    /// A statement ended since [`take_statement_done`][Self::take_statement_done].
    statement_done: bool,
    /// The server entered COPY IN mode, it must be answered before reading on.
    copy_in: bool,
}

impl ResultBuilder {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            columns: Arc::new([]),
            rows: vec![],
            results: vec![],
            errors: vec![],
            statement_done: false,
            copy_in: false,
        }
    }

    /// Columns of the next statement, extended query execution does not
    /// receive a `RowDescription`.
    pub fn set_columns(&mut self, columns: Arc<[ColumnDescription]>) {
        self.columns = columns;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_statement_done(&mut self) -> bool {
        mem::take(&mut self.statement_done)
    }

    pub fn take_copy_in(&mut self) -> bool {
        mem::take(&mut self.copy_in)
    }

    /// Remove the last collected error if `filter` matches it.
    pub fn take_error_if(&mut self, filter: impl FnOnce(&DatabaseError) -> bool) -> Option<DatabaseError> {
        match self.errors.last() {
            Some(last) if filter(last) => self.errors.pop(),
            _ => None,
        }
    }

    /// Message handler for [`process_message_loop`][crate::stream::PgStream::process_message_loop],
    /// breaks on `ReadyForQuery`.
    pub fn handle(&mut self, msg: BackendMessage) -> Result<Flow> {
        use BackendMessage::*;
        match msg {
            RowDescription(desc) => {
                self.columns = desc.columns.into();
                self.rows.clear();
            }
            DataRow(row) => {
                self.rows.push(Row::new(self.columns.clone(), row.values, self.registry.clone()));
            }
            CommandComplete(complete) => {
                self.results.push(QueryResult {
                    rows_affected: complete.rows_affected(),
                    message: complete.tag.into_string(),
                    columns: mem::replace(&mut self.columns, Arc::new([])),
                    rows: mem::take(&mut self.rows),
                });
                self.statement_done = true;
            }
            ErrorResponse(err) => {
                self.errors.push(err.error);
                self.columns = Arc::new([]);
                self.rows.clear();
                self.statement_done = true;
            }
            EmptyQueryResponse(_) => self.statement_done = true,
            ReadyForQuery(_) => return Ok(Flow::Break),
            CopyInResponse(_) => {
                self.copy_in = true;
                return Ok(Flow::Break);
            }
            ParseComplete(_) | BindComplete(_) | CloseComplete(_) | NoData(_)
            | ParameterDescription(_) | PortalSuspended(_) | CopyOutResponse(_) | CopyData(_)
            | CopyDone(_) => return Ok(Flow::Skip),
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "query").into());
            }
        }
        Ok(Flow::Continue)
    }

    /// Fold collected server errors into one failure, or return the results.
    pub fn finish(self) -> Result<StatementResult> {
        match Error::from_database_errors(self.errors) {
            Some(err) => Err(err),
            None => Ok(StatementResult { results: self.results }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::BackendProtocol;
    use bytes::Bytes;

    fn msg(msgtype: u8, body: &'static [u8]) -> BackendMessage {
        BackendMessage::decode(msgtype, Bytes::from_static(body)).unwrap()
    }

    #[test]
    fn multi_statement_batch() {
        let mut builder = ResultBuilder::new(Arc::new(TypeRegistry::new()));
        let row_desc = b"\0\x01n\0\0\0\0\0\0\0\0\0\0\x17\0\x04\xff\xff\xff\xff\0\0";
        for m in [
            msg(b'C', b"INSERT 0 2\0"),
            msg(b'T', row_desc),
            msg(b'D', b"\0\x01\0\0\0\x011"),
            msg(b'D', b"\0\x01\0\0\0\x012"),
            msg(b'C', b"SELECT 2\0"),
        ] {
            assert_eq!(builder.handle(m).unwrap(), Flow::Continue);
        }
        assert_eq!(builder.handle(msg(b'Z', b"I")).unwrap(), Flow::Break);

        let result = builder.finish().unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.rows_affected(), 4);
        assert_eq!(result.first().unwrap().message, "INSERT 0 2");
        let select = result.last().unwrap();
        assert_eq!(select.rows().len(), 2);
        assert_eq!(select.rows()[1].try_get::<_, i32>("n").unwrap(), 2);
    }

    #[test]
    fn columns_belong_to_their_statement() {
        let mut builder = ResultBuilder::new(Arc::new(TypeRegistry::new()));
        let row_desc = b"\0\x01n\0\0\0\0\0\0\0\0\0\0\x17\0\x04\xff\xff\xff\xff\0\0";
        for m in [
            msg(b'T', row_desc),
            msg(b'D', b"\0\x01\0\0\0\x011"),
            msg(b'C', b"SELECT 1\0"),
            msg(b'C', b"INSERT 0 1\0"),
        ] {
            assert_eq!(builder.handle(m).unwrap(), Flow::Continue);
        }
        assert_eq!(builder.handle(msg(b'Z', b"I")).unwrap(), Flow::Break);

        let result = builder.finish().unwrap();
        assert_eq!(result.first().unwrap().columns().len(), 1);
        let insert = result.last().unwrap();
        assert!(insert.columns().is_empty());
        assert!(insert.rows().is_empty());
        assert_eq!(insert.rows_affected, 1);
    }

    #[test]
    fn errors_are_collected() {
        let mut builder = ResultBuilder::new(Arc::new(TypeRegistry::new()));
        let error = b"SERROR\0C22012\0Mdivision by zero\0\0";
        assert_eq!(builder.handle(msg(b'E', error)).unwrap(), Flow::Continue);
        assert_eq!(builder.handle(msg(b'E', error)).unwrap(), Flow::Continue);
        assert!(builder.has_errors());
        assert_eq!(builder.handle(msg(b'Z', b"E")).unwrap(), Flow::Break);

        let err = builder.finish().unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Combined(errors) if errors.len() == 2));
        assert_eq!(err.code(), Some("22012"));
        assert!(!err.is_fatal());
    }
}
