//! Prepared statement cache.
//!
//! Statements are keyed by their sql text and named `s1`, `s2`, ... in
//! creation order. The cache never holds more than its capacity: before a new
//! statement is parsed, statements are evicted until there is room.
use lru::LruCache;
use std::{sync::Arc, time::Instant};

use crate::{
    Result,
    common::verbose,
    postgres::{
        BackendMessage, ColumnDescription, Oid, PgFormat,
        backend::CloseComplete,
        frontend,
    },
    sql,
    stream::{Flow, PgStream},
    error::UsageError,
    transport::PgTransport,
    types::TypeRegistry,
};

/// A statement parsed by the server.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    name: Arc<str>,
    sql: Arc<str>,
    param_types: Arc<[Oid]>,
    columns: Arc<[ColumnDescription]>,
}

impl PreparedStatement {
    /// Server side statement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter types as inferred by the server.
    pub fn param_types(&self) -> &[Oid] {
        &self.param_types
    }

    /// Result columns, empty for statements without rows.
    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    /// Result columns with the format requested on `Bind`, binary when a
    /// decoder is registered for the column type.
    pub(crate) fn result_columns(&self, registry: &TypeRegistry) -> (Vec<PgFormat>, Arc<[ColumnDescription]>) {
        let formats = self
            .columns
            .iter()
            .map(|column| match registry.has_decoder(column.type_oid) {
                true => PgFormat::Binary,
                false => PgFormat::Text,
            })
            .collect::<Vec<_>>();
        let columns = self
            .columns
            .iter()
            .zip(&formats)
            .map(|(column, &format)| ColumnDescription { format, ..column.clone() })
            .collect();
        (formats, columns)
    }
}

#[derive(Debug)]
struct Entry {
    statement: PreparedStatement,
    last_executed: Option<Instant>,
}

/// Bounded map from sql text to [`PreparedStatement`].
pub(crate) struct StatementCache {
    entries: LruCache<Arc<str>, Entry>,
    capacity: usize,
    next_id: u64,
    /// Statements of a pipeline being prepared, never evicted.
    pinned: Vec<Arc<str>>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: LruCache::unbounded(), capacity: capacity.max(1), next_id: 0, pinned: vec![] }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&mut self, sql: &str) -> Option<PreparedStatement> {
        self.entries.get(sql).map(|entry| entry.statement.clone())
    }

    pub fn mark_executed(&mut self, sql: &str) {
        if let Some(entry) = self.entries.peek_mut(sql) {
            entry.last_executed = Some(Instant::now());
        }
    }

    pub fn pin(&mut self, sql: &str) {
        self.pinned.push(sql.into());
    }

    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    fn next_name(&mut self) -> Arc<str> {
        self.next_id += 1;
        let mut name = String::from("s");
        name.push_str(itoa::Buffer::new().format(self.next_id));
        name.into()
    }

    fn insert(&mut self, statement: PreparedStatement) {
        self.entries
            .put(statement.sql.clone(), Entry { statement, last_executed: None });
    }

    pub fn remove(&mut self, sql: &str) -> Option<PreparedStatement> {
        self.entries.pop(sql).map(|entry| entry.statement)
    }

    /// The statement to evict next.
    ///
    /// A statement never executed goes first, the first one found walking from
    /// the least recently looked up end. Otherwise the one executed longest ago.
    fn victim(&self) -> Option<Arc<str>> {
        let mut oldest: Option<(&Arc<str>, Instant)> = None;
        for (sql, entry) in self.entries.iter().rev() {
            if self.pinned.contains(sql) {
                continue;
            }
            match (entry.last_executed, oldest) {
                (None, _) => return Some(sql.clone()),
                (Some(at), Some((_, old))) if at >= old => {}
                (Some(at), _) => oldest = Some((sql, at)),
            }
        }
        oldest.map(|(sql, _)| sql.clone())
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

/// Return the cached statement for `sql`, parsing it on a miss.
///
/// The parameter count is checked against the placeholders in `sql` before
/// anything is sent.
pub(crate) async fn prepare<T: PgTransport>(
    stream: &mut PgStream<T>,
    cache: &mut StatementCache,
    sql: &str,
    params_len: usize,
) -> Result<PreparedStatement> {
    check_params(sql, params_len)?;

    if let Some(statement) = cache.get(sql) {
        verbose!(name = %statement.name, "statement cache hit");
        return Ok(statement);
    }

    while cache.is_full() {
        if !evict(stream, cache).await? {
            return Err(UsageError::TooLarge("pipeline statements exceed the statement cache").into());
        }
    }

    let name = cache.next_name();
    stream.send(frontend::Parse { prepare_name: &name, sql, oids: &[] });
    stream.send(frontend::Describe { kind: b'S', name: &name });
    stream.send(frontend::Sync);
    stream.flush().await?;

    let mut param_types = vec![];
    let mut columns = vec![];
    let mut errors = vec![];
    stream
        .process_message_loop(|msg| {
            match msg {
                BackendMessage::ParseComplete(_) | BackendMessage::NoData(_) => {}
                BackendMessage::ParameterDescription(desc) => param_types = desc.oids,
                BackendMessage::RowDescription(desc) => columns = desc.columns,
                BackendMessage::ErrorResponse(err) => errors.push(err.error),
                BackendMessage::ReadyForQuery(_) => return Ok(Flow::Break),
                _ => return Ok(Flow::Skip),
            }
            Ok(Flow::Continue)
        })
        .await?;

    if let Some(err) = crate::Error::from_database_errors(errors) {
        return Err(err);
    }

    let statement = PreparedStatement {
        name,
        sql: sql.into(),
        param_types: param_types.into(),
        columns: columns.into(),
    };
    verbose!(name = %statement.name, "statement prepared");
    cache.insert(statement.clone());
    Ok(statement)
}

/// Reject a parameter list that does not match the placeholders of `sql`.
pub(crate) fn check_params(sql: &str, params_len: usize) -> Result<()> {
    let expected = sql::count_params(sql);
    if expected != params_len {
        return Err(UsageError::ParameterCount { expected, found: params_len }.into());
    }
    if params_len > u16::MAX as usize {
        return Err(UsageError::TooLarge("parameter count").into());
    }
    Ok(())
}

/// Close the statement chosen by [`StatementCache::victim`] on the server,
/// then forget it.
///
/// Returns `false` when every cached statement is pinned.
async fn evict<T: PgTransport>(stream: &mut PgStream<T>, cache: &mut StatementCache) -> Result<bool> {
    let Some(sql) = cache.victim() else {
        return Ok(false);
    };
    let Some(statement) = cache.entries.peek(&sql).map(|entry| entry.statement.clone()) else {
        return Ok(false);
    };
    close(stream, &statement).await?;
    cache.remove(&sql);
    verbose!(name = %statement.name, "statement evicted");
    Ok(true)
}

/// `Close` a statement and wait for `CloseComplete`.
pub(crate) async fn close<T: PgTransport>(stream: &mut PgStream<T>, statement: &PreparedStatement) -> Result<()> {
    stream.send(frontend::Close { variant: b'S', name: &statement.name });
    stream.send(frontend::Sync);
    stream.flush().await?;
    stream.wait_for_or_error::<CloseComplete>().await?;
    stream.ready().await
}

/// Execute messages for one statement: `Bind`, `Execute` and `Close` of the
/// unnamed portal, followed by `Sync` when `sync` is set.
///
/// Parameters are encoded into `params` beforehand by [`encode_params`].
pub(crate) fn send_execute<T: PgTransport>(
    stream: &mut PgStream<T>,
    statement: &PreparedStatement,
    params: &EncodedParams,
    result_formats: &[PgFormat],
    sync: bool,
) {
    stream.send(frontend::Bind {
        portal_name: "",
        stmt_name: &statement.name,
        param_formats: &params.formats,
        params_len: params.formats.len() as u16,
        params: &params.values,
        result_formats,
    });
    stream.send(frontend::Execute { portal_name: "", max_row: 0 });
    stream.send(frontend::Close { variant: b'P', name: "" });
    if sync {
        stream.send(frontend::Sync);
    }
}

/// Parameters encoded for `Bind`.
pub(crate) struct EncodedParams {
    formats: Vec<PgFormat>,
    values: Vec<u8>,
}

/// Encode `params` against the parameter types of `statement`.
pub(crate) fn encode_params(
    registry: &TypeRegistry,
    statement: &PreparedStatement,
    params: &[crate::types::Param<'_>],
) -> Result<EncodedParams> {
    let mut buf = bytes::BytesMut::new();
    let mut formats = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let target = statement.param_types.get(i).copied().unwrap_or(crate::postgres::pg_type::UNSPECIFIED);
        formats.push(registry.encode_param(*param, target, &mut buf)?);
    }
    Ok(EncodedParams { formats, values: buf.to_vec() })
}
