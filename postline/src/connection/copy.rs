//! COPY sub-protocol.
//!
//! COPY IN streams caller chunks as `CopyData`, batched in the transport
//! write buffer up to [`Config::copy_buffer_size`][super::Config]. COPY OUT
//! is a pull based [`Stream`] of `CopyData` payloads.
use bytes::Bytes;
use futures_core::Stream;
use std::{
    fmt,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll, ready},
};

use crate::{
    Error, Result,
    common::verbose,
    error::UsageError,
    postgres::{
        BackendMessage, DatabaseError, HEADER_LEN,
        backend::{CopyInResponse, CopyOutResponse},
        frontend,
    },
    result::{QueryResult, ResultBuilder},
    sql,
    transport::PgTransport,
};

use super::{Connection, single};

/// Whether data moves into or out of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// `COPY ... FROM STDIN`
    In,
    /// `COPY ... TO STDOUT`
    Out,
}

/// Data format of a COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyFormat {
    #[default]
    Text,
    Csv,
    Binary,
}

#[derive(Debug, Clone)]
enum CopyTarget {
    Table { name: String, columns: Vec<String> },
    Query(String),
}

/// A COPY statement.
///
/// ```
/// use postline::connection::{CopyFormat, CopyStatement};
///
/// let copy = CopyStatement::into_table("public.users")
///     .columns(["id", "name"])
///     .format(CopyFormat::Csv);
/// assert_eq!(
///     copy.to_sql(),
///     r#"COPY "public"."users" ("id", "name") FROM STDIN WITH (FORMAT csv)"#,
/// );
/// ```
#[derive(Debug, Clone)]
pub struct CopyStatement {
    direction: CopyDirection,
    format: CopyFormat,
    target: CopyTarget,
}

impl CopyStatement {
    /// `COPY table FROM STDIN`
    pub fn into_table(table: impl Into<String>) -> Self {
        Self {
            direction: CopyDirection::In,
            format: CopyFormat::Text,
            target: CopyTarget::Table { name: table.into(), columns: vec![] },
        }
    }

    /// `COPY table TO STDOUT`
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            direction: CopyDirection::Out,
            format: CopyFormat::Text,
            target: CopyTarget::Table { name: table.into(), columns: vec![] },
        }
    }

    /// `COPY (query) TO STDOUT`
    pub fn from_query(query: impl Into<String>) -> Self {
        Self {
            direction: CopyDirection::Out,
            format: CopyFormat::Text,
            target: CopyTarget::Query(query.into()),
        }
    }

    /// Restrict a table COPY to the given columns, ignored for a query.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let CopyTarget::Table { columns: cols, .. } = &mut self.target {
            cols.extend(columns.into_iter().map(Into::into));
        }
        self
    }

    pub fn format(mut self, format: CopyFormat) -> Self {
        self.format = format;
        self
    }

    pub fn direction(&self) -> CopyDirection {
        self.direction
    }

    pub fn to_sql(&self) -> String {
        let mut out = String::from("COPY ");
        match &self.target {
            CopyTarget::Table { name, columns } => {
                out.push_str(&sql::quote_qualified(name));
                if !columns.is_empty() {
                    let columns = columns.iter().map(|c| sql::quote_ident(c)).collect::<Vec<_>>();
                    out.push_str(" (");
                    out.push_str(&columns.join(", "));
                    out.push(')');
                }
            }
            CopyTarget::Query(query) => {
                out.push('(');
                out.push_str(query.trim().trim_end_matches(';'));
                out.push(')');
            }
        }
        out.push_str(match self.direction {
            CopyDirection::In => " FROM STDIN",
            CopyDirection::Out => " TO STDOUT",
        });
        match self.format {
            CopyFormat::Text => {}
            CopyFormat::Csv => out.push_str(" WITH (FORMAT csv)"),
            CopyFormat::Binary => out.push_str(" WITH (FORMAT binary)"),
        }
        out
    }
}

/// Chunks produced by an [`Iterator`], as a [`Stream`].
struct IterStream<I>(I);

impl<I: Iterator + Unpin> Stream for IterStream<I> {
    type Item = I::Item;

    fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().0.next())
    }
}

impl<T: PgTransport> Connection<T> {
    /// `COPY ... FROM STDIN` with the chunks of `data`.
    ///
    /// When `data` yields an error, `CopyFail` is sent instead of `CopyDone`,
    /// the server discards everything copied, and the returned result reports
    /// zero rows with the reason as its message. Server errors are returned
    /// as failures.
    pub async fn copy_in<I, B, E>(&mut self, copy: &CopyStatement, data: I) -> Result<QueryResult>
    where
        I: IntoIterator<Item = Result<B, E>>,
        I::IntoIter: Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        self.copy_in_stream(copy, IterStream(data.into_iter())).await
    }

    /// [`copy_in`][Connection::copy_in] from a [`Stream`] of chunks.
    pub async fn copy_in_stream<S, B, E>(&mut self, copy: &CopyStatement, data: S) -> Result<QueryResult>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        if copy.direction != CopyDirection::In {
            return Err(UsageError::CopyDirection.into());
        }
        self.begin().await?;
        let result = self.copy_in_inner(copy, data).await;
        self.finish(result).await
    }

    async fn copy_in_inner<S, B, E>(&mut self, copy: &CopyStatement, mut data: S) -> Result<QueryResult>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        self.stream.send(frontend::Query { sql: &copy.to_sql() });
        self.stream.flush().await?;
        self.stream.wait_for_or_error::<CopyInResponse>().await?;

        let capacity = self.config.copy_buffer_size;
        let mut aborted = None;
        while let Some(chunk) = std::future::poll_fn(|cx| Pin::new(&mut data).poll_next(cx)).await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    aborted = Some(err.to_string());
                    break;
                }
            };
            let chunk = chunk.as_ref();
            let buffered = self.stream.buffered();
            if buffered > 0 && buffered + HEADER_LEN + chunk.len() > capacity {
                self.stream.flush().await?;
            }
            self.stream.send(frontend::CopyData { data: chunk });
        }

        match &aborted {
            Some(reason) => {
                verbose!(%reason, "copy in aborted");
                self.stream.send(frontend::CopyFail { message: reason });
            }
            None => self.stream.send(frontend::CopyDone),
        }
        self.stream.flush().await?;

        let mut builder = ResultBuilder::new(self.registry.clone());
        self.collect(&mut builder).await?;

        let Some(reason) = aborted else {
            return builder.finish().map(single);
        };
        // the server answers CopyFail with query_canceled
        builder.take_error_if(DatabaseError::is_query_canceled);
        builder.finish()?;
        Ok(QueryResult::new(0, format!("COPY aborted by client: {reason}")))
    }

    /// `COPY ... TO STDOUT`, returns the stream of `CopyData` payloads.
    ///
    /// The connection is busy until the stream is exhausted. Dropping it
    /// early is allowed, the rest is discarded by the next operation.
    pub async fn copy_out(&mut self, copy: &CopyStatement) -> Result<CopyOut<&mut Self>> {
        self.start_copy_out(copy).await?;
        Ok(CopyOut::new(self))
    }

    /// Send the COPY and wait for `CopyOutResponse`.
    pub(crate) async fn start_copy_out(&mut self, copy: &CopyStatement) -> Result<()> {
        if copy.direction != CopyDirection::Out {
            return Err(UsageError::CopyDirection.into());
        }
        self.begin().await?;
        self.stream.send(frontend::Query { sql: &copy.to_sql() });
        let result = match self.stream.flush().await {
            Ok(()) => self.stream.wait_for_or_error::<CopyOutResponse>().await.map(|_| ()),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.finish(Err(err)).await,
        }
    }
}

/// Stream of COPY OUT data.
///
/// `C` is the connection, or a guard that derefs to it.
pub struct CopyOut<C> {
    conn: C,
    rows_affected: Option<u64>,
    error: Option<DatabaseError>,
    done: bool,
}

impl<C, T> CopyOut<C>
where
    C: DerefMut<Target = Connection<T>> + Unpin,
    T: PgTransport,
{
    pub(crate) fn new(conn: C) -> Self {
        Self { conn, rows_affected: None, error: None, done: false }
    }

    /// Rows copied, known once the stream is exhausted.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Poll the next chunk.
    pub fn poll_chunk(&mut self, cx: &mut Context) -> Poll<Option<Result<Bytes>>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            let msg = match ready!(self.conn.stream.poll_recv(cx)) {
                Ok(msg) => msg,
                Err(err) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
            };
            match msg {
                BackendMessage::CopyData(data) => return Poll::Ready(Some(Ok(data.data))),
                BackendMessage::CommandComplete(complete) => {
                    self.rows_affected = Some(complete.rows_affected());
                }
                // a failure is reported once the exchange reached `ReadyForQuery`
                BackendMessage::ErrorResponse(err) => self.error = Some(err.error),
                BackendMessage::ReadyForQuery(_) => {
                    self.done = true;
                    return Poll::Ready(self.error.take().map(|err| Err(Error::from(err))));
                }
                _ => {}
            }
        }
    }

    /// The next chunk, [`None`] once the COPY completed.
    pub async fn chunk(&mut self) -> Option<Result<Bytes>> {
        std::future::poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Return the connection, discarding data not yet read.
    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C, T> Stream for CopyOut<C>
where
    C: DerefMut<Target = Connection<T>> + Unpin,
    T: PgTransport,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_chunk(cx)
    }
}

impl<C> fmt::Debug for CopyOut<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOut")
            .field("rows_affected", &self.rows_affected)
            .field("done", &self.done)
            .finish()
    }
}
