//! Shared connection for the tokio runtime.
use std::{fmt, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    Result,
    connection::{
        Config, Connection, CopyOut, CopyStatement, Notification, NotificationQueue, PreparedStatement,
        TypeLookup,
    },
    pool::{self, PoolHandle},
    postgres::Oid,
    result::{QueryResult, StatementResult},
    transport::{PgTransport, TokioTransport},
    types::{Param, PgComposite, PgEnum, TypeRegistry},
};

/// A [`Connection`] shared between tasks.
///
/// Cloning is cheap, every clone talks to the same session. Operations are
/// serialized by an async mutex, a task that calls while another operation
/// is running waits without blocking its thread. Messages are read by the
/// transport's background task, so notifications arrive while nobody holds
/// the lock.
///
/// ```no_run
/// # async fn app() -> postline::Result<()> {
/// let client = postline::Client::connect_env().await?;
/// let rows = client.execute("SELECT $1::int4 + 1", &[&41i32]).await?;
/// let (answer,): (i32,) = rows.into_rows().remove(0).decode()?;
/// assert_eq!(answer, 42);
/// # Ok(())
/// # }
/// ```
pub struct Client<T = TokioTransport> {
    conn: Arc<Mutex<Connection<T>>>,
    notifications: NotificationQueue,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self { conn: self.conn.clone(), notifications: self.notifications.clone() }
    }
}

impl Client<TokioTransport> {
    pub async fn connect(config: Config) -> Result<Self> {
        Connection::connect(config).await.map(Self::new)
    }

    /// Connect using [`Config::from_env`].
    pub async fn connect_env() -> Result<Self> {
        Connection::connect_env().await.map(Self::new)
    }

    pub async fn connect_with(config: Config, registry: Arc<TypeRegistry>) -> Result<Self> {
        Connection::connect_with(config, registry).await.map(Self::new)
    }
}

impl<T: PgTransport> Client<T> {
    pub fn new(conn: Connection<T>) -> Self {
        let notifications = conn.notifications().clone();
        Self { conn: Arc::new(Mutex::new(conn)), notifications }
    }

    /// Wait for exclusive access to the connection.
    pub async fn lock(&self) -> OwnedMutexGuard<Connection<T>> {
        self.conn.clone().lock_owned().await
    }

    /// See [`Connection::simple_query`].
    pub async fn simple_query(&self, sql: &str) -> Result<StatementResult> {
        self.lock().await.simple_query(sql).await
    }

    /// See [`Connection::execute`].
    pub async fn execute(&self, sql: &str, params: &[Param<'_>]) -> Result<QueryResult> {
        self.lock().await.execute(sql, params).await
    }

    /// See [`Connection::prepare`].
    pub async fn prepare(&self, sql: &str, params_len: usize) -> Result<PreparedStatement> {
        self.lock().await.prepare(sql, params_len).await
    }

    /// See [`Connection::pipeline`].
    pub async fn pipeline(&self, statements: &[(&str, &[Param<'_>])], sync_all: bool) -> Result<StatementResult> {
        self.lock().await.pipeline(statements, sync_all).await
    }

    /// See [`Connection::release_statement`].
    pub async fn release_statement(&self, sql: &str) -> Result<bool> {
        self.lock().await.release_statement(sql).await
    }

    /// See [`Connection::copy_in`].
    pub async fn copy_in<I, B, E>(&self, copy: &CopyStatement, data: I) -> Result<QueryResult>
    where
        I: IntoIterator<Item = Result<B, E>>,
        I::IntoIter: Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        self.lock().await.copy_in(copy, data).await
    }

    /// See [`Connection::copy_in_stream`].
    pub async fn copy_in_stream<S, B, E>(&self, copy: &CopyStatement, data: S) -> Result<QueryResult>
    where
        S: futures_core::Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        self.lock().await.copy_in_stream(copy, data).await
    }

    /// See [`Connection::copy_out`].
    ///
    /// The returned stream holds the lock until it is dropped.
    pub async fn copy_out(&self, copy: &CopyStatement) -> Result<CopyOut<OwnedMutexGuard<Connection<T>>>> {
        let mut conn = self.lock().await;
        conn.start_copy_out(copy).await?;
        Ok(CopyOut::new(conn))
    }

    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.lock().await.listen(channel).await
    }

    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.lock().await.unlisten(channel).await
    }

    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.lock().await.notify(channel, payload).await
    }

    /// Wait for the next notification, without taking the lock.
    ///
    /// Returns `None` once the connection closed and the queue is drained.
    pub async fn recv_notification(&self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Take a queued notification without waiting.
    pub fn try_notification(&self) -> Option<Notification> {
        self.notifications.try_recv()
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// See [`Connection::register_enum`].
    pub async fn register_enum<E: PgEnum>(&self, lookup: impl Into<TypeLookup>) -> Result<Oid> {
        self.lock().await.register_enum::<E>(lookup).await
    }

    /// See [`Connection::register_composite`].
    pub async fn register_composite<C: PgComposite>(&self, lookup: impl Into<TypeLookup>) -> Result<Oid> {
        self.lock().await.register_composite::<C>(lookup).await
    }

    /// Hand the connection to `pool`.
    ///
    /// Only the last clone can give the connection back, and only while it is
    /// open and idle. Returns `false` when it was not given back, the
    /// connection is then dropped with this clone.
    pub fn give_back<P: PoolHandle<T>>(self, pool: P) -> bool {
        let Ok(conn) = Arc::try_unwrap(self.conn) else {
            return false;
        };
        let conn = conn.into_inner();
        pool::reusable(&conn) && pool.give_back(conn)
    }

    /// Close the session for every clone.
    pub async fn close(&self) -> Result<()> {
        self.lock().await.terminate().await
    }
}

impl<T> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("clones", &Arc::strong_count(&self.conn))
            .field("notifications", &self.notifications)
            .finish()
    }
}
