//! Blocking mode.
//!
//! [`Client`] runs every operation on the calling thread. The protocol logic
//! is the same as the async [`Connection`], driven to completion with
//! [`block_on`]; over a [`BlockingTransport`] every poll completes
//! immediately, so no runtime is needed.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_executor::block_on;

use crate::{
    Result,
    connection::{
        Config, Connection, CopyOut, CopyStatement, Notification, NotificationQueue, PreparedStatement,
        TypeLookup,
    },
    pool::{self, PoolHandle},
    postgres::Oid,
    result::{QueryResult, StatementResult},
    transport::{BlockingTransport, PgTransport},
    types::{Param, PgComposite, PgEnum, TypeRegistry},
};

/// A [`Connection`] shared between threads.
///
/// Cloning is cheap, every clone talks to the same session. A mutex
/// serializes operations, a second thread that calls while another operation
/// is running blocks until it finished.
///
/// Notifications are only read while an operation runs or inside
/// [`poll_notification`][Client::poll_notification].
pub struct Client<T = BlockingTransport> {
    conn: Arc<Mutex<Connection<T>>>,
    notifications: NotificationQueue,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self { conn: self.conn.clone(), notifications: self.notifications.clone() }
    }
}

impl Client<BlockingTransport> {
    pub fn connect(config: Config) -> Result<Self> {
        block_on(Connection::connect(config)).map(Self::new)
    }

    /// Connect using [`Config::from_env`].
    pub fn connect_env() -> Result<Self> {
        block_on(Connection::connect_env()).map(Self::new)
    }

    pub fn connect_with(config: Config, registry: Arc<TypeRegistry>) -> Result<Self> {
        block_on(Connection::connect_with(config, registry)).map(Self::new)
    }
}

impl<T: PgTransport> Client<T> {
    pub fn new(conn: Connection<T>) -> Self {
        let notifications = conn.notifications().clone();
        Self { conn: Arc::new(Mutex::new(conn)), notifications }
    }

    /// Wait for exclusive access to the connection.
    pub fn lock(&self) -> MutexGuard<'_, Connection<T>> {
        // every operation leaves the stream at an exchange boundary or broken,
        // a poisoned connection is still consistent
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// See [`Connection::simple_query`].
    pub fn simple_query(&self, sql: &str) -> Result<StatementResult> {
        block_on(self.lock().simple_query(sql))
    }

    /// See [`Connection::execute`].
    pub fn execute(&self, sql: &str, params: &[Param<'_>]) -> Result<QueryResult> {
        block_on(self.lock().execute(sql, params))
    }

    /// See [`Connection::prepare`].
    pub fn prepare(&self, sql: &str, params_len: usize) -> Result<PreparedStatement> {
        block_on(self.lock().prepare(sql, params_len))
    }

    /// See [`Connection::pipeline`].
    pub fn pipeline(&self, statements: &[(&str, &[Param<'_>])], sync_all: bool) -> Result<StatementResult> {
        block_on(self.lock().pipeline(statements, sync_all))
    }

    /// See [`Connection::release_statement`].
    pub fn release_statement(&self, sql: &str) -> Result<bool> {
        block_on(self.lock().release_statement(sql))
    }

    /// See [`Connection::copy_in`].
    pub fn copy_in<I, B, E>(&self, copy: &CopyStatement, data: I) -> Result<QueryResult>
    where
        I: IntoIterator<Item = Result<B, E>>,
        I::IntoIter: Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        block_on(self.lock().copy_in(copy, data))
    }

    /// See [`Connection::copy_out`].
    ///
    /// The returned iterator holds the lock until it is dropped.
    pub fn copy_out(&self, copy: &CopyStatement) -> Result<CopyOutIter<'_, T>> {
        let mut conn = self.lock();
        block_on(conn.start_copy_out(copy))?;
        Ok(CopyOutIter { inner: CopyOut::new(conn) })
    }

    pub fn listen(&self, channel: &str) -> Result<()> {
        block_on(self.lock().listen(channel))
    }

    pub fn unlisten(&self, channel: &str) -> Result<()> {
        block_on(self.lock().unlisten(channel))
    }

    pub fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        block_on(self.lock().notify(channel, payload))
    }

    /// Take the next notification, reading from the socket for at most
    /// `timeout` when none is queued. `None` as timeout waits indefinitely.
    ///
    /// Holds the lock while reading.
    pub fn poll_notification(&self, timeout: Option<Duration>) -> Result<Option<Notification>> {
        if let Some(notification) = self.notifications.try_recv() {
            return Ok(Some(notification));
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut conn = self.lock();
        loop {
            // another thread may have read it while this one waited for the lock
            if let Some(notification) = self.notifications.try_recv() {
                return Ok(Some(notification));
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => return Ok(None),
                },
                None => None,
            };
            if !block_on(conn.wait_idle(remaining))? {
                return Ok(self.notifications.try_recv());
            }
        }
    }

    /// Take a queued notification without reading from the socket.
    pub fn try_notification(&self) -> Option<Notification> {
        self.notifications.try_recv()
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// See [`Connection::register_enum`].
    pub fn register_enum<E: PgEnum>(&self, lookup: impl Into<TypeLookup>) -> Result<Oid> {
        block_on(self.lock().register_enum::<E>(lookup))
    }

    /// See [`Connection::register_composite`].
    pub fn register_composite<C: PgComposite>(&self, lookup: impl Into<TypeLookup>) -> Result<Oid> {
        block_on(self.lock().register_composite::<C>(lookup))
    }

    /// Hand the connection to `pool`.
    ///
    /// Only the last clone can give the connection back, and only while it is
    /// open and idle.
    pub fn give_back<P: PoolHandle<T>>(self, pool: P) -> bool {
        let Ok(conn) = Arc::try_unwrap(self.conn) else {
            return false;
        };
        let conn = conn.into_inner().unwrap_or_else(|e| e.into_inner());
        pool::reusable(&conn) && pool.give_back(conn)
    }

    /// Close the session for every clone.
    pub fn close(&self) -> Result<()> {
        block_on(self.lock().terminate())
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

/// COPY OUT data as an [`Iterator`].
pub struct CopyOutIter<'a, T> {
    inner: CopyOut<MutexGuard<'a, Connection<T>>>,
}

impl<T: PgTransport> CopyOutIter<'_, T> {
    /// Rows copied, known once the iterator is exhausted.
    pub fn rows_affected(&self) -> Option<u64> {
        self.inner.rows_affected()
    }
}

impl<T: PgTransport> Iterator for CopyOutIter<'_, T> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        block_on(self.inner.chunk())
    }
}

impl<T> fmt::Debug for CopyOutIter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CopyOutIter").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{self, Event, Scripted};

    #[test]
    fn operations_do_not_interleave() {
        let transport = Scripted::new().delay(Duration::from_millis(20));
        let (conn, script, log) = testing::connect_with(transport, Config::default());
        script.complete("SELECT 1").ready(b'I').complete("SELECT 1").ready(b'I');
        let client = Client::new(conn);

        std::thread::scope(|s| {
            for sql in ["SELECT 1;", "SELECT 2;"] {
                let client = client.clone();
                s.spawn(move || client.simple_query(sql).unwrap());
            }
        });

        let order = log
            .events()
            .into_iter()
            .map(|event| match event {
                Event::Sent(ty, _) | Event::Recv(ty) => ty,
            })
            .collect::<Vec<_>>();
        assert_eq!(order, b"QCZQCZ");
    }

    #[test]
    fn poll_notification() {
        let (conn, script, _) = testing::connect(Config::default());
        let client = Client::new(conn);

        assert_eq!(client.poll_notification(Some(Duration::from_millis(5))).unwrap(), None);

        script.notification("test", "hello");
        let notification = client.poll_notification(Some(Duration::from_millis(5))).unwrap().unwrap();
        assert_eq!(notification.channel, "test");
        assert_eq!(notification.payload, "hello");
    }

    #[test]
    fn copy_out_iter() {
        let (conn, script, _) = testing::connect(Config::default());
        script
            .copy_out()
            .copy_data(b"a\n")
            .copy_data(b"b\n")
            .copy_done()
            .complete("COPY 2")
            .ready(b'I');
        let client = Client::new(conn);

        let mut out = client.copy_out(&CopyStatement::from_table("letters")).unwrap();
        let chunks = out.by_ref().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(chunks, [&b"a\n"[..], &b"b\n"[..]]);
        assert_eq!(out.rows_affected(), Some(2));
    }

    struct Shelf(Mutex<Vec<Connection<Scripted>>>);

    impl PoolHandle<Scripted> for Shelf {
        fn give_back(&self, conn: Connection<Scripted>) -> bool {
            self.0.lock().unwrap().push(conn);
            true
        }
    }

    #[test]
    fn give_back_last_clone() {
        let (conn, _, _) = testing::connect(Config::default());
        let client = Client::new(conn);
        let shelf = Shelf(Mutex::new(vec![]));

        let other = client.clone();
        assert!(!client.give_back(&shelf));
        assert!(other.give_back(&shelf));
        assert_eq!(shelf.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn connect_refused() {
        let err = Client::connect(testing::refused_config()).unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Io(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("connect to 127.0.0.1:"));
    }
}
