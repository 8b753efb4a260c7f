//! Postgres connection.
//!
//! [`Connection`] runs every execution protocol over a [`PgStream`]. One
//! operation at a time owns the connection through `&mut self`; each operation
//! starts by draining whatever an earlier one left unread and ends at its
//! `ReadyForQuery`, so the stream is always at an exchange boundary between
//! operations.
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    Error, Result, auth,
    common::{log_warn, verbose},
    error::UsageError,
    postgres::{TransactionStatus, backend::BackendKeyData, frontend},
    result::{QueryResult, ResultBuilder, StatementResult},
    sql,
    stream::{Flow, PgStream},
    transport::{Connect, PgTransport, socket_path},
    types::{Param, TypeRegistry},
};

mod config;
mod copy;
mod notify;
mod pipeline;
mod register;
mod statement;

pub use config::{Config, ParseError};
pub use copy::{CopyDirection, CopyFormat, CopyOut, CopyStatement};
pub use notify::{Notification, NotificationQueue};
pub use register::TypeLookup;
pub use statement::PreparedStatement;

use statement::StatementCache;

/// A single session with the server.
///
/// `T` decides the execution mode, see [`transport`][crate::transport].
pub struct Connection<T> {
    stream: PgStream<T>,
    config: Arc<Config>,
    registry: Arc<TypeRegistry>,
    statements: StatementCache,
}

impl<T: Connect> Connection<T> {
    /// Connect with the built-in codecs.
    pub async fn connect(config: Config) -> Result<Self> {
        Self::connect_with(config, Arc::new(TypeRegistry::new())).await
    }

    /// Connect using [`Config::from_env`].
    pub async fn connect_env() -> Result<Self> {
        Self::connect(Config::from_env()).await
    }

    /// Connect with a shared codec registry.
    pub async fn connect_with(config: Config, registry: Arc<TypeRegistry>) -> Result<Self> {
        let notifications = NotificationQueue::new();
        let transport = match T::connect(&config, notifications.clone()).await {
            Ok(transport) => transport,
            Err(err) => {
                let target = match &config.socket {
                    Some(dir) => socket_path(dir, config.port),
                    None => format!("{}:{}", config.host, config.port),
                };
                return Err(Error::from(err).context(format!("connect to {target}")));
            }
        };
        Self::startup(transport, notifications, config, registry).await
    }
}

impl<T: PgTransport> Connection<T> {
    /// Run the startup handshake over an already open transport.
    pub async fn startup(
        transport: T,
        notifications: NotificationQueue,
        config: Config,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self> {
        let mut stream = PgStream::new(transport, notifications);
        auth::startup(&mut stream, &config).await?;
        Ok(Self {
            stream,
            statements: StatementCache::new(config.statement_cache_capacity),
            config: Arc::new(config),
            registry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Transaction status from the latest `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.stream.status()
    }

    /// Session parameter reported by the server, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.stream.parameter(name)
    }

    /// Process ID and secret key of this session.
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.stream.backend_key()
    }

    /// Notifications received on channels this session listens to.
    pub fn notifications(&self) -> &NotificationQueue {
        self.stream.notifications()
    }

    /// Returns `true` once the connection was closed or lost.
    pub fn is_closed(&self) -> bool {
        self.stream.is_broken()
    }

    /// Number of statements currently prepared on the server.
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    /// Drain leftovers of an earlier operation.
    async fn begin(&mut self) -> Result<()> {
        self.stream.ensure_open()?;
        self.stream.ready().await?;
        // an abandoned COPY OUT may end in a failed transaction
        self.auto_rollback().await;
        Ok(())
    }

    /// Bring the stream back to an exchange boundary after an operation.
    async fn finish<R>(&mut self, result: Result<R>) -> Result<R> {
        match &result {
            Err(err) if err.is_fatal() => {
                self.stream.abandon();
                return result;
            }
            _ if self.stream.is_broken() => return result,
            _ => {}
        }
        if let Err(err) = self.stream.ready().await {
            return match result {
                Err(original) => Err(original),
                Ok(_) => Err(err),
            };
        }
        self.auto_rollback().await;
        result
    }

    async fn auto_rollback(&mut self) {
        if !self.config.auto_rollback || self.stream.status() != TransactionStatus::Failed {
            return;
        }
        verbose!("transaction failed, rolling back");
        if let Err(err) = self.rollback().await {
            log_warn!("automatic rollback failed: {err}");
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut builder = ResultBuilder::new(self.registry.clone());
        self.stream.send(frontend::Query { sql: "ROLLBACK;" });
        self.stream.flush().await?;
        self.collect(&mut builder).await?;
        builder.finish().map(|_| ())
    }

    /// Read one exchange into `builder` up to its `ReadyForQuery`.
    async fn collect(&mut self, builder: &mut ResultBuilder) -> Result<()> {
        self.collect_until(builder, false).await
    }

    /// Read into `builder` up to `ReadyForQuery`, or up to the end of the
    /// current statement when `statement_end` is set.
    ///
    /// A COPY FROM STDIN reached outside of [`copy_in`][Connection::copy_in]
    /// is refused with `CopyFail`.
    async fn collect_until(&mut self, builder: &mut ResultBuilder, statement_end: bool) -> Result<()> {
        builder.take_statement_done();
        loop {
            self.stream
                .process_message_loop(|msg| match builder.handle(msg)? {
                    Flow::Continue if statement_end && builder.take_statement_done() => Ok(Flow::Break),
                    flow => Ok(flow),
                })
                .await?;
            if !builder.take_copy_in() {
                return Ok(());
            }
            self.stream.send(frontend::CopyFail { message: "COPY FROM STDIN requires copy_in" });
            self.stream.flush().await?;
        }
    }

    /// Run `sql` with the simple query protocol.
    ///
    /// `sql` may contain several statements, each producing one [`QueryResult`].
    /// Without a `;` and with [`Config::extended_simple_queries`] on, it runs
    /// through the extended protocol instead, which returns binary values.
    /// Server errors are collected until `ReadyForQuery` and returned as one
    /// failure.
    pub async fn simple_query(&mut self, sql: &str) -> Result<StatementResult> {
        if sql::is_blank(sql) {
            return Err(UsageError::BlankQuery.into());
        }
        if self.config.extended_simple_queries && !sql.contains(';') {
            let result = self.execute(sql, &[]).await?;
            return Ok(StatementResult::from(vec![result]));
        }
        self.begin().await?;
        let result = self.simple_query_inner(sql).await;
        self.finish(result).await
    }

    async fn simple_query_inner(&mut self, sql: &str) -> Result<StatementResult> {
        self.stream.send(frontend::Query { sql });
        self.stream.flush().await?;
        let mut builder = ResultBuilder::new(self.registry.clone());
        self.collect(&mut builder).await?;
        builder.finish()
    }

    /// Parse `sql` on the server, or return it from the statement cache.
    pub async fn prepare(&mut self, sql: &str, params_len: usize) -> Result<PreparedStatement> {
        statement::check_params(sql, params_len)?;
        self.begin().await?;
        let result = statement::prepare(&mut self.stream, &mut self.statements, sql, params_len).await;
        self.finish(result).await
    }

    /// Run one statement with the extended protocol.
    ///
    /// The statement is prepared and cached on first use. A parameter list
    /// that does not match the placeholders in `sql` is rejected before
    /// anything is sent.
    pub async fn execute(&mut self, sql: &str, params: &[Param<'_>]) -> Result<QueryResult> {
        statement::check_params(sql, params.len())?;
        self.begin().await?;
        let result = self.execute_inner(sql, params).await;
        self.finish(result).await
    }

    async fn execute_inner(&mut self, sql: &str, params: &[Param<'_>]) -> Result<QueryResult> {
        let statement = statement::prepare(&mut self.stream, &mut self.statements, sql, params.len()).await?;
        let encoded = statement::encode_params(&self.registry, &statement, params)?;
        let (formats, columns) = statement.result_columns(&self.registry);

        statement::send_execute(&mut self.stream, &statement, &encoded, &formats, true);
        self.stream.flush().await?;
        self.statements.mark_executed(sql);

        let mut builder = ResultBuilder::new(self.registry.clone());
        builder.set_columns(columns);
        self.collect(&mut builder).await?;
        builder.finish().map(single)
    }

    /// Close a cached statement on the server.
    ///
    /// Returns `false` if `sql` was not cached.
    pub async fn release_statement(&mut self, sql: &str) -> Result<bool> {
        self.begin().await?;
        let result = match self.statements.get(sql) {
            Some(prepared) => statement::close(&mut self.stream, &prepared).await.map(|_| true),
            None => Ok(false),
        };
        if let Ok(true) = result {
            self.statements.remove(sql);
        }
        self.finish(result).await
    }

    /// `LISTEN` on `channel`.
    pub async fn listen(&mut self, channel: &str) -> Result<()> {
        self.simple_query(&notify::listen_sql("LISTEN", channel)).await.map(|_| ())
    }

    /// `UNLISTEN` from `channel`.
    pub async fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.simple_query(&notify::listen_sql("UNLISTEN", channel)).await.map(|_| ())
    }

    /// `NOTIFY` `channel` with `payload`.
    pub async fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.simple_query(&notify::notify_sql(channel, payload)).await.map(|_| ())
    }

    /// Wait for a connection wide message while no operation runs.
    ///
    /// Used by transports that read on the calling thread to pick up
    /// notifications. Returns `false` on timeout.
    pub(crate) async fn wait_idle(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.begin().await?;
        self.stream.transport_mut().set_read_timeout(timeout)?;
        let result = self.stream.recv_idle().await;
        let reset = self.stream.transport_mut().set_read_timeout(None);
        let received = result?;
        reset?;
        Ok(received)
    }

    /// Send `Terminate` and close the socket.
    pub async fn close(mut self) -> Result<()> {
        self.terminate().await
    }

    /// [`close`][Connection::close] through a shared handle, later calls fail
    /// with [`UsageError::Closed`].
    pub(crate) async fn terminate(&mut self) -> Result<()> {
        self.stream.close().await
    }

    #[cfg(test)]
    pub(crate) fn stream(&self) -> &PgStream<T> {
        &self.stream
    }
}

impl<T: PgTransport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.stream.status())
            .field("closed", &self.stream.is_broken())
            .field("cached_statements", &self.statements.len())
            .finish()
    }
}

/// Fold an exchange into its single result.
fn single(result: StatementResult) -> QueryResult {
    result.into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        postgres::{PgFormat, pg_type},
        testing::{self, run},
    };

    #[test]
    fn parameter_mismatch_sends_nothing() {
        let (mut conn, _, log) = testing::connect(Config::default());

        let err = run(conn.execute("SELECT $1, $2", &[&1i32])).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Usage(UsageError::ParameterCount { expected: 2, found: 1 })
        ));
        let err = run(conn.pipeline(&[("SELECT 1", &[]), ("SELECT $1", &[])], true)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::ParameterCount { .. })));

        assert!(log.events().is_empty());
        assert!(!conn.is_closed());
    }

    #[test]
    fn blank_query() {
        let (mut conn, _, log) = testing::connect(Config::default());
        let err = run(conn.simple_query("  \n")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::BlankQuery)));
        assert!(log.events().is_empty());
    }

    #[test]
    fn session_state() {
        let (conn, _, _) = testing::connect(Config::default());
        assert_eq!(conn.parameter("server_version"), Some("17.0"));
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn simple_query_batch() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script
            .complete("INSERT 0 1")
            .columns(&[("n", pg_type::INT4)], PgFormat::Text)
            .row(&[Some(b"2")])
            .complete("SELECT 1")
            .ready(b'I');

        let result = run(conn.simple_query("INSERT INTO a VALUES (1); SELECT 2 AS n;")).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.rows_affected(), 2);
        assert_eq!(result.first().unwrap().rows_affected, 1);

        let select = result.last().unwrap();
        assert_eq!(select.message, "SELECT 1");
        assert_eq!(select.rows()[0].try_get::<_, i32>("n").unwrap(), 2);

        assert_eq!(log.sent(), b"Q");
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn server_errors_drain_to_ready() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script
            .complete("SELECT 0")
            .error("ERROR", "42P01", "relation \"missing\" does not exist")
            .ready(b'I');

        let err = run(conn.simple_query("SELECT 0; SELECT * FROM missing;")).unwrap_err();
        assert_eq!(err.code(), Some("42P01"));
        assert!(!err.is_fatal());
        assert!(!conn.is_closed());
        assert_eq!(script.remaining(), 0);

        script.complete("SELECT 0").ready(b'I');
        assert_eq!(run(conn.simple_query("SELECT 0;")).unwrap().len(), 1);
    }

    #[test]
    fn fatal_error_closes() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script.error("FATAL", "57P01", "terminating connection due to administrator command");

        let err = run(conn.simple_query("SELECT 1;")).unwrap_err();
        assert_eq!(err.code(), Some("57P01"));
        assert!(conn.is_closed());
        assert!(conn.notifications().is_closed());

        let err = run(conn.simple_query("SELECT 1;")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::Closed)));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script
            .complete("BEGIN")
            .error("ERROR", "22012", "division by zero")
            .ready(b'E')
            .complete("ROLLBACK")
            .ready(b'I');

        let err = run(conn.simple_query("BEGIN; SELECT 1/0;")).unwrap_err();
        assert_eq!(err.code(), Some("22012"));
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

        let frames = log.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], (b'Q', bytes::Bytes::from_static(b"ROLLBACK;\0")));
    }

    #[test]
    fn failed_rollback_is_not_raised() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script
            .error("ERROR", "22012", "division by zero")
            .ready(b'E')
            .error("ERROR", "XX000", "rollback failed")
            .ready(b'E');

        let err = run(conn.simple_query("SELECT 1/0;")).unwrap_err();
        assert_eq!(err.code(), Some("22012"));
        assert_eq!(conn.transaction_status(), TransactionStatus::Failed);
    }

    #[test]
    fn no_rollback_when_disabled() {
        let (mut conn, script, log) = testing::connect(Config::default().auto_rollback(false));
        script.error("ERROR", "22012", "division by zero").ready(b'E');

        assert!(run(conn.simple_query("SELECT 1/0;")).is_err());
        assert_eq!(conn.transaction_status(), TransactionStatus::Failed);
        assert_eq!(log.sent(), b"Q");
    }

    fn script_prepare(script: &testing::Script, params: &[u32], columns: &[(&str, u32)]) {
        script.parse_complete().params(params);
        match columns.is_empty() {
            true => script.no_data(),
            false => script.columns(columns, PgFormat::Text),
        };
        script.ready(b'I');
    }

    #[test]
    fn extended_execute() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script_prepare(&script, &[pg_type::INT4], &[("int4", pg_type::INT4)]);
        script
            .bind_complete()
            .row(&[Some(&7i32.to_be_bytes())])
            .complete("SELECT 1")
            .close_complete()
            .ready(b'I');

        let result = run(conn.execute("SELECT $1::int4", &[&7i32])).unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.columns()[0].format, PgFormat::Binary);
        assert_eq!(result.rows()[0].try_get::<_, i32>(0usize).unwrap(), 7);

        assert_eq!(log.sent(), b"PDSBECS");
        assert_eq!(conn.cached_statements(), 1);

        // cached, no second Parse
        log.clear();
        script
            .bind_complete()
            .row(&[Some(&8i32.to_be_bytes())])
            .complete("SELECT 1")
            .close_complete()
            .ready(b'I');
        let result = run(conn.execute("SELECT $1::int4", &[&8i32])).unwrap();
        assert_eq!(result.rows()[0].try_get::<_, i32>(0usize).unwrap(), 8);
        assert_eq!(log.sent(), b"BECS");
    }

    #[test]
    fn extended_simple_query() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script_prepare(&script, &[], &[]);
        script.bind_complete().complete("CREATE TABLE").close_complete().ready(b'I');

        let result = run(conn.simple_query("CREATE TABLE a (id int4)")).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.first().unwrap().message, "CREATE TABLE");
        assert_eq!(log.sent(), b"PDSBECS");
    }

    #[test]
    fn prepare_error_is_not_cached() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script.error("ERROR", "42601", "syntax error").ready(b'I');

        let err = run(conn.execute("SELEC 1", &[])).unwrap_err();
        assert_eq!(err.code(), Some("42601"));
        assert_eq!(conn.cached_statements(), 0);
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn eviction_closes_on_server() {
        let (mut conn, script, log) = testing::connect(Config::default().statement_cache_capacity(1));
        script_prepare(&script, &[], &[]);
        script.bind_complete().complete("DELETE 0").close_complete().ready(b'I');
        run(conn.execute("DELETE FROM a", &[])).unwrap();
        log.clear();

        script.close_complete().ready(b'I');
        script_prepare(&script, &[], &[]);
        script.bind_complete().complete("DELETE 0").close_complete().ready(b'I');
        run(conn.execute("DELETE FROM b", &[])).unwrap();

        assert_eq!(log.sent(), b"CSPDSBECS");
        let frames = log.frames();
        assert_eq!(&frames[0].1[..], b"Ss1\0");
        assert_eq!(&frames[2].1[..2], b"s2");
        assert_eq!(conn.cached_statements(), 1);
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn release_statement() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script_prepare(&script, &[], &[]);
        run(conn.prepare("DELETE FROM a", 0)).unwrap();
        log.clear();

        script.close_complete().ready(b'I');
        assert!(run(conn.release_statement("DELETE FROM a")).unwrap());
        assert!(!run(conn.release_statement("DELETE FROM a")).unwrap());
        assert_eq!(log.sent(), b"CS");
        assert_eq!(conn.cached_statements(), 0);
    }

    #[test]
    fn notification_during_query() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script
            .complete("NOTIFY")
            .notification("test", "hello")
            .ready(b'I');

        run(conn.notify("test", "hello")).unwrap();
        let notification = conn.notifications().try_recv().unwrap();
        assert_eq!(notification.channel, "test");
        assert_eq!(notification.payload, "hello");
        assert!(conn.notifications().is_empty());
    }

    #[test]
    fn wait_idle_times_out() {
        let (mut conn, script, _) = testing::connect(Config::default());
        assert!(!run(conn.wait_idle(Some(Duration::from_millis(1)))).unwrap());

        script.notification("jobs", "1");
        assert!(run(conn.wait_idle(Some(Duration::from_millis(1)))).unwrap());
        assert_eq!(conn.notifications().try_recv().unwrap().payload, "1");
    }
}
