use crate::{
    Result,
    result::{ResultBuilder, StatementResult},
    transport::PgTransport,
    types::Param,
};

use super::{Connection, statement};

impl<T: PgTransport> Connection<T> {
    /// Run several statements without waiting for each one to complete.
    ///
    /// Every statement is prepared first, then all `Bind`/`Execute` messages
    /// are sent in one write. With `sync_all` each statement is followed by
    /// `Sync` and commits on its own; a failure stops collecting the results
    /// of later statements, which the server still runs. Without it a single
    /// `Sync` ends the batch, the server runs it as one implicit transaction
    /// and the first failure rolls back everything.
    ///
    /// Server errors are returned as one failure.
    pub async fn pipeline(&mut self, statements: &[(&str, &[Param<'_>])], sync_all: bool) -> Result<StatementResult> {
        for (sql, params) in statements {
            statement::check_params(sql, params.len())?;
        }
        if statements.is_empty() {
            return Ok(StatementResult::default());
        }
        self.begin().await?;
        let result = self.pipeline_inner(statements, sync_all).await;
        self.statements.unpin_all();
        self.finish(result).await
    }

    async fn pipeline_inner(&mut self, statements: &[(&str, &[Param<'_>])], sync_all: bool) -> Result<StatementResult> {
        let mut prepared = Vec::with_capacity(statements.len());
        for (sql, params) in statements {
            let statement = statement::prepare(&mut self.stream, &mut self.statements, sql, params.len()).await?;
            self.statements.pin(sql);
            prepared.push(statement);
        }

        // encode everything before the first message is buffered
        let encoded = prepared
            .iter()
            .zip(statements)
            .map(|(statement, (_, params))| statement::encode_params(&self.registry, statement, params))
            .collect::<Result<Vec<_>>>()?;

        let mut columns = Vec::with_capacity(prepared.len());
        for (i, (statement, params)) in prepared.iter().zip(&encoded).enumerate() {
            let (formats, result_columns) = statement.result_columns(&self.registry);
            let sync = sync_all || i + 1 == prepared.len();
            statement::send_execute(&mut self.stream, statement, params, &formats, sync);
            columns.push(result_columns);
        }
        self.stream.flush().await?;
        for (sql, _) in statements {
            self.statements.mark_executed(sql);
        }

        let mut builder = ResultBuilder::new(self.registry.clone());
        for result_columns in columns {
            builder.set_columns(result_columns);
            self.collect_until(&mut builder, !sync_all).await?;
            if builder.has_errors() {
                break;
            }
        }
        builder.finish()
    }
}

#[cfg(test)]
mod test {
    use crate::{
        connection::Config,
        testing::{self, Script, run},
        types::Param,
    };

    const NO_PARAMS: &[Param<'static>] = &[];

    const INSERTS: [&str; 3] = [
        "INSERT INTO t VALUES (1)",
        "INSERT INTO u VALUES (1)",
        "INSERT INTO t VALUES (2)",
    ];

    fn script_prepares(script: &Script, count: usize) {
        for _ in 0..count {
            script.parse_complete().params(&[]).no_data().ready(b'I');
        }
    }

    #[test]
    fn sync_all_keeps_earlier_statements() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script_prepares(&script, 3);
        script
            .bind_complete()
            .complete("INSERT 0 1")
            .close_complete()
            .ready(b'I')
            .bind_complete()
            .error("ERROR", "23505", "duplicate key value violates unique constraint")
            .ready(b'I')
            .bind_complete()
            .complete("INSERT 0 1")
            .close_complete()
            .ready(b'I');

        let statements = INSERTS.map(|sql| (sql, NO_PARAMS));
        let err = run(conn.pipeline(&statements, true)).unwrap_err();
        assert_eq!(err.code(), Some("23505"));

        assert_eq!(log.sent(), b"PDSPDSPDSBECSBECSBECS");
        // the third statement is drained before the call returns
        assert_eq!(script.remaining(), 0);
        assert_eq!(conn.cached_statements(), 3);
    }

    #[test]
    fn single_sync_stops_at_first_error() {
        let (mut conn, script, log) = testing::connect(Config::default());
        script_prepares(&script, 3);
        script
            .bind_complete()
            .complete("INSERT 0 1")
            .close_complete()
            .bind_complete()
            .error("ERROR", "23505", "duplicate key value violates unique constraint")
            .ready(b'I');

        let statements = INSERTS.map(|sql| (sql, NO_PARAMS));
        let err = run(conn.pipeline(&statements, false)).unwrap_err();
        assert_eq!(err.code(), Some("23505"));

        assert_eq!(log.sent(), b"PDSPDSPDSBECBECBECS");
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn results_in_send_order() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script_prepares(&script, 3);
        for tag in ["INSERT 0 1", "INSERT 0 3", "INSERT 0 1"] {
            script.bind_complete().complete(tag).close_complete();
        }
        script.ready(b'I');

        let statements = INSERTS.map(|sql| (sql, NO_PARAMS));
        let result = run(conn.pipeline(&statements, false)).unwrap();
        let affected = result.iter().map(|r| r.rows_affected).collect::<Vec<_>>();
        assert_eq!(affected, [1, 3, 1]);
    }

    #[test]
    fn statements_larger_than_cache() {
        let (mut conn, script, _) = testing::connect(Config::default().statement_cache_capacity(2));
        script_prepares(&script, 2);

        let statements = INSERTS.map(|sql| (sql, NO_PARAMS));
        assert!(run(conn.pipeline(&statements, true)).is_err());
        assert!(!conn.is_closed());
        assert_eq!(conn.cached_statements(), 2);
    }
}
