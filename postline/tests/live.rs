//! Tests against a live server, run with `cargo test -- --ignored`.
//!
//! The server is taken from `DATABASE_URL` or the `PG*` variables.
use std::time::Duration;

use postline::{Client, Param, Result, connection::CopyStatement};

async fn client() -> Client {
    Client::connect_env().await.expect("DATABASE_URL points to a running server")
}

async fn count(client: &Client, table: &str) -> Result<i64> {
    let sql = format!("SELECT count(*) FROM {table}");
    let rows = client.execute(&sql, &[]).await?.decode::<(i64,)>()?;
    Ok(rows[0].0)
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn pipeline_sync_all_keeps_committed() -> Result<()> {
    let client = client().await;
    client.simple_query("CREATE TEMP TABLE p1(id int4 PRIMARY KEY);").await?;

    let insert = "INSERT INTO p1 VALUES ($1)";
    let one: &[Param] = &[&1i32];
    let two: &[Param] = &[&2i32];
    let err = client.pipeline(&[(insert, one), (insert, one), (insert, two)], true).await.unwrap_err();
    assert_eq!(err.code(), Some("23505"));
    assert_eq!(count(&client, "p1").await?, 2);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn pipeline_single_sync_rolls_back() -> Result<()> {
    let client = client().await;
    client.simple_query("CREATE TEMP TABLE p2(id int4 PRIMARY KEY);").await?;

    let insert = "INSERT INTO p2 VALUES ($1)";
    let one: &[Param] = &[&1i32];
    let two: &[Param] = &[&2i32];
    let err = client.pipeline(&[(insert, one), (insert, one), (insert, two)], false).await.unwrap_err();
    assert_eq!(err.code(), Some("23505"));
    assert_eq!(count(&client, "p2").await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn copy_in_aborted_by_producer() -> Result<()> {
    let client = client().await;
    client.simple_query("CREATE TEMP TABLE c1(id int4, name text); INSERT INTO c1 VALUES (0, 'zero');").await?;

    let copy = CopyStatement::into_table("c1");
    let rows = [Ok("1\tone\n".to_owned()), Err("row 2 is missing a delimiter")];
    let result = client.copy_in(&copy, rows).await?;
    assert_eq!(result.rows_affected, 0);
    assert_eq!(count(&client, "c1").await?, 1);

    let rows = (1..=3).map(|i| Ok::<_, String>(format!("{i}\tname\n")));
    let result = client.copy_in(&copy, rows).await?;
    assert_eq!(result.rows_affected, 3);

    let bad = [Ok::<_, String>("x\tname\n")];
    let err = client.copy_in(&copy, bad).await.unwrap_err();
    assert_eq!(err.code(), Some("22P02"));
    assert_eq!(count(&client, "c1").await?, 4);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn copy_out_rows() -> Result<()> {
    let client = client().await;
    let copy = CopyStatement::from_query("SELECT generate_series(1, 100)");
    let mut out = client.copy_out(&copy).await?;
    let mut lines = 0;
    while let Some(chunk) = out.chunk().await {
        lines += chunk?.iter().filter(|b| **b == b'\n').count();
    }
    assert_eq!(lines, 100);
    assert_eq!(out.rows_affected(), Some(100));
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn listen_notify_across_connections() -> Result<()> {
    let listener = client().await;
    let notifier = client().await;

    listener.listen("test").await?;
    notifier.notify("test", "hello").await?;

    let notification = tokio::time::timeout(Duration::from_secs(5), listener.recv_notification())
        .await
        .expect("notification within 5s")
        .expect("listener open");
    assert_eq!(notification.channel, "test");
    assert_eq!(notification.payload, "hello");
    assert!(listener.try_notification().is_none());
    Ok(())
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn blocking_listen_notify() -> Result<()> {
    let listener = postline::blocking::Client::connect_env()?;
    let notifier = postline::blocking::Client::connect_env()?;

    listener.listen("blocking")?;
    notifier.notify("blocking", "it's here")?;

    let notification = listener.poll_notification(Some(Duration::from_secs(5)))?.expect("notification within 5s");
    assert_eq!(notification.payload, "it's here");
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn values_roundtrip_through_server() -> Result<()> {
    let client = client().await;
    let rows = client
        .execute(
            "SELECT $1::int8, $2::text, $3::float8, $4::bool, $5::int4[], $6::bytea",
            &[&i64::MIN, &"héllo", &1.5f64, &true, &vec![1i32, 2, 3], &vec![0u8, 255]],
        )
        .await?
        .decode::<(i64, String, f64, bool, Vec<i32>, Vec<u8>)>()?;
    assert_eq!(rows[0], (i64::MIN, "héllo".to_owned(), 1.5, true, vec![1, 2, 3], vec![0, 255]));

    // the same values in text format
    let batch = client.simple_query("SELECT 9223372036854775807::int8, ARRAY['a', NULL]::text[] IS NULL;").await?;
    let row = &batch.first().unwrap().rows()[0];
    assert_eq!(row.try_get::<_, i64>(0usize)?, i64::MAX);
    assert!(!row.try_get::<_, bool>(1usize)?);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn failed_transaction_is_rolled_back() -> Result<()> {
    let client = client().await;
    assert!(client.simple_query("BEGIN; SELECT 1/0;").await.is_err());
    let conn = client.lock().await;
    assert_eq!(conn.transaction_status(), postline::postgres::TransactionStatus::Idle);
    Ok(())
}
