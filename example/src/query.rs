use postline::{Client, Result};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;

    // Simple query, one result per statement

    let batch = client
        .simple_query("CREATE TEMP TABLE postline(id serial, name text); INSERT INTO postline(name) VALUES ('Foo');")
        .await?;

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.rows_affected(), 1);

    // Extended query

    let row = client.execute("INSERT INTO postline(name) VALUES ($1)", &[&"Deez"]).await?;
    assert_eq!(row.rows_affected, 1);

    let datas = client
        .execute("SELECT id, name FROM postline ORDER BY id", &[])
        .await?
        .decode::<(i32, String)>()?;

    assert_eq!(datas.len(), 2);
    assert_eq!(datas[1].1, "Deez");

    let rows = client.execute("SELECT name FROM postline WHERE id = $1", &[&1i32]).await?;
    assert_eq!(rows.rows()[0].try_get::<_, String>("name").unwrap(), "Foo");

    let statement = client.prepare("SELECT name FROM postline WHERE id = $1", 1).await?;
    assert_eq!(statement.columns().len(), 1);

    // Errors

    let err = client.execute("SELECT $1, $2", &[&1i32]).await.unwrap_err();
    tracing::info!("rejected locally: {err}");

    let err = client.simple_query("SELECT * FROM missing;").await.unwrap_err();
    assert_eq!(err.code(), Some("42P01"));

    // A failed transaction is rolled back automatically
    let _ = client.simple_query("BEGIN; SELECT 1/0;").await;
    client.simple_query("SELECT 1;").await?;

    Ok(())
}
