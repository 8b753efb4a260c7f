use postline::{Client, Param, Result};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;
    client
        .simple_query("CREATE TEMP TABLE pipeline(id int4 PRIMARY KEY);")
        .await?;

    let one: &[Param] = &[&1i32];
    let two: &[Param] = &[&2i32];
    let insert = "INSERT INTO pipeline(id) VALUES ($1)";

    // each statement commits on its own
    let err = client.pipeline(&[(insert, one), (insert, one), (insert, two)], true).await;
    assert!(err.is_err());
    let count = client.execute("SELECT count(*) FROM pipeline", &[]).await?.decode::<(i64,)>()?;
    assert_eq!(count[0].0, 2);

    // one implicit transaction
    client.simple_query("TRUNCATE pipeline;").await?;
    let err = client.pipeline(&[(insert, one), (insert, one), (insert, two)], false).await;
    assert!(err.is_err());
    let count = client.execute("SELECT count(*) FROM pipeline", &[]).await?.decode::<(i64,)>()?;
    assert_eq!(count[0].0, 0);

    let results = client
        .pipeline(&[(insert, one), ("SELECT id FROM pipeline", &[])], false)
        .await?;
    assert_eq!(results.len(), 2);

    Ok(())
}
