use futures::StreamExt;
use postline::{Client, Result, connection::{CopyFormat, CopyStatement}};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;
    client
        .simple_query("CREATE TEMP TABLE copy(id int4, name text NOT NULL);")
        .await?;

    let copy_in = CopyStatement::into_table("copy").format(CopyFormat::Csv);
    let rows = (0..1000).map(|i| Ok::<_, std::io::Error>(format!("{i},name {i}\n")));
    let result = client.copy_in(&copy_in, rows).await?;
    assert_eq!(result.rows_affected, 1000);

    // a failing producer aborts the copy, nothing is inserted
    let rows = [Ok("1001,late\n".to_owned()), Err("producer failed")];
    let result = client.copy_in(&copy_in, rows).await?;
    assert_eq!(result.rows_affected, 0);
    tracing::info!("{}", result.message);

    let copy_out = CopyStatement::from_query("SELECT id, name FROM copy ORDER BY id").format(CopyFormat::Csv);
    let mut out = client.copy_out(&copy_out).await?;
    let mut lines = 0;
    while let Some(chunk) = out.next().await {
        lines += chunk?.iter().filter(|b| **b == b'\n').count();
    }
    assert_eq!(lines, 1000);
    assert_eq!(out.rows_affected(), Some(1000));

    Ok(())
}
