use std::env::var;
use postline::{Client, Config, Connection, Result, transport::TokioTransport};

pub async fn main() -> Result<()> {
    let config = Config::parse(&var("DATABASE_URL").unwrap())?;
    let mut conn = Connection::<TokioTransport>::connect(config).await?;
    conn.simple_query("SELECT 1;").await?;
    assert!(conn.parameter("server_version").is_some());
    conn.close().await?;

    let mut conn = Connection::<TokioTransport>::connect_env().await?;
    conn.simple_query("SELECT 1").await?;
    conn.close().await?;

    let config = Config::from_env()
        .application_name("postline-example")
        .statement_cache_capacity(4);
    let client = Client::connect(config).await?;
    client.simple_query("SELECT 1").await?;
    client.close().await?;

    Ok(())
}

pub fn blocking() -> Result<()> {
    let client = postline::blocking::Client::connect_env()?;

    let mut handles = vec![];
    for i in 0..4i32 {
        let client = client.clone();
        handles.push(std::thread::spawn(move || client.execute("SELECT $1::int4", &[&i])));
    }
    for handle in handles {
        let result = handle.join().unwrap()?;
        assert_eq!(result.rows().len(), 1);
    }

    client.close()
}
