use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use postline::Result;

mod connection;
mod query;
mod pipeline;
mod copy;
mod notify;
mod types;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    connection::main().instrument(trace_span!("connection")).await?;
    query::main().instrument(trace_span!("query")).await?;
    pipeline::main().instrument(trace_span!("pipeline")).await?;
    copy::main().instrument(trace_span!("copy")).await?;
    notify::main().instrument(trace_span!("notify")).await?;
    types::main().instrument(trace_span!("types")).await?;

    // blocking mode owns its thread
    tokio::task::spawn_blocking(connection::blocking)
        .await
        .expect("blocking example panicked")?;

    Ok(())
}
