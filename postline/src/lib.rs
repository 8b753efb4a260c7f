//! Postgres wire protocol driver.
//!
//! The protocol logic lives in [`Connection`], written once against the
//! [`PgTransport`][transport::PgTransport] trait. The transport decides the
//! execution mode:
//!
//! - [`Client`] shares a connection between tokio tasks, a background task
//!   reads the socket
//! - [`blocking::Client`] shares a connection between threads, every call
//!   runs on the calling thread
//!
//! # Examples
//!
//! ```no_run
//! use postline::{Client, connection::CopyStatement};
//!
//! # async fn app() -> postline::Result<()> {
//! let client = Client::connect_env().await?;
//!
//! client.simple_query("CREATE TEMP TABLE foo(id int4, name text);").await?;
//! client.execute("INSERT INTO foo VALUES ($1, $2)", &[&1i32, &"one"]).await?;
//!
//! let two: &[postline::Param] = &[&2i32, &"two"];
//! let rows = client
//!     .pipeline(
//!         &[
//!             ("INSERT INTO foo VALUES ($1, $2)", two),
//!             ("SELECT id, name FROM foo ORDER BY id", &[]),
//!         ],
//!         true,
//!     )
//!     .await?;
//! let foos: Vec<(i32, String)> = rows.last().cloned().unwrap_or_default().decode()?;
//! assert_eq!(foos.len(), 2);
//!
//! let copy = CopyStatement::into_table("foo");
//! let data = [Ok::<_, std::io::Error>("3\tthree\n")];
//! client.copy_in(&copy, data).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Blocking mode:
//!
//! ```no_run
//! # fn app() -> postline::Result<()> {
//! let client = postline::blocking::Client::connect_env()?;
//! client.listen("jobs")?;
//! if let Some(job) = client.poll_notification(Some(std::time::Duration::from_secs(1)))? {
//!     println!("{}: {}", job.channel, job.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod net;

// Protocol
pub mod postgres;
pub mod transport;
pub mod stream;
mod auth;

// Encoding
pub mod types;
pub mod row;
pub mod result;
pub mod sql;

// Connection
pub mod connection;
#[cfg(feature = "tokio")]
mod client;
pub mod blocking;
pub mod pool;

mod error;

#[cfg(test)]
mod testing;

pub use auth::AuthError;
pub use connection::{Config, Connection, CopyStatement, Notification, NotificationQueue};
#[cfg(feature = "tokio")]
pub use client::Client;
pub use pool::PoolHandle;
pub use postgres::DatabaseError;
pub use result::{QueryResult, StatementResult};
pub use row::{FromRow, Row};
pub use types::{DecodeError, EncodeError, Param, TypeRegistry};
pub use error::{Error, ErrorKind, Result, UsageError};
