//! Postgres Frontend and Backend Protocol
//!
//! All communication is through a stream of messages. The first byte of a message identifies the message type,
//! and the next four bytes specify the length of the rest of the message (this length count includes itself,
//! but not the message-type byte).
//!
//! ```text
//! ┏━━━━┳━━━━━━━━━━━━━━━━━━━┳━━━━━━┓
//! ┃ Ty ┃       Length      ┃ Body ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━┫
//! ┃ u8 ┃        u32        ┃ [u8] ┃
//! ┗━━━━┻━━━━━━━━━━━━━━━━━━━┻━━━━━━┛
//! ```
//!
//! For historical reasons, the very first message sent by the client (the startup message)
//! has no initial message-type byte.
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>

mod pg_format;
mod database_error;

pub mod pg_type;
pub mod frontend;
pub mod backend;

mod error;

pub use pg_type::Oid;
pub use pg_format::PgFormat;
pub use database_error::{DatabaseError, QUERY_CANCELED};

pub use frontend::FrontendProtocol;
pub use backend::{BackendMessage, BackendProtocol, ColumnDescription, TransactionStatus};
pub use error::ProtocolError;

/// Size of the message type and length prefix.
pub const HEADER_LEN: usize = 5;

/// Largest backend message accepted, guards against a corrupt length prefix.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;
