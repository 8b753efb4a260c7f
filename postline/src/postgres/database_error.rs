//! Structured `ErrorResponse` and `NoticeResponse` fields.
use bytes::{Buf, Bytes};
use std::fmt;

use super::ProtocolError;
use crate::ext::BytesExt;

/// An error or notice reported by the server.
///
/// Field semantics follow
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseError {
    /// `ERROR`, `FATAL`, `PANIC`, `WARNING`, `NOTICE`, `DEBUG`, `INFO` or `LOG`.
    pub severity: String,
    /// The SQLSTATE code.
    pub code: String,
    /// Primary human-readable message.
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Cursor position into the original query string, 1-based characters.
    pub position: Option<u32>,
    /// Cursor position into an internally generated command.
    pub internal_position: Option<u32>,
    /// The internally generated command that failed.
    pub internal_query: Option<String>,
    /// Context in which the error occurred, e.g. a call stack traceback.
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub datatype: Option<String>,
    pub constraint: Option<String>,
    /// Source file name where the error was reported.
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

/// SQLSTATE of `query_canceled`, also what a client initiated `CopyFail` produces.
pub const QUERY_CANCELED: &str = "57014";

impl DatabaseError {
    pub(crate) fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut me = DatabaseError::default();
        let mut localized_severity = None;

        loop {
            let field = body.try_u8()?;
            if field == b'\0' {
                break;
            }
            let value = body.get_nul_string()?;
            match field {
                b'S' => localized_severity = Some(value),
                b'V' => me.severity = value,
                b'C' => me.code = value,
                b'M' => me.message = value,
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = value.parse().ok(),
                b'p' => me.internal_position = value.parse().ok(),
                b'q' => me.internal_query = Some(value),
                b'W' => me.where_ = Some(value),
                b's' => me.schema = Some(value),
                b't' => me.table = Some(value),
                b'c' => me.column = Some(value),
                b'd' => me.datatype = Some(value),
                b'n' => me.constraint = Some(value),
                b'F' => me.file = Some(value),
                b'L' => me.line = value.parse().ok(),
                b'R' => me.routine = Some(value),
                // unrecognized fields are silently ignored
                _ => {}
            }
        }

        if body.has_remaining() {
            return Err(ProtocolError::malformed("trailing bytes after error fields"));
        }

        // `V` is not localized but only sent since 9.6
        if me.severity.is_empty() {
            me.severity = localized_severity.unwrap_or_default();
        }

        Ok(me)
    }

    /// Returns `true` if the server canceled the statement, which covers
    /// `statement_timeout` and a client `CopyFail`.
    pub fn is_query_canceled(&self) -> bool {
        self.code == QUERY_CANCELED
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
