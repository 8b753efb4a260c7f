//! `postline` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    auth::AuthError,
    connection::ParseError,
    postgres::{DatabaseError, ProtocolError},
    types::{DecodeError, EncodeError},
};

/// A specialized [`Result`] type for `postline` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `postline` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns `true` when the connection that produced this error must be discarded.
    ///
    /// Transport failures, protocol violations and authentication failures are
    /// fatal. Server errors, codec errors and rejected calls leave the
    /// connection usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Io(_) | ErrorKind::Protocol(_) | ErrorKind::Auth(_)
        )
    }

    /// The first server error carried by this error, if any.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            ErrorKind::Combined(errors) => errors.first(),
            _ => None,
        }
    }

    /// SQLSTATE of [`as_database`][Error::as_database].
    pub fn code(&self) -> Option<&str> {
        self.as_database().map(|e| e.code.as_str())
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Fold server errors collected during one operation into a single failure.
    pub(crate) fn from_database_errors(mut errors: Vec<DatabaseError>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop().map(Error::from),
            _ => Some(ErrorKind::Combined(errors).into()),
        }
    }
}

/// All possible error kind from `postline` library.
pub enum ErrorKind {
    Config(ParseError),
    Io(io::Error),
    Protocol(ProtocolError),
    Auth(AuthError),
    Database(DatabaseError),
    /// More than one server error in one operation, in the order received.
    Combined(Vec<DatabaseError>),
    Encode(EncodeError),
    Decode(DecodeError),
    Usage(UsageError),
}

/// A call rejected before any network io.
pub enum UsageError {
    /// Query text is empty or whitespace.
    BlankQuery,
    /// Parameter list length differs from the placeholders in the query.
    ParameterCount { expected: usize, found: usize },
    /// The connection was closed or lost its transport.
    Closed,
    /// A COPY statement was given to the operation of the other direction.
    CopyDirection,
    /// Schema lookup found no type with that name or oid.
    TypeNotFound(String),
    /// Too many parameters or a too large value for the protocol.
    TooLarge(&'static str),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<UsageError>e => ErrorKind::Usage(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Combined(errors) => {
                write!(f, "{} errors:", errors.len())?;
                for e in errors {
                    write!(f, "\n  {e}")?;
                }
                Ok(())
            },
            Self::Encode(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Usage(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for UsageError { }

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlankQuery => f.write_str("query is blank"),
            Self::ParameterCount { expected, found } => write!(
                f,
                "query expects {expected} parameter(s) but {found} were given"
            ),
            Self::Closed => f.write_str("connection is closed"),
            Self::CopyDirection => f.write_str("COPY statement has the wrong direction for this operation"),
            Self::TypeNotFound(name) => write!(f, "type `{name}` not found"),
            Self::TooLarge(what) => write!(f, "{what} too large for the protocol"),
        }
    }
}

impl fmt::Debug for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn db(code: &str) -> DatabaseError {
        DatabaseError { code: code.into(), message: "boom".into(), severity: "ERROR".into(), ..Default::default() }
    }

    #[test]
    fn fold_errors() {
        assert!(Error::from_database_errors(vec![]).is_none());

        let one = Error::from_database_errors(vec![db("42P01")]).unwrap();
        assert!(matches!(one.kind(), ErrorKind::Database(_)));
        assert_eq!(one.code(), Some("42P01"));
        assert!(!one.is_fatal());

        let two = Error::from_database_errors(vec![db("23505"), db("25P02")]).unwrap();
        let ErrorKind::Combined(errors) = two.kind() else { panic!("not combined") };
        assert_eq!(errors.len(), 2);
        assert_eq!(two.code(), Some("23505"));
    }

    #[test]
    fn fatal_kinds() {
        let io = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(io.is_fatal());
        let usage = Error::from(UsageError::BlankQuery);
        assert!(!usage.is_fatal());
    }
}
