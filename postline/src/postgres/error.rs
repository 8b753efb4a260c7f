//! Protocol error
use std::fmt;

use super::BackendMessage;

/// The backend sent something this driver cannot make sense of.
///
/// Always fatal, the connection is left in an unknown state.
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    Malformed {
        reason: &'static str,
    },
    Utf8(std::str::Utf8Error),
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => write!(
                        f,
                        "expected message `{}` found `{found}`",
                        BackendMessage::message_name(m),
                    )?,
                    None => write!(f, "unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => {
                write!(f, "unknown authentication request code `{auth}`")
            },
            ProtocolError::Malformed { reason } => write!(f, "malformed backend message: {reason}"),
            ProtocolError::Utf8(ref e) => write!(f, "backend string is not utf8: {e}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(reason: &'static str) -> ProtocolError {
        Self::Malformed { reason }
    }
}
