/// Postgres data transmission format.
///
/// Both formats are supported by every codec in [`TypeRegistry`][crate::types::TypeRegistry].
/// [`Binary`][b] is requested whenever a codec is registered for the type, [`Text`][t]
/// is the fallback, and also what the simple query protocol always returns.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
///
/// [t]: PgFormat::Text
/// [b]: PgFormat::Binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    /// Text has format code zero.
    ///
    /// There is no trailing null character, and the format does not allow embedded nulls.
    Text,
    /// Binary has format code one.
    ///
    /// Integers use network byte order.
    Binary,
}

impl PgFormat {
    /// Return format code for current format.
    pub fn format_code(self) -> u16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }

    /// Read a format code, anything but one is text.
    pub fn from_code(code: u16) -> PgFormat {
        match code {
            1 => PgFormat::Binary,
            _ => PgFormat::Text,
        }
    }
}
