//! Postgres Backend Messages
use bytes::Bytes;

use super::{DatabaseError, Oid, PgFormat, ProtocolError};
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    ErrorResponse(ErrorResponse),
    EmptyQueryResponse(EmptyQueryResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }

        $(
            impl TryFrom<BackendMessage> for $name {
                type Error = ProtocolError;

                fn try_from(message: BackendMessage) -> Result<Self, ProtocolError> {
                    match message {
                        BackendMessage::$name(ok) => Ok(ok),
                        other => Err(ProtocolError::unexpected($name::MSGTYPE, other.msgtype())),
                    }
                }
            }
        )*
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    ErrorResponse,
    EmptyQueryResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE,$typ))
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8;4],
    },
    /// Specifies that SASL authentication is required.
    SASL {
        /// Nul separated list of mechanism names, in the server's order of preference.
        mechanisms: Bytes,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        data: Bytes,
    },
    /// Kerberos, GSSAPI or SSPI, which this driver does not speak.
    Unsupported {
        code: u32,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Iterate SASL mechanism names, empty for other variants.
    pub fn sasl_mechanisms(&self) -> impl Iterator<Item = &[u8]> {
        let list: &[u8] = match self {
            Authentication::SASL { mechanisms } => mechanisms,
            _ => &[],
        };
        list.split(|b| *b == b'\0').filter(|name| !name.is_empty())
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let auth = match body.try_u32()? {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => Authentication::MD5Password { salt: body.try_u32()?.to_be_bytes() },
            10 => Authentication::SASL { mechanisms: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            code @ (2 | 7 | 8 | 9) => Authentication::Unsupported { code },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: body.try_u32()?,
            secret_key: body.try_u32()?,
        })
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: String,
    /// The current value of the parameter
    pub value: String
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: body.get_nul_string()?,
            value: body.get_nul_string()?,
        })
    }
}

/// A warning message. The frontend should display the message.
#[derive(Debug)]
pub struct NoticeResponse {
    pub notice: DatabaseError,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { notice: DatabaseError::parse(body)? })
    }
}

/// Identifies the message as an error
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: DatabaseError,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { error: DatabaseError::parse(body)? })
    }
}

/// Asynchronous `NOTIFY` delivered to this session.
#[derive(Debug)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: body.try_u32()?,
            channel: body.get_nul_string()?,
            payload: body.get_nul_string()?,
        })
    }
}

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    /// The field name.
    pub name: ByteStr,
    /// Object ID of the owning table, or zero.
    pub table_oid: Oid,
    /// Attribute number of the column, or zero.
    pub attribute: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size, negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier, meaning is type-specific.
    pub type_modifier: i32,
    /// Wire format of the values of this column.
    pub format: PgFormat,
}

/// Identifies the message as a row description
#[derive(Debug)]
pub struct RowDescription {
    pub columns: Vec<ColumnDescription>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_u16()?;
        let mut columns = Vec::with_capacity(len as usize);
        for _ in 0..len {
            columns.push(ColumnDescription {
                name: body.get_nul_bytestr()?,
                table_oid: body.try_u32()?,
                attribute: body.try_i16()?,
                type_oid: body.try_u32()?,
                type_size: body.try_i16()?,
                type_modifier: body.try_i32()?,
                format: PgFormat::from_code(body.try_u16()?),
            });
        }
        Ok(Self { columns })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// Column values, `None` is SQL NULL.
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_u16()?;
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let value = match body.try_i32()? {
                -1 => None,
                n if n < 0 => return Err(ProtocolError::malformed("negative column length")),
                n => Some(body.try_split(n as usize)?),
            };
            values.push(value);
        }
        Ok(Self { values })
    }
}

/// Identifies the message as a command-completed response
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag, e.g. `INSERT 0 3`.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Rows affected as reported by the tag, zero for commands without a count.
    ///
    /// `INSERT oid rows` carries the count in the third word, `SELECT`,
    /// `UPDATE`, `DELETE`, `MERGE`, `FETCH`, `MOVE` and `COPY` in the second.
    pub fn rows_affected(&self) -> u64 {
        let mut words = self.tag.split_whitespace();
        let count = match words.next() {
            Some("INSERT") => words.nth(1),
            Some("SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY") => words.next(),
            _ => None,
        };
        count.and_then(|n| n.parse().ok()).unwrap_or(0)
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: body.get_nul_bytestr()? })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server.
    pub minor: u32,
    /// Protocol options not recognized by the server.
    pub unrecognized: Vec<String>,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let minor = body.try_u32()?;
        let len = body.try_u32()?;
        let mut unrecognized = Vec::new();
        for _ in 0..len {
            unrecognized.push(body.get_nul_string()?);
        }
        Ok(Self { minor, unrecognized })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// Object ID of each parameter data type.
    pub oids: Vec<Oid>,
}

impl ParameterDescription  {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_u16()?;
        let oids = (0..len).map(|_| body.try_u32()).collect::<Result<_, _>>()?;
        Ok(Self { oids })
    }
}

/// Identifies the message as the current transaction status.
#[derive(Debug)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        let status = match body.try_u8()? {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => return Err(ProtocolError::malformed("unknown transaction status")),
        };
        Ok(Self { status })
    }
}

/// Backend transaction status reported by every `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block, queries are rejected until the block is ended.
    Failed,
}

/// Raw COPY payload.
#[derive(Debug)]
pub struct CopyData {
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self,ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data: body })
    }
}

macro_rules! copy_response {
    ($($(#[$doc:meta])* struct $name:ident, $ty:literal;)*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// Overall format, `Binary` for binary COPY.
            pub format: PgFormat,
            /// Per column format codes.
            pub column_formats: Vec<PgFormat>,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, mut body: Bytes) -> Result<Self,ProtocolError> {
                assert_msgtype!(msgtype);
                let format = PgFormat::from_code(body.try_u8()?.into());
                let len = body.try_u16()?;
                let column_formats = (0..len)
                    .map(|_| body.try_u16().map(PgFormat::from_code))
                    .collect::<Result<_, _>>()?;
                Ok(Self { format, column_formats })
            }
        }
    )*};
}

copy_response! {
    /// The server is ready to accept COPY data.
    struct CopyInResponse, b'G';

    /// The server is about to send COPY data.
    struct CopyOutResponse, b'H';
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self,ProtocolError> {
                    assert_msgtype!(msgtype);
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// End of COPY OUT data.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rows_affected() {
        let tag = |s: &'static str| CommandComplete { tag: ByteStr::from_static(s) };
        assert_eq!(tag("INSERT 0 3").rows_affected(), 3);
        assert_eq!(tag("SELECT 12").rows_affected(), 12);
        assert_eq!(tag("COPY 5").rows_affected(), 5);
        assert_eq!(tag("CREATE TABLE").rows_affected(), 0);
        assert_eq!(tag("LISTEN").rows_affected(), 0);
    }

    #[test]
    fn decode_data_row() {
        let body = Bytes::from_static(b"\0\x03\0\0\0\x02ab\xff\xff\xff\xff\0\0\0\0");
        let BackendMessage::DataRow(row) = BackendMessage::decode(b'D', body).unwrap() else {
            panic!("not a data row");
        };
        assert_eq!(row.values.len(), 3);
        assert_eq!(row.values[0].as_deref(), Some(&b"ab"[..]));
        assert_eq!(row.values[1], None);
        assert_eq!(row.values[2].as_deref(), Some(&b""[..]));
    }

    #[test]
    fn decode_truncated_row() {
        let body = Bytes::from_static(b"\0\x01\0\0\0\x09ab");
        assert!(BackendMessage::decode(b'D', body).is_err());
    }

    #[test]
    fn decode_unknown_type() {
        assert!(BackendMessage::decode(b'?', Bytes::new()).is_err());
    }

    #[test]
    fn decode_sasl_mechanisms() {
        let body = Bytes::from_static(b"\0\0\0\x0aSCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let auth = Authentication::decode(b'R', body).unwrap();
        let names: Vec<_> = auth.sasl_mechanisms().collect();
        assert_eq!(names, [&b"SCRAM-SHA-256-PLUS"[..], &b"SCRAM-SHA-256"[..]]);
    }

    #[test]
    fn decode_ready() {
        let ready = ReadyForQuery::decode(b'Z', Bytes::from_static(b"E")).unwrap();
        assert_eq!(ready.status, TransactionStatus::Failed);
        assert!(ReadyForQuery::decode(b'Z', Bytes::from_static(b"?")).is_err());
    }
}
