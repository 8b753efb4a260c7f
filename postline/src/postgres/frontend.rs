//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, BytesMut};

use super::{Oid, PgFormat};
use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// Protocol version 3.0
pub const PROTOCOL_VERSION: u32 = 196_608;

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(&mut *buf);

    debug_assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "Frontend message body size not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Size of the main body, excluding the message type and the length itself.
    fn size_hint(&self) -> u32;

    /// Write the main body of the message.
    ///
    /// The length written must be equal to [`size_hint`][FrontendProtocol::size_hint].
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// The very first message sent by the client has no message-type byte, thus
/// [`Startup`] does not implement [`FrontendProtocol`], use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Run-time parameters applied as session defaults, e.g. `application_name`,
    /// `search_path` or `statement_timeout`.
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // reserve 4 bytes for length
        buf.put_u32(0);
        buf.put_u32(PROTOCOL_VERSION);

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        for (key, value) in self.params {
            buf.put_nul_string(key);
            buf.put_nul_string(value);
        }

        // terminator after the last name/value pair
        buf.put_u8(b'\0');

        let mut written_buf = &mut buf[offset..];
        written_buf.put_u32(written_buf.len().to_u32());
    }
}

macro_rules! size_of {
    ($self:tt.$field:ident) => {
        size_of_val(&$self.$field) as u32
    };
}

/// Password response, also used for the cleartext and md5 challenge.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// First message of a SASL exchange, naming the selected mechanism.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.mechanism.nul_string_len() + 4 + self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.mechanism);
        buf.put_i32(self.data.len().to_u32() as i32);
        buf.put(self.data);
    }
}

/// Subsequent SASL message, mechanism specific data only.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put(self.data);
    }
}

/// Identifies the message as a simple query
#[derive(Debug)]
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> u32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
#[derive(Debug)]
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Parameter types to prespecify, zero leaves the type unspecified.
    ///
    /// This is not an indication of the number of parameters in the query string.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> u32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + 4 * self.oids.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.oids.len().to_u16());
        for &oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// Identifies the message as a Bind command.
#[derive(Debug)]
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement.
    pub stmt_name: &'a str,
    /// One format code per parameter.
    pub param_formats: &'a [PgFormat],
    /// Number of parameter values in `params`.
    pub params_len: u16,
    /// Parameter values already written as `Int32` length (-1 for NULL) followed by the value.
    pub params: &'a [u8],
    /// One format code per result column.
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> u32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2
            + 2 * self.param_formats.len().to_u32()
            + size_of!(self.params_len)
            + self.params.len().to_u32()
            + 2
            + 2 * self.result_formats.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_u16(self.param_formats.len().to_u16());
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params_len);
        buf.put(self.params);

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Execute command
#[derive(Debug)]
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> u32 {
        self.portal_name.nul_string_len() + size_of!(self.max_row)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command
#[derive(Debug)]
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close.
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> u32 {
        size_of!(self.variant) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe.
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> u32 {
        size_of!(self.kind) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// COPY data, the content is whatever the COPY format says it is.
#[derive(Debug)]
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> u32 {
        self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put(self.data);
    }
}

/// Abort a COPY IN, the server answers with an `ErrorResponse` carrying `message`.
#[derive(Debug)]
pub struct CopyFail<'a> {
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> u32 {
        self.message.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.message);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn size_hint(&self) -> u32 { 0 }

            fn encode(self, _: impl BufMut) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Sync command
    struct Sync, b'S';

    /// Identifies the message as a Flush command
    struct Flush, b'H';

    /// Successful end of COPY IN data.
    struct CopyDone, b'c';

    /// Graceful close of the session.
    struct Terminate, b'X';
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn startup_layout() {
        let mut buf = BytesMut::new();
        Startup { user: "u", database: Some("d"), params: &[("application_name", "x")] }.write(&mut buf);
        let expected: &[u8] = b"\0\0\0\0\0\x03\0\0user\0u\0database\0d\0application_name\0x\0\0";
        assert_eq!(&buf[4..], &expected[4..]);
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize, buf.len());
    }

    #[test]
    fn bind_layout() {
        let mut buf = BytesMut::new();
        let params = [0, 0, 0, 4, 0, 0, 0, 7, 0xff, 0xff, 0xff, 0xff];
        write(
            Bind {
                portal_name: "",
                stmt_name: "s1",
                param_formats: &[PgFormat::Binary, PgFormat::Text],
                params_len: 2,
                params: &params,
                result_formats: &[PgFormat::Binary],
            },
            &mut buf,
        );
        assert_eq!(buf[0], b'B');
        let len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        assert_eq!(len + 1, buf.len());
        assert_eq!(&buf[5..9], b"\0s1\0");
        assert_eq!(&buf[9..15], &[0, 2, 0, 1, 0, 0]);
        assert_eq!(&buf[15..17], &[0, 2]);
        assert_eq!(&buf[17..29], &params);
        assert_eq!(&buf[29..], &[0, 1, 0, 1]);
    }

    #[test]
    fn unit_message() {
        let mut buf = BytesMut::new();
        write(Sync, &mut buf);
        write(CopyDone, &mut buf);
        assert_eq!(&buf[..], b"S\0\0\0\x04c\0\0\0\x04");
    }
}
