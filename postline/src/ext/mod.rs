use bytes::{Buf, BufMut, Bytes};

use crate::{common::ByteStr, postgres::ProtocolError};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// Length is `usize` in rust, while postgres want `u32`.
    ///
    /// # Panics
    ///
    /// Panics on overflow instead of wrapping. Callers validate user supplied
    /// lengths before they reach the codec.
    fn to_u32(self) -> u32;

    /// Same as [`to_u32`][UsizeExt::to_u32] for `u16` counts.
    fn to_u16(self) -> u16;
}

/// Nul string operation.
pub trait StrExt {
    /// String length plus nul (1).
    fn nul_string_len(&self) -> u32;
}

/// Nul string operation in [`BufMut`]
pub trait BufMutExt {
    /// Write string and nul termination.
    fn put_nul_string(&mut self, string: &str);
}

/// Checked reads from a backend message body.
///
/// A short or malformed body is reported as [`ProtocolError`] instead of
/// panicking like the plain [`Buf`] getters.
pub trait BytesExt {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError>;

    fn get_nul_string(&mut self) -> Result<String, ProtocolError> {
        self.get_nul_bytestr().map(ByteStr::into_string)
    }

    fn try_u8(&mut self) -> Result<u8, ProtocolError>;

    fn try_u16(&mut self) -> Result<u16, ProtocolError>;

    fn try_i16(&mut self) -> Result<i16, ProtocolError>;

    fn try_u32(&mut self) -> Result<u32, ProtocolError>;

    fn try_i32(&mut self) -> Result<i32, ProtocolError>;

    /// Split `len` bytes off the front.
    fn try_split(&mut self, len: usize) -> Result<Bytes, ProtocolError>;
}

/// Helper trait to [`Display`][std::fmt::Display] bytes.
pub trait FmtExt {
    /// Lossy [`Display`][std::fmt::Display] bytes.
    fn lossy(&self) -> LossyFmt<'_>;
}

/// Lossy [`Display`][std::fmt::Display] implementation for bytes.
pub struct LossyFmt<'a>(pub &'a [u8]);

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        match u32::try_from(self) {
            Ok(ok) => ok,
            Err(_) => panic!("message size too large for protocol: {self}"),
        }
    }

    fn to_u16(self) -> u16 {
        match u16::try_from(self) {
            Ok(ok) => ok,
            Err(_) => panic!("message count too large for protocol: {self}"),
        }
    }
}

impl StrExt for str {
    fn nul_string_len(&self) -> u32 {
        self.len().to_u32() + 1/* nul */
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

macro_rules! try_get {
    ($($name:ident => $get:ident -> $ty:ty;)*) => {$(
        fn $name(&mut self) -> Result<$ty, ProtocolError> {
            self.$get().map_err(|_| ProtocolError::malformed(concat!("body too short for ", stringify!($ty))))
        }
    )*};
}

impl BytesExt for Bytes {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError> {
        let Some(end) = self.iter().position(|e| *e == b'\0') else {
            return Err(ProtocolError::malformed("string is not nul terminated"));
        };
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        ByteStr::from_utf8(me).map_err(ProtocolError::from)
    }

    try_get! {
        try_u8 => try_get_u8 -> u8;
        try_u16 => try_get_u16 -> u16;
        try_i16 => try_get_i16 -> i16;
        try_u32 => try_get_u32 -> u32;
        try_i32 => try_get_i32 -> i32;
    }

    fn try_split(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.len() < len {
            return Err(ProtocolError::malformed("declared length exceeds body"));
        }
        Ok(self.split_to(len))
    }
}

impl FmtExt for [u8] {
    fn lossy(&self) -> LossyFmt<'_> {
        LossyFmt(self)
    }
}

impl std::fmt::Display for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nul_string() {
        let mut body = Bytes::from_static(b"user\0postgres\0");
        assert_eq!(body.get_nul_string().unwrap(), "user");
        assert_eq!(body.get_nul_string().unwrap(), "postgres");
        assert!(body.is_empty());
        assert!(body.get_nul_string().is_err());
    }

    #[test]
    fn short_body() {
        let mut body = Bytes::from_static(b"\0\0\0");
        assert!(body.try_u32().is_err());
        assert_eq!(body.try_u16().unwrap(), 0);
        assert!(body.try_split(2).is_err());
    }

    #[test]
    fn lossy() {
        assert_eq!(b"ab\x01".lossy().to_string(), "ab\\x01");
    }
}
