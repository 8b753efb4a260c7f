//! Codecs for the scalar types every server has.
use bytes::{BufMut, BytesMut};

use super::{ArrayCodec, Codec, DecodeError, EncodeError, TypeRegistry, text};
use crate::postgres::{Oid, PgFormat, pg_type::*};

/// Install the built-in scalar and array codecs.
pub(super) fn install(registry: &TypeRegistry) {
    registry.register_with_array(BoolCodec, BOOL_ARRAY);
    registry.register_with_array(ByteaCodec, BYTEA_ARRAY);
    registry.register_with_array(CharCodec, CHAR_ARRAY);
    registry.register_with_array(Int2Codec, INT2_ARRAY);
    registry.register_with_array(Int4Codec, INT4_ARRAY);
    registry.register_with_array(Int8Codec, INT8_ARRAY);
    registry.register_with_array(OidCodec, OID_ARRAY);
    registry.register_with_array(Float4Codec, FLOAT4_ARRAY);
    registry.register_with_array(Float8Codec, FLOAT8_ARRAY);
    registry.register(TextCodec);
    registry.register_array(ArrayCodec::new(TEXT_ARRAY, TextCodec).with_compatible(&[VARCHAR_ARRAY]));
    registry.register_encoder(StrCodec);

    #[cfg(feature = "json")]
    {
        use super::JsonCodec;
        registry.register_with_array(JsonCodec::jsonb(), JSONB_ARRAY);
        registry.register_decoder(JsonCodec::json());
        registry.register_decoder(ArrayCodec::new(JSON_ARRAY, JsonCodec::json()));
    }

    #[cfg(feature = "time")]
    {
        use super::{DateCodec, TimestampCodec, TimestamptzCodec};
        registry.register_with_array(DateCodec, DATE_ARRAY);
        registry.register_with_array(TimestampCodec, TIMESTAMP_ARRAY);
        registry.register_with_array(TimestamptzCodec, TIMESTAMPTZ_ARRAY);
    }
}

fn fixed<const N: usize>(raw: &[u8]) -> Result<[u8; N], DecodeError> {
    raw.try_into()
        .map_err(|_| DecodeError::invalid(format!("expected {N} bytes, found {}", raw.len())))
}

fn parse<T: std::str::FromStr>(raw: &[u8]) -> Result<T, DecodeError>
where
    T::Err: std::fmt::Display,
{
    let text = text(raw)?;
    text.parse().map_err(|e| DecodeError::invalid(format!("`{text}`: {e}")))
}

/// `bool`
#[derive(Debug, Clone, Copy)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    type Value = bool;

    fn oid(&self) -> Oid {
        BOOL
    }

    fn encode(&self, value: &bool, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => buf.put_u8(*value as u8),
            PgFormat::Text => buf.put_u8(if *value { b't' } else { b'f' }),
        }
        Ok(())
    }

    fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<bool, DecodeError> {
        match (format, raw) {
            (PgFormat::Binary, [b]) => Ok(*b != 0),
            (PgFormat::Text, b"t" | b"true") => Ok(true),
            (PgFormat::Text, b"f" | b"false") => Ok(false),
            _ => Err(DecodeError::invalid("invalid boolean")),
        }
    }
}

/// `bytea` as `Vec<u8>`, text form is the hex output format.
#[derive(Debug, Clone, Copy)]
pub struct ByteaCodec;

impl Codec for ByteaCodec {
    type Value = Vec<u8>;

    fn oid(&self) -> Oid {
        BYTEA
    }

    fn encode(&self, value: &Vec<u8>, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => buf.put_slice(value),
            PgFormat::Text => {
                const HEX: &[u8; 16] = b"0123456789abcdef";
                buf.reserve(2 + value.len() * 2);
                buf.put_slice(b"\\x");
                for b in value {
                    buf.put_u8(HEX[(b >> 4) as usize]);
                    buf.put_u8(HEX[(b & 0xf) as usize]);
                }
            }
        }
        Ok(())
    }

    fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<Vec<u8>, DecodeError> {
        if format == PgFormat::Binary {
            return Ok(raw.to_vec());
        }
        let Some(hex) = raw.strip_prefix(b"\\x") else {
            return Err(DecodeError::invalid("bytea text is not in hex format"));
        };
        if hex.len() % 2 != 0 {
            return Err(DecodeError::invalid("odd bytea hex length"));
        }
        fn nibble(b: u8) -> Result<u8, DecodeError> {
            match b {
                b'0'..=b'9' => Ok(b - b'0'),
                b'a'..=b'f' => Ok(b - b'a' + 10),
                b'A'..=b'F' => Ok(b - b'A' + 10),
                _ => Err(DecodeError::invalid("invalid bytea hex digit")),
            }
        }
        hex.chunks_exact(2)
            .map(|pair| Ok(nibble(pair[0])? << 4 | nibble(pair[1])?))
            .collect()
    }
}

/// The single byte `"char"` type as `i8`.
#[derive(Debug, Clone, Copy)]
pub struct CharCodec;

impl Codec for CharCodec {
    type Value = i8;

    fn oid(&self) -> Oid {
        CHAR
    }

    fn encode(&self, value: &i8, _: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_i8(*value);
        Ok(())
    }

    fn decode(&self, raw: &[u8], _: PgFormat, _: &TypeRegistry) -> Result<i8, DecodeError> {
        match raw {
            [b] => Ok(*b as i8),
            [] => Ok(0),
            _ => Err(DecodeError::invalid("invalid \"char\" value")),
        }
    }
}

macro_rules! integer {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $oid:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl Codec for $name {
            type Value = $ty;

            fn oid(&self) -> Oid {
                $oid
            }

            fn encode(&self, value: &$ty, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
                match format {
                    PgFormat::Binary => buf.put_slice(&value.to_be_bytes()),
                    PgFormat::Text => buf.put_slice(itoa::Buffer::new().format(*value).as_bytes()),
                }
                Ok(())
            }

            fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<$ty, DecodeError> {
                match format {
                    PgFormat::Binary => fixed(raw).map(<$ty>::from_be_bytes),
                    PgFormat::Text => parse(raw),
                }
            }
        }
    };
}

integer!(
    /// `int2` as `i16`.
    Int2Codec, i16, INT2
);
integer!(
    /// `int4` as `i32`.
    Int4Codec, i32, INT4
);
integer!(
    /// `int8` as `i64`.
    Int8Codec, i64, INT8
);
integer!(
    /// `oid` as `u32`.
    OidCodec, u32, OID
);

macro_rules! float {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $oid:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl Codec for $name {
            type Value = $ty;

            fn oid(&self) -> Oid {
                $oid
            }

            fn encode(&self, value: &$ty, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
                match format {
                    PgFormat::Binary => buf.put_slice(&value.to_be_bytes()),
                    PgFormat::Text if value.is_nan() => buf.put_slice(b"NaN"),
                    PgFormat::Text if value.is_infinite() => match value.is_sign_positive() {
                        true => buf.put_slice(b"Infinity"),
                        false => buf.put_slice(b"-Infinity"),
                    },
                    PgFormat::Text => buf.put_slice(value.to_string().as_bytes()),
                }
                Ok(())
            }

            fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<$ty, DecodeError> {
                match (format, raw) {
                    (PgFormat::Binary, _) => fixed(raw).map(<$ty>::from_be_bytes),
                    (PgFormat::Text, b"NaN") => Ok(<$ty>::NAN),
                    (PgFormat::Text, b"Infinity") => Ok(<$ty>::INFINITY),
                    (PgFormat::Text, b"-Infinity") => Ok(<$ty>::NEG_INFINITY),
                    (PgFormat::Text, _) => parse(raw),
                }
            }
        }
    };
}

float!(
    /// `float4` as `f32`.
    Float4Codec, f32, FLOAT4
);
float!(
    /// `float8` as `f64`.
    Float8Codec, f64, FLOAT8
);

const TEXT_LIKE: &[Oid] = &[VARCHAR, BPCHAR, NAME, UNKNOWN];

/// `text` as `String`, also decodes `varchar`, `bpchar`, `name` and `unknown`.
///
/// Both formats carry the same utf8 bytes.
#[derive(Debug, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    type Value = String;

    fn oid(&self) -> Oid {
        TEXT
    }

    fn compatible(&self) -> &[Oid] {
        TEXT_LIKE
    }

    fn encode(&self, value: &String, _: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, raw: &[u8], _: PgFormat, _: &TypeRegistry) -> Result<String, DecodeError> {
        text(raw).map(ToOwned::to_owned)
    }
}

/// Encoder for string literals bound as parameters.
#[derive(Debug, Clone, Copy)]
pub struct StrCodec;

impl Codec for StrCodec {
    type Value = &'static str;

    fn oid(&self) -> Oid {
        TEXT
    }

    fn compatible(&self) -> &[Oid] {
        TEXT_LIKE
    }

    fn encode(&self, value: &&'static str, _: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, _: &[u8], _: PgFormat, _: &TypeRegistry) -> Result<&'static str, DecodeError> {
        Err(DecodeError::invalid("borrowed strings cannot be decoded, use `String`"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytea_hex() {
        let registry = TypeRegistry::empty();
        let mut buf = BytesMut::new();
        ByteaCodec.encode(&vec![0xde, 0xad, 0x01], PgFormat::Text, &registry, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\\xdead01");
        let value = ByteaCodec.decode(b"\\xDEAD01", PgFormat::Text, &registry).unwrap();
        assert_eq!(value, [0xde, 0xad, 0x01]);
        assert!(ByteaCodec.decode(b"\\xabc", PgFormat::Text, &registry).is_err());
    }

    #[test]
    fn integer_length() {
        let registry = TypeRegistry::empty();
        assert!(Int4Codec.decode(&[0, 0, 1], PgFormat::Binary, &registry).is_err());
        assert_eq!(Int8Codec.decode(b"-42", PgFormat::Text, &registry).unwrap(), -42);
        assert!(Int2Codec.decode(b"70000", PgFormat::Text, &registry).is_err());
    }

    #[test]
    fn float_special() {
        let registry = TypeRegistry::empty();
        let mut buf = BytesMut::new();
        Float8Codec.encode(&f64::NEG_INFINITY, PgFormat::Text, &registry, &mut buf).unwrap();
        assert_eq!(&buf[..], b"-Infinity");
        assert!(Float4Codec.decode(b"NaN", PgFormat::Text, &registry).unwrap().is_nan());
    }
}
