//! Value codec registry.
//!
//! A [`TypeRegistry`] maps a Rust type to exactly one encoder, dispatched on the
//! runtime [`TypeId`] of a bound parameter, and a server type oid to exactly
//! one decoder, dispatched on the oid in the column metadata. Every codec
//! handles both [`PgFormat`]s: binary is requested whenever a decoder is
//! registered, text is the fallback and what the simple query protocol returns.
//!
//! Each [`Connection`][crate::Connection] owns an `Arc<TypeRegistry>`, which may
//! be shared between connections or built per test.
//!
//! Registering a type also registers its `Option`, which encodes `None` as NULL
//! and decodes NULL as `None`.
use bytes::{BufMut, BytesMut};
use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use crate::{
    common::log_warn,
    postgres::{Oid, PgFormat, pg_type},
};

mod array;
mod builtin;
mod composite;
mod enums;
#[cfg(feature = "json")]
mod json;
#[cfg(feature = "time")]
mod datetime;

pub use array::{ArrayCodec, NullableArrayCodec};
pub use builtin::{
    BoolCodec, ByteaCodec, CharCodec, Float4Codec, Float8Codec, Int2Codec, Int4Codec, Int8Codec,
    OidCodec, StrCodec, TextCodec,
};
pub use composite::{CompositeCodec, PgComposite, Record};
pub use enums::{EnumCodec, PgEnum};
#[cfg(feature = "json")]
pub use json::JsonCodec;
#[cfg(feature = "time")]
pub use datetime::{DateCodec, TimestampCodec, TimestamptzCodec};

/// A bound parameter value.
pub type Param<'a> = &'a (dyn Any + Send + Sync);

/// Wire codec for one Rust type and one server type.
pub trait Codec: Send + Sync + 'static {
    /// The Rust type produced and consumed.
    type Value: Any + Send + Sync;

    /// The server type this codec writes.
    fn oid(&self) -> Oid;

    /// Other server types with the same wire representation, decoded by this
    /// codec and accepted as binary parameters.
    fn compatible(&self) -> &[Oid] {
        &[]
    }

    /// Write `value` without the length prefix.
    fn encode(
        &self,
        value: &Self::Value,
        format: PgFormat,
        registry: &TypeRegistry,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError>;

    fn decode(
        &self,
        raw: &[u8],
        format: PgFormat,
        registry: &TypeRegistry,
    ) -> Result<Self::Value, DecodeError>;
}

/// Whether an encoded value is SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsNull {
    Yes,
    No,
}

type BoxValue = Box<dyn Any + Send + Sync>;

/// [`Codec`] with the value type erased, stored in the registry.
trait ErasedCodec: Send + Sync {
    fn oid(&self) -> Oid;

    fn accepts(&self, oid: Oid) -> bool;

    /// `value` is either `C::Value` or `Option<C::Value>`.
    fn encode_any(
        &self,
        value: &dyn Any,
        format: PgFormat,
        registry: &TypeRegistry,
        buf: &mut BytesMut,
    ) -> Result<IsNull, EncodeError>;

    fn decode_any(&self, raw: &[u8], format: PgFormat, registry: &TypeRegistry) -> Result<BoxValue, DecodeError>;

    /// Turn a decoded `C::Value` into `Option<C::Value>`.
    fn wrap_some(&self, value: BoxValue) -> BoxValue;

    /// `None::<C::Value>`.
    fn none(&self) -> BoxValue;

    /// Whether decoded values are `type_id`, directly or as `Option`.
    fn produces(&self, type_id: TypeId) -> bool;
}

impl<C: Codec> ErasedCodec for C {
    fn oid(&self) -> Oid {
        Codec::oid(self)
    }

    fn accepts(&self, oid: Oid) -> bool {
        Codec::oid(self) == oid || self.compatible().contains(&oid)
    }

    fn encode_any(
        &self,
        value: &dyn Any,
        format: PgFormat,
        registry: &TypeRegistry,
        buf: &mut BytesMut,
    ) -> Result<IsNull, EncodeError> {
        if let Some(value) = value.downcast_ref::<C::Value>() {
            self.encode(value, format, registry, buf)?;
            return Ok(IsNull::No);
        }
        match value.downcast_ref::<Option<C::Value>>() {
            Some(Some(value)) => self.encode(value, format, registry, buf).map(|_| IsNull::No),
            Some(None) => Ok(IsNull::Yes),
            None => Err(EncodeError::TypeMismatch { expected: type_name::<C::Value>() }),
        }
    }

    fn decode_any(&self, raw: &[u8], format: PgFormat, registry: &TypeRegistry) -> Result<BoxValue, DecodeError> {
        Ok(Box::new(self.decode(raw, format, registry)?))
    }

    fn wrap_some(&self, value: BoxValue) -> BoxValue {
        match value.downcast::<C::Value>() {
            Ok(value) => Box::new(Some(*value)),
            Err(value) => value,
        }
    }

    fn none(&self) -> BoxValue {
        Box::new(None::<C::Value>)
    }

    fn produces(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<C::Value>() || type_id == TypeId::of::<Option<C::Value>>()
    }
}

fn codec_oids<C: Codec>(codec: &C) -> Vec<Oid> {
    std::iter::once(Codec::oid(codec)).chain(codec.compatible().iter().copied()).collect()
}

#[derive(Default)]
struct Tables {
    encoders: HashMap<TypeId, Arc<dyn ErasedCodec>>,
    decoders: HashMap<Oid, Arc<dyn ErasedCodec>>,
    /// Second decoder of an oid, used when the requested type is its value.
    alternates: HashMap<Oid, Arc<dyn ErasedCodec>>,
}

impl Tables {
    fn insert_encoder<C: Codec>(&mut self, codec: Arc<dyn ErasedCodec>) {
        for type_id in [TypeId::of::<C::Value>(), TypeId::of::<Option<C::Value>>()] {
            if self.encoders.insert(type_id, codec.clone()).is_some() {
                log_warn!("encoder for `{}` overridden", type_name::<C::Value>());
            }
        }
    }

    fn insert_decoder(&mut self, codec: Arc<dyn ErasedCodec>, oids: impl IntoIterator<Item = Oid>) {
        for oid in oids {
            if self.decoders.insert(oid, codec.clone()).is_some() {
                log_warn!("decoder for oid {oid} overridden");
            }
        }
    }

    fn insert<C: Codec>(&mut self, codec: C) {
        let oids = codec_oids(&codec);
        let codec: Arc<dyn ErasedCodec> = Arc::new(codec);
        self.insert_encoder::<C>(codec.clone());
        self.insert_decoder(codec, oids);
    }

    fn insert_array<C: Codec + Clone>(&mut self, array: ArrayCodec<C>) {
        let nullable = NullableArrayCodec::new(array.clone());
        self.insert(array);

        let oids = codec_oids(&nullable);
        let nullable: Arc<dyn ErasedCodec> = Arc::new(nullable);
        self.insert_encoder::<NullableArrayCodec<C>>(nullable.clone());
        for oid in oids {
            self.alternates.insert(oid, nullable.clone());
        }
    }
}

/// Runtime extensible table of value codecs.
///
/// Re-registering a type or oid overrides the previous codec with a warning,
/// built-in codecs included.
pub struct TypeRegistry {
    tables: RwLock<Tables>,
    text: Arc<dyn ErasedCodec>,
}

impl TypeRegistry {
    /// Registry with the built-in codecs.
    pub fn new() -> Self {
        let me = Self::empty();
        builtin::install(&me);
        me
    }

    /// Registry without any codec, text columns still decode as [`String`].
    pub fn empty() -> Self {
        Self { tables: RwLock::default(), text: Arc::new(TextCodec) }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        // tables are replaced entry by entry, a poisoned lock is still consistent
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `codec` as encoder of its value type and decoder of its oids.
    pub fn register<C: Codec>(&self, codec: C) {
        self.write().insert(codec);
    }

    /// Register `codec` and its array codec under one lock.
    pub fn register_with_array<C: Codec + Clone>(&self, codec: C, array_oid: Oid) {
        let array = ArrayCodec::new(array_oid, codec.clone());
        let mut tables = self.write();
        tables.insert(codec);
        tables.insert_array(array);
    }

    /// Register `array`, and a [`NullableArrayCodec`] for `Vec<Option<_>>`.
    pub fn register_array<C: Codec + Clone>(&self, array: ArrayCodec<C>) {
        self.write().insert_array(array);
    }

    /// Register `codec` as encoder only.
    pub fn register_encoder<C: Codec>(&self, codec: C) {
        self.write().insert_encoder::<C>(Arc::new(codec));
    }

    /// Register `codec` as decoder of its oids only.
    pub fn register_decoder<C: Codec>(&self, codec: C) {
        let oids = codec_oids(&codec);
        self.write().insert_decoder(Arc::new(codec), oids);
    }

    /// Returns `true` if a decoder for `oid` is registered.
    pub fn has_decoder(&self, oid: Oid) -> bool {
        self.read().decoders.contains_key(&oid)
    }

    fn encoder(&self, type_id: TypeId) -> Option<Arc<dyn ErasedCodec>> {
        self.read().encoders.get(&type_id).cloned()
    }

    fn decoder(&self, oid: Oid, format: PgFormat) -> Result<Arc<dyn ErasedCodec>, DecodeError> {
        match self.read().decoders.get(&oid) {
            Some(codec) => Ok(codec.clone()),
            None if format == PgFormat::Text => Ok(self.text.clone()),
            None => Err(DecodeError::NoCodec { oid }),
        }
    }

    /// The decoder of `oid` producing `T`, preferring the alternate decoder.
    fn decoder_of<T: Any>(&self, oid: Oid, format: PgFormat) -> Result<Arc<dyn ErasedCodec>, DecodeError> {
        let alternate = self
            .read()
            .alternates
            .get(&oid)
            .filter(|codec| codec.produces(TypeId::of::<T>()))
            .cloned();
        match alternate {
            Some(codec) => Ok(codec),
            None => self.decoder(oid, format),
        }
    }

    /// The server type `value` is encoded as, if an encoder is registered.
    pub fn oid_of(&self, value: Param<'_>) -> Option<Oid> {
        self.encoder((*value).type_id()).map(|codec| codec.oid())
    }

    /// Encode one value with its `Int32` length prefix, -1 for NULL.
    ///
    /// Binary is used when `target` is accepted by the encoder, otherwise the
    /// value is sent as text for the server to convert.
    pub fn encode_param(&self, value: Param<'_>, target: Oid, buf: &mut BytesMut) -> Result<PgFormat, EncodeError> {
        let Some(codec) = self.encoder((*value).type_id()) else {
            return Err(EncodeError::NoCodec);
        };
        let format = match target == pg_type::UNSPECIFIED || codec.accepts(target) {
            true => PgFormat::Binary,
            false => PgFormat::Text,
        };
        self.encode_with(&*codec, value, format, buf)?;
        Ok(format)
    }

    /// Encode `value` in `format` with its length prefix, returns the oid of the encoder.
    fn encode_value(&self, value: Param<'_>, format: PgFormat, buf: &mut BytesMut) -> Result<Oid, EncodeError> {
        let Some(codec) = self.encoder((*value).type_id()) else {
            return Err(EncodeError::NoCodec);
        };
        self.encode_with(&*codec, value, format, buf)?;
        Ok(codec.oid())
    }

    fn encode_with(
        &self,
        codec: &dyn ErasedCodec,
        value: Param<'_>,
        format: PgFormat,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let offset = buf.len();
        buf.put_i32(0);
        match codec.encode_any(value, format, self, buf)? {
            IsNull::Yes => {
                buf.truncate(offset);
                buf.put_i32(-1);
            }
            IsNull::No => {
                let len = i32::try_from(buf.len() - offset - 4)
                    .map_err(|_| EncodeError::Invalid("value too large".into()))?;
                buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Decode into the codec's own value type.
    pub fn decode_boxed(&self, oid: Oid, format: PgFormat, raw: &[u8]) -> Result<BoxValue, DecodeError> {
        self.decoder(oid, format)?.decode_any(raw, format, self)
    }

    /// Decode a value of server type `oid`, `None` is SQL NULL.
    ///
    /// `T` is the codec's value type or its `Option`.
    pub fn decode<T: Any>(&self, oid: Oid, format: PgFormat, raw: Option<&[u8]>) -> Result<T, DecodeError> {
        let codec = self.decoder_of::<T>(oid, format)?;
        let value = match raw {
            Some(raw) => match codec.decode_any(raw, format, self)?.downcast::<T>() {
                Ok(value) => return Ok(*value),
                Err(value) => codec.wrap_some(value),
            },
            None => codec.none(),
        };
        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) if raw.is_none() => Err(DecodeError::Null),
            Err(_) => Err(DecodeError::TypeMismatch { oid, requested: type_name::<T>() }),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.read();
        f.debug_struct("TypeRegistry")
            .field("encoders", &tables.encoders.len())
            .field("decoders", &tables.decoders.len())
            .finish()
    }
}

/// Failure turning a Rust value into wire bytes.
pub enum EncodeError {
    /// No encoder registered for the parameter's type.
    NoCodec,
    TypeMismatch { expected: &'static str },
    Invalid(String),
}

impl std::error::Error for EncodeError { }

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to encode value, ")?;
        match self {
            Self::NoCodec => f.write_str("no codec registered for the parameter type"),
            Self::TypeMismatch { expected } => write!(f, "expected `{expected}`"),
            Self::Invalid(reason) => f.write_str(reason),
        }
    }
}

impl fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Failure turning wire bytes into a Rust value.
pub enum DecodeError {
    /// No decoder registered for a binary value of this oid.
    NoCodec { oid: Oid },
    /// The decoder for `oid` produces a different Rust type.
    TypeMismatch { oid: Oid, requested: &'static str },
    /// NULL requested as a non `Option` type.
    Null,
    ColumnNotFound(String),
    IndexOutOfBounds(usize),
    /// The bytes are not a valid value of the type.
    Invalid(String),
    Utf8(std::str::Utf8Error),
    #[cfg(feature = "json")]
    Json(serde_json::Error),
}

impl DecodeError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::NoCodec { oid } => write!(f, "no codec registered for oid {oid}"),
            Self::TypeMismatch { oid, requested } => {
                write!(f, "oid {oid} does not decode into `{requested}`")
            }
            Self::Null => f.write_str("value is NULL"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name}"),
            Self::IndexOutOfBounds(idx) => write!(f, "index out of bounds: {idx}"),
            Self::Invalid(reason) => f.write_str(reason),
            Self::Utf8(e) => write!(f, "{e}"),
            #[cfg(feature = "json")]
            Self::Json(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Read raw bytes as utf8.
pub(crate) fn text(raw: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(raw).map_err(DecodeError::from)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::pg_type::*;

    fn roundtrip<T>(registry: &TypeRegistry, value: T, oid: Oid)
    where
        T: Any + Send + Sync + PartialEq + fmt::Debug,
    {
        for format in [PgFormat::Binary, PgFormat::Text] {
            let mut buf = BytesMut::new();
            let codec = registry.encoder(TypeId::of::<T>()).unwrap();
            registry.encode_with(&*codec, &value, format, &mut buf).unwrap();
            let len = i32::from_be_bytes(buf[..4].try_into().unwrap());
            assert_eq!(len as usize, buf.len() - 4);
            let decoded: T = registry.decode(oid, format, Some(&buf[4..])).unwrap();
            assert_eq!(decoded, value, "{format:?}");
        }
    }

    #[test]
    fn builtin_roundtrip() {
        let registry = TypeRegistry::new();
        roundtrip(&registry, true, BOOL);
        roundtrip(&registry, -7i16, INT2);
        roundtrip(&registry, i32::MIN, INT4);
        roundtrip(&registry, 1i64 << 40, INT8);
        roundtrip(&registry, 1.5f32, FLOAT4);
        roundtrip(&registry, -0.125f64, FLOAT8);
        roundtrip(&registry, f64::INFINITY, FLOAT8);
        roundtrip(&registry, 4242u32, OID);
        roundtrip(&registry, b'x' as i8, CHAR);
        roundtrip(&registry, "héllo, \"world\"".to_owned(), TEXT);
        roundtrip(&registry, vec![0u8, 1, 254, 255], BYTEA);
        roundtrip(&registry, vec![1i32, -2, 3], INT4_ARRAY);
        roundtrip(&registry, Vec::<i64>::new(), INT8_ARRAY);
        roundtrip(
            &registry,
            vec!["a".to_owned(), "b c".to_owned(), "{\"}".to_owned(), "NULL".to_owned(), String::new()],
            TEXT_ARRAY,
        );
        roundtrip(&registry, vec![vec![1u8, 2], vec![]], BYTEA_ARRAY);
    }

    #[test]
    fn option_null() {
        let registry = TypeRegistry::new();
        let mut buf = BytesMut::new();
        let value: Option<i32> = None;
        let format = registry.encode_param(&value, INT4, &mut buf).unwrap();
        assert_eq!(format, PgFormat::Binary);
        assert_eq!(&buf[..], &(-1i32).to_be_bytes());

        let decoded: Option<i32> = registry.decode(INT4, PgFormat::Binary, None).unwrap();
        assert_eq!(decoded, None);
        let decoded: Option<i32> = registry.decode(INT4, PgFormat::Binary, Some(&7i32.to_be_bytes())).unwrap();
        assert_eq!(decoded, Some(7));
        assert!(matches!(registry.decode::<i32>(INT4, PgFormat::Binary, None), Err(DecodeError::Null)));
    }

    #[test]
    fn array_with_null_elements() {
        let registry = TypeRegistry::new();
        let value = vec![Some(1i32), None];
        let mut buf = BytesMut::new();
        assert_eq!(registry.encode_param(&value, INT4_ARRAY, &mut buf).unwrap(), PgFormat::Binary);

        let decoded: Vec<Option<i32>> = registry.decode(INT4_ARRAY, PgFormat::Binary, Some(&buf[4..])).unwrap();
        assert_eq!(decoded, value);
        assert!(matches!(
            registry.decode::<Vec<i32>>(INT4_ARRAY, PgFormat::Binary, Some(&buf[4..])),
            Err(DecodeError::Null)
        ));

        let decoded: Vec<Option<String>> = registry.decode(TEXT_ARRAY, PgFormat::Text, Some(b"{a,NULL}")).unwrap();
        assert_eq!(decoded, [Some("a".to_owned()), None]);
        let decoded: Option<Vec<Option<String>>> = registry.decode(TEXT_ARRAY, PgFormat::Text, None).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn param_format_follows_target() {
        let registry = TypeRegistry::new();
        let mut buf = BytesMut::new();
        // int4 value bound to an int8 parameter is sent as text
        assert_eq!(registry.encode_param(&5i32, INT8, &mut buf).unwrap(), PgFormat::Text);
        assert_eq!(&buf[4..], b"5");

        buf.clear();
        assert_eq!(registry.encode_param(&"abc", VARCHAR, &mut buf).unwrap(), PgFormat::Binary);
        assert_eq!(&buf[4..], b"abc");

        buf.clear();
        assert!(matches!(registry.encode_param(&(), INT4, &mut buf), Err(EncodeError::NoCodec)));
    }

    #[test]
    fn text_fallback() {
        let registry = TypeRegistry::empty();
        // numeric has no codec, its text form still decodes
        let value: String = registry.decode(1700, PgFormat::Text, Some(b"12.50")).unwrap();
        assert_eq!(value, "12.50");
        assert!(matches!(
            registry.decode::<String>(1700, PgFormat::Binary, Some(b"\0")),
            Err(DecodeError::NoCodec { oid: 1700 })
        ));
    }

    #[test]
    fn compatible_oids() {
        let registry = TypeRegistry::new();
        let value: String = registry.decode(VARCHAR, PgFormat::Binary, Some(b"v")).unwrap();
        assert_eq!(value, "v");
        assert!(matches!(
            registry.decode::<i64>(TEXT, PgFormat::Binary, Some(b"v")),
            Err(DecodeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn override_codec() {
        struct Upper;

        impl Codec for Upper {
            type Value = String;

            fn oid(&self) -> Oid {
                TEXT
            }

            fn encode(&self, value: &String, _: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
                buf.put_slice(value.to_uppercase().as_bytes());
                Ok(())
            }

            fn decode(&self, raw: &[u8], _: PgFormat, _: &TypeRegistry) -> Result<String, DecodeError> {
                Ok(text(raw)?.to_uppercase())
            }
        }

        let registry = TypeRegistry::new();
        registry.register(Upper);
        let value: String = registry.decode(TEXT, PgFormat::Binary, Some(b"abc")).unwrap();
        assert_eq!(value, "ABC");
        // varchar keeps the built-in decoder
        let value: String = registry.decode(VARCHAR, PgFormat::Binary, Some(b"abc")).unwrap();
        assert_eq!(value, "abc");
    }
}
