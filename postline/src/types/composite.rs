use bytes::{BufMut, BytesMut};
use std::{
    any::{Any, type_name},
    marker::PhantomData,
};

use super::{BoxValue, Codec, DecodeError, EncodeError, TypeRegistry, text};
use crate::{
    ext::BytesExt as _,
    postgres::{Oid, PgFormat, pg_type},
};

/// Rust type mapped to a server composite type, field by field in attribute order.
pub trait PgComposite: Sized + Send + Sync + 'static {
    /// Field values, `None` is NULL.
    ///
    /// Each value must have an encoder registered.
    fn fields(&self) -> Vec<Option<&(dyn Any + Send + Sync)>>;

    fn from_record(record: Record) -> Result<Self, DecodeError>;
}

/// Fields of a composite value, each decoded by the codec of its attribute type.
#[derive(Debug, Default)]
pub struct Record {
    fields: Vec<Option<BoxValue>>,
}

impl Record {
    pub fn new(fields: Vec<Option<BoxValue>>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Borrow field `idx`, `None` if it is NULL or not a `T`.
    pub fn get<T: Any>(&self, idx: usize) -> Option<&T> {
        self.fields.get(idx)?.as_ref()?.downcast_ref()
    }

    /// Take non NULL field `idx` out of the record.
    pub fn take<T: Any>(&mut self, idx: usize) -> Result<T, DecodeError> {
        self.take_opt(idx)?.ok_or(DecodeError::Null)
    }

    /// Take field `idx` out of the record, `None` if it is NULL.
    pub fn take_opt<T: Any>(&mut self, idx: usize) -> Result<Option<T>, DecodeError> {
        let slot = self.fields.get_mut(idx).ok_or(DecodeError::IndexOutOfBounds(idx))?;
        let Some(value) = slot.take() else {
            return Ok(None);
        };
        match value.downcast::<T>() {
            Ok(value) => Ok(Some(*value)),
            Err(value) => {
                *slot = Some(value);
                Err(DecodeError::invalid(format!("record field {idx} is not `{}`", type_name::<T>())))
            }
        }
    }
}

impl PgComposite for Record {
    fn fields(&self) -> Vec<Option<&(dyn Any + Send + Sync)>> {
        self.fields.iter().map(Option::as_deref).collect()
    }

    fn from_record(record: Record) -> Result<Self, DecodeError> {
        Ok(record)
    }
}

/// Codec for a composite type given its attribute types.
///
/// Attribute types are required for binary encoding, where the server checks
/// each field oid, and select the decoder of text fields.
pub struct CompositeCodec<T> {
    oid: Oid,
    field_oids: Vec<Oid>,
    _p: PhantomData<fn() -> T>,
}

impl<T> CompositeCodec<T> {
    pub fn new(oid: Oid, field_oids: Vec<Oid>) -> Self {
        Self { oid, field_oids, _p: PhantomData }
    }
}

impl<T> Clone for CompositeCodec<T> {
    fn clone(&self) -> Self {
        Self::new(self.oid, self.field_oids.clone())
    }
}

impl<T: PgComposite> CompositeCodec<T> {
    fn field_count(&self, fields: usize) -> Result<i32, EncodeError> {
        if !self.field_oids.is_empty() && self.field_oids.len() != fields {
            return Err(EncodeError::Invalid(format!(
                "composite expects {} fields, found {fields}",
                self.field_oids.len()
            )));
        }
        i32::try_from(fields).map_err(|_| EncodeError::Invalid("too many fields".into()))
    }

    fn encode_binary(&self, value: &T, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let fields = value.fields();
        buf.put_i32(self.field_count(fields.len())?);

        for (i, field) in fields.into_iter().enumerate() {
            let oid_offset = buf.len();
            buf.put_u32(0);
            let expected = self.field_oids.get(i).copied();
            let oid = match (field, expected) {
                (None, oid) => {
                    buf.put_i32(-1);
                    oid.unwrap_or(pg_type::UNSPECIFIED)
                }
                (Some(field), Some(oid)) => match registry.encode_param(field, oid, buf)? {
                    PgFormat::Binary => oid,
                    PgFormat::Text => {
                        return Err(EncodeError::Invalid(format!("field {i} does not encode as oid {oid}")));
                    }
                },
                (Some(field), None) => registry.encode_value(field, PgFormat::Binary, buf)?,
            };
            buf[oid_offset..oid_offset + 4].copy_from_slice(&oid.to_be_bytes());
        }
        Ok(())
    }

    fn encode_text(&self, value: &T, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let fields = value.fields();
        self.field_count(fields.len())?;

        let mut field_buf = BytesMut::new();
        buf.put_u8(b'(');
        for (i, field) in fields.into_iter().enumerate() {
            if i != 0 {
                buf.put_u8(b',');
            }
            let Some(field) = field else {
                continue;
            };
            field_buf.clear();
            registry.encode_value(field, PgFormat::Text, &mut field_buf)?;
            if field_buf[..4] != (-1i32).to_be_bytes() {
                put_record_field(&field_buf[4..], buf);
            }
        }
        buf.put_u8(b')');
        Ok(())
    }

    fn decode_binary(&self, raw: &[u8], registry: &TypeRegistry) -> Result<T, DecodeError> {
        let mut raw = bytes::Bytes::copy_from_slice(raw);
        let malformed = |_| DecodeError::invalid("malformed binary record");
        let len = raw.try_i32().map_err(malformed)?;

        let mut fields = Vec::with_capacity(len.clamp(0, 1024) as usize);
        for _ in 0..len {
            let oid = raw.try_u32().map_err(malformed)?;
            let len = raw.try_i32().map_err(malformed)?;
            if len < 0 {
                fields.push(None);
                continue;
            }
            let field = raw.try_split(len as usize).map_err(malformed)?;
            fields.push(Some(registry.decode_boxed(oid, PgFormat::Binary, &field)?));
        }
        T::from_record(Record::new(fields))
    }

    fn decode_text(&self, raw: &[u8], registry: &TypeRegistry) -> Result<T, DecodeError> {
        let fields = parse_record_text(text(raw)?)?
            .into_iter()
            .enumerate()
            .map(|(i, field)| {
                let oid = self.field_oids.get(i).copied().unwrap_or(pg_type::UNSPECIFIED);
                field
                    .map(|field| registry.decode_boxed(oid, PgFormat::Text, field.as_bytes()))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;
        T::from_record(Record::new(fields))
    }
}

impl<T: PgComposite> Codec for CompositeCodec<T> {
    type Value = T;

    fn oid(&self) -> Oid {
        self.oid
    }

    fn encode(&self, value: &T, format: PgFormat, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => self.encode_binary(value, registry, buf),
            PgFormat::Text => self.encode_text(value, registry, buf),
        }
    }

    fn decode(&self, raw: &[u8], format: PgFormat, registry: &TypeRegistry) -> Result<T, DecodeError> {
        match format {
            PgFormat::Binary => self.decode_binary(raw, registry),
            PgFormat::Text => self.decode_text(raw, registry),
        }
    }
}

fn put_record_field(field: &[u8], buf: &mut BytesMut) {
    let needs_quote = field.is_empty()
        || field
            .iter()
            .any(|b| matches!(b, b'(' | b')' | b',' | b'"' | b'\\') || b.is_ascii_whitespace());
    if !needs_quote {
        buf.put_slice(field);
        return;
    }
    buf.put_u8(b'"');
    for &b in field {
        if matches!(b, b'"' | b'\\') {
            buf.put_u8(b);
        }
        buf.put_u8(b);
    }
    buf.put_u8(b'"');
}

/// Split the text form of a record into its fields, `None` is NULL.
fn parse_record_text(input: &str) -> Result<Vec<Option<String>>, DecodeError> {
    let malformed = || DecodeError::invalid(format!("malformed record literal: {input}"));
    let body = input
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(malformed)?;

    let mut fields = vec![];
    let mut chars = body.chars().peekable();
    loop {
        let mut field = String::new();
        let mut quoted = false;
        while let Some(ch) = chars.next() {
            match ch {
                ',' => break,
                '"' => {
                    quoted = true;
                    loop {
                        match chars.next() {
                            Some('"') if chars.peek() == Some(&'"') => {
                                chars.next();
                                field.push('"');
                            }
                            Some('"') => break,
                            Some('\\') => field.push(chars.next().ok_or_else(malformed)?),
                            Some(ch) => field.push(ch),
                            None => return Err(malformed()),
                        }
                    }
                }
                '\\' => field.push(chars.next().ok_or_else(malformed)?),
                ch => field.push(ch),
            }
        }
        fields.push(match field.is_empty() && !quoted {
            true => None,
            false => Some(field),
        });
        if chars.peek().is_none() && !body.ends_with(',') {
            break;
        }
        if chars.peek().is_none() {
            // trailing NULL after the last comma
            fields.push(None);
            break;
        }
    }
    Ok(fields)
}
