//! One dimensional arrays of any element codec.
use bytes::{BufMut, BytesMut};

use super::{Codec, DecodeError, EncodeError, TypeRegistry, text};
use crate::{
    ext::BytesExt as _,
    postgres::{Oid, PgFormat},
};

/// Array codec wrapping the element codec `C`, values are `Vec<C::Value>`.
///
/// NULL elements are rejected, [`NullableArrayCodec`] decodes them as `None`.
/// Multidimensional arrays are flattened on decode.
#[derive(Debug, Clone)]
pub struct ArrayCodec<C> {
    oid: Oid,
    compatible: Vec<Oid>,
    element: C,
}

impl<C: Codec> ArrayCodec<C> {
    pub fn new(oid: Oid, element: C) -> Self {
        Self { oid, compatible: vec![], element }
    }

    /// Also decode arrays of the given oids.
    pub fn with_compatible(mut self, oids: &[Oid]) -> Self {
        self.compatible.extend_from_slice(oids);
        self
    }

    fn encode_binary<'a, I>(&self, items: I, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError>
    where
        I: ExactSizeIterator<Item = Option<&'a C::Value>> + Clone,
    {
        let len = i32::try_from(items.len()).map_err(|_| EncodeError::Invalid("array too large".into()))?;
        let has_null = items.clone().any(|item| item.is_none());
        buf.put_i32(if len == 0 { 0 } else { 1 });
        buf.put_i32(has_null.into());
        buf.put_u32(self.element.oid());
        if len == 0 {
            return Ok(());
        }
        buf.put_i32(len);
        // lower bound
        buf.put_i32(1);
        for item in items {
            let Some(item) = item else {
                buf.put_i32(-1);
                continue;
            };
            let offset = buf.len();
            buf.put_i32(0);
            self.element.encode(item, PgFormat::Binary, registry, buf)?;
            let len = (buf.len() - offset - 4) as i32;
            buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }

    fn encode_text<'a, I>(&self, items: I, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError>
    where
        I: Iterator<Item = Option<&'a C::Value>>,
    {
        let mut item_buf = BytesMut::new();
        buf.put_u8(b'{');
        for (i, item) in items.enumerate() {
            if i != 0 {
                buf.put_u8(b',');
            }
            let Some(item) = item else {
                buf.put_slice(b"NULL");
                continue;
            };
            item_buf.clear();
            self.element.encode(item, PgFormat::Text, registry, &mut item_buf)?;
            put_array_item(&item_buf, buf);
        }
        buf.put_u8(b'}');
        Ok(())
    }

    fn decode_binary(&self, raw: &[u8], registry: &TypeRegistry) -> Result<Vec<Option<C::Value>>, DecodeError> {
        let mut raw = bytes::Bytes::copy_from_slice(raw);
        let malformed = |_| DecodeError::invalid("malformed binary array");
        let ndim = raw.try_i32().map_err(malformed)?;
        let _has_null = raw.try_i32().map_err(malformed)?;
        let _element_oid = raw.try_u32().map_err(malformed)?;

        let mut total = 1usize;
        for _ in 0..ndim.max(0) {
            let len = raw.try_i32().map_err(malformed)?;
            let _lower_bound = raw.try_i32().map_err(malformed)?;
            total = total.saturating_mul(len.max(0) as usize);
        }
        if ndim == 0 {
            return Ok(vec![]);
        }

        let mut values = Vec::with_capacity(total.min(1024));
        for _ in 0..total {
            let len = raw.try_i32().map_err(malformed)?;
            if len < 0 {
                values.push(None);
                continue;
            }
            let item = raw.try_split(len as usize).map_err(malformed)?;
            values.push(Some(self.element.decode(&item, PgFormat::Binary, registry)?));
        }
        Ok(values)
    }

    fn decode_text(&self, raw: &[u8], registry: &TypeRegistry) -> Result<Vec<Option<C::Value>>, DecodeError> {
        parse_array_text(text(raw)?)?
            .into_iter()
            .map(|item| {
                item.map(|item| self.element.decode(item.as_bytes(), PgFormat::Text, registry))
                    .transpose()
            })
            .collect()
    }
}

impl<C: Codec> Codec for ArrayCodec<C> {
    type Value = Vec<C::Value>;

    fn oid(&self) -> Oid {
        self.oid
    }

    fn compatible(&self) -> &[Oid] {
        &self.compatible
    }

    fn encode(&self, value: &Self::Value, format: PgFormat, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => self.encode_binary(value.iter().map(Some), registry, buf),
            PgFormat::Text => self.encode_text(value.iter().map(Some), registry, buf),
        }
    }

    fn decode(&self, raw: &[u8], format: PgFormat, registry: &TypeRegistry) -> Result<Self::Value, DecodeError> {
        let values = match format {
            PgFormat::Binary => self.decode_binary(raw, registry)?,
            PgFormat::Text => self.decode_text(raw, registry)?,
        };
        values.into_iter().map(|item| item.ok_or(DecodeError::Null)).collect()
    }
}

/// Array codec with NULL elements, values are `Vec<Option<C::Value>>`.
///
/// Registered next to every [`ArrayCodec`] by
/// [`register_array`][TypeRegistry::register_array], and picked when a
/// `Vec<Option<_>>` is requested.
#[derive(Debug, Clone)]
pub struct NullableArrayCodec<C>(ArrayCodec<C>);

impl<C: Codec> NullableArrayCodec<C> {
    pub fn new(array: ArrayCodec<C>) -> Self {
        Self(array)
    }
}

impl<C: Codec> Codec for NullableArrayCodec<C> {
    type Value = Vec<Option<C::Value>>;

    fn oid(&self) -> Oid {
        self.0.oid
    }

    fn compatible(&self) -> &[Oid] {
        &self.0.compatible
    }

    fn encode(&self, value: &Self::Value, format: PgFormat, registry: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => self.0.encode_binary(value.iter().map(Option::as_ref), registry, buf),
            PgFormat::Text => self.0.encode_text(value.iter().map(Option::as_ref), registry, buf),
        }
    }

    fn decode(&self, raw: &[u8], format: PgFormat, registry: &TypeRegistry) -> Result<Self::Value, DecodeError> {
        match format {
            PgFormat::Binary => self.0.decode_binary(raw, registry),
            PgFormat::Text => self.0.decode_text(raw, registry),
        }
    }
}

/// Write one array element, quoted when the text form needs it.
fn put_array_item(item: &[u8], buf: &mut BytesMut) {
    let needs_quote = item.is_empty()
        || item.eq_ignore_ascii_case(b"NULL")
        || item
            .iter()
            .any(|b| matches!(b, b'{' | b'}' | b',' | b'"' | b'\\') || b.is_ascii_whitespace());
    if !needs_quote {
        buf.put_slice(item);
        return;
    }
    buf.put_u8(b'"');
    for &b in item {
        if matches!(b, b'"' | b'\\') {
            buf.put_u8(b'\\');
        }
        buf.put_u8(b);
    }
    buf.put_u8(b'"');
}

/// Split the text form of an array into its elements, `None` is NULL.
pub(crate) fn parse_array_text(input: &str) -> Result<Vec<Option<String>>, DecodeError> {
    let malformed = || DecodeError::invalid(format!("malformed array literal: {input}"));

    // optional dimension decoration, `[1:3]={...}`
    let body = match input.starts_with('[') {
        true => input.split_once('=').ok_or_else(malformed)?.1,
        false => input,
    };

    let mut items = vec![];
    let mut chars = body.chars().peekable();
    let mut depth = 0usize;
    // whether the last token can be followed by a delimiter
    let mut after_item = false;

    while let Some(ch) = chars.next() {
        match ch {
            '{' if !after_item => depth += 1,
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(malformed)?;
                after_item = true;
            }
            ',' if after_item => after_item = false,
            '"' if !after_item => {
                let mut item = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => item.push(chars.next().ok_or_else(malformed)?),
                        Some('"') => break,
                        Some(ch) => item.push(ch),
                        None => return Err(malformed()),
                    }
                }
                items.push(Some(item));
                after_item = true;
            }
            ch if ch.is_whitespace() => {}
            _ if !after_item => {
                let mut item = String::from(ch);
                while let Some(&ch) = chars.peek() {
                    if matches!(ch, ',' | '}') {
                        break;
                    }
                    chars.next();
                    item.push(ch);
                }
                let item = item.trim_end();
                items.push(match item.eq_ignore_ascii_case("NULL") {
                    true => None,
                    false => Some(item.to_owned()),
                });
                after_item = true;
            }
            _ => return Err(malformed()),
        }
    }

    if depth != 0 {
        return Err(malformed());
    }
    Ok(items)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{Int4Codec, TextCodec};

    #[test]
    fn text_literal() {
        let items = parse_array_text(r#"{a,"b c",NULL,"NULL","q\"\\",""}"#).unwrap();
        assert_eq!(
            items,
            [
                Some("a".to_owned()),
                Some("b c".to_owned()),
                None,
                Some("NULL".to_owned()),
                Some("q\"\\".to_owned()),
                Some(String::new()),
            ]
        );
        assert!(parse_array_text("{}").unwrap().is_empty());
        assert_eq!(parse_array_text("[0:1]={1,2}").unwrap().len(), 2);
        assert_eq!(parse_array_text("{{1,2},{3,4}}").unwrap().len(), 4);
        assert!(parse_array_text("{1,2").is_err());
    }

    #[test]
    fn binary_layout() {
        let registry = TypeRegistry::empty();
        let codec = ArrayCodec::new(1007, Int4Codec);
        let mut buf = BytesMut::new();
        codec.encode(&vec![7], PgFormat::Binary, &registry, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 23, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 7]
        );

        buf.clear();
        codec.encode(&vec![], PgFormat::Binary, &registry, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 23]);
        assert_eq!(codec.decode(&buf, PgFormat::Binary, &registry).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn null_element() {
        let registry = TypeRegistry::empty();
        let codec = ArrayCodec::new(1009, TextCodec);
        assert!(matches!(
            codec.decode(b"{a,NULL}", PgFormat::Text, &registry),
            Err(DecodeError::Null)
        ));
    }

    #[test]
    fn nullable_elements() {
        let registry = TypeRegistry::empty();
        let codec = NullableArrayCodec::new(ArrayCodec::new(1007, Int4Codec));
        let value = vec![Some(1), None, Some(3)];

        let mut buf = BytesMut::new();
        codec.encode(&value, PgFormat::Binary, &registry, &mut buf).unwrap();
        // has null flag
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(codec.decode(&buf, PgFormat::Binary, &registry).unwrap(), value);
        assert!(matches!(
            ArrayCodec::new(1007, Int4Codec).decode(&buf, PgFormat::Binary, &registry),
            Err(DecodeError::Null)
        ));

        buf.clear();
        codec.encode(&value, PgFormat::Text, &registry, &mut buf).unwrap();
        assert_eq!(&buf[..], b"{1,NULL,3}");
        assert_eq!(codec.decode(&buf, PgFormat::Text, &registry).unwrap(), value);
    }
}
