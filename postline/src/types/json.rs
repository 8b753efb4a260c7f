use bytes::{BufMut, BytesMut};
use serde_json::Value;

use super::{Codec, DecodeError, EncodeError, TypeRegistry};
use crate::postgres::{Oid, PgFormat, pg_type};

const JSONB_VERSION: u8 = 1;

/// `json` and `jsonb` as [`serde_json::Value`].
///
/// Binary `jsonb` is the text form prefixed by a version byte.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    oid: Oid,
}

impl JsonCodec {
    pub fn json() -> Self {
        Self { oid: pg_type::JSON }
    }

    pub fn jsonb() -> Self {
        Self { oid: pg_type::JSONB }
    }

    fn versioned(&self, format: PgFormat) -> bool {
        self.oid == pg_type::JSONB && format == PgFormat::Binary
    }
}

impl Codec for JsonCodec {
    type Value = Value;

    fn oid(&self) -> Oid {
        self.oid
    }

    fn encode(&self, value: &Value, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if self.versioned(format) {
            buf.put_u8(JSONB_VERSION);
        }
        serde_json::to_writer(buf.writer(), value).map_err(|e| EncodeError::Invalid(e.to_string()))
    }

    fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<Value, DecodeError> {
        let raw = match (self.versioned(format), raw.split_first()) {
            (false, _) => raw,
            (true, Some((&JSONB_VERSION, rest))) => rest,
            (true, _) => return Err(DecodeError::invalid("unsupported jsonb version")),
        };
        serde_json::from_slice(raw).map_err(DecodeError::Json)
    }
}
