use bytes::{BufMut, BytesMut};
use std::marker::PhantomData;

use super::{Codec, DecodeError, EncodeError, TypeRegistry, text};
use crate::postgres::{Oid, PgFormat};

/// Rust type mapped to a server enum type by label.
pub trait PgEnum: Sized + Send + Sync + 'static {
    fn label(&self) -> &str;

    fn from_label(label: &str) -> Option<Self>;
}

/// Codec for a user defined enum, both formats carry the label.
pub struct EnumCodec<E> {
    oid: Oid,
    _p: PhantomData<fn() -> E>,
}

impl<E> EnumCodec<E> {
    pub fn new(oid: Oid) -> Self {
        Self { oid, _p: PhantomData }
    }
}

impl<E> Clone for EnumCodec<E> {
    fn clone(&self) -> Self {
        Self::new(self.oid)
    }
}

impl<E: PgEnum> Codec for EnumCodec<E> {
    type Value = E;

    fn oid(&self) -> Oid {
        self.oid
    }

    fn encode(&self, value: &E, _: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_slice(value.label().as_bytes());
        Ok(())
    }

    fn decode(&self, raw: &[u8], _: PgFormat, _: &TypeRegistry) -> Result<E, DecodeError> {
        let label = text(raw)?;
        E::from_label(label).ok_or_else(|| DecodeError::invalid(format!("unknown enum label `{label}`")))
    }
}
