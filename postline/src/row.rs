//! Postgres row operation.
//!
//! - [`Row`]
//! - [`FromRow`]
//! - [`Index`]
use bytes::Bytes;
use std::{any::Any, fmt, sync::Arc};

use crate::{
    ext::FmtExt,
    postgres::{ColumnDescription, Oid},
    types::{DecodeError, TypeRegistry},
};

/// Postgres row.
///
/// Values are kept as received and decoded on access by the registry of the
/// connection that produced the row.
#[derive(Clone)]
pub struct Row {
    columns: Arc<[ColumnDescription]>,
    values: Vec<Option<Bytes>>,
    registry: Arc<TypeRegistry>,
}

impl Row {
    pub(crate) fn new(
        columns: Arc<[ColumnDescription]>,
        values: Vec<Option<Bytes>>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        Self { columns, values, registry }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    /// Raw bytes of a column, [`None`] if it is `NULL`.
    pub fn raw<I: Index>(&self, idx: I) -> Result<Option<&[u8]>, DecodeError> {
        let nth = idx.position(&self.columns)?;
        let value = self.values.get(nth).ok_or(DecodeError::IndexOutOfBounds(nth))?;
        Ok(value.as_deref())
    }

    /// Try get and decode column.
    ///
    /// `T` is the value type of the decoder registered for the column type,
    /// or its `Option` to accept `NULL`.
    pub fn try_get<I: Index, T: Any>(&self, idx: I) -> Result<T, DecodeError> {
        let nth = idx.position(&self.columns)?;
        let column = self.columns.get(nth).ok_or(DecodeError::IndexOutOfBounds(nth))?;
        let value = self.values.get(nth).ok_or(DecodeError::IndexOutOfBounds(nth))?;
        self.registry.decode(column.type_oid, column.format, value.as_deref())
    }

    /// Type oid of a column.
    pub fn oid<I: Index>(&self, idx: I) -> Result<Oid, DecodeError> {
        let nth = idx.position(&self.columns)?;
        Ok(self.columns[nth].type_oid)
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (column, value) in self.columns.iter().zip(&self.values) {
            dbg.key(&column.name);
            match value {
                None => dbg.value(&format_args!("NULL")),
                Some(value) => dbg.value(&format_args!("{}", value.lossy())),
            };
        }
        dbg.finish()
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Any),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get::<usize, $t>($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the nth column.
    fn position(self, columns: &[ColumnDescription]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, columns: &[ColumnDescription]) -> Result<usize, DecodeError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, columns: &[ColumnDescription]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|column| column.name == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(self.into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::{PgFormat, pg_type};

    fn column(name: &'static str, type_oid: Oid, format: PgFormat) -> ColumnDescription {
        ColumnDescription {
            name: name.into(),
            table_oid: 0,
            attribute: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format,
        }
    }

    fn row() -> Row {
        let columns: Arc<[ColumnDescription]> = Arc::new([
            column("id", pg_type::INT4, PgFormat::Binary),
            column("name", pg_type::TEXT, PgFormat::Text),
            column("note", pg_type::TEXT, PgFormat::Text),
        ]);
        let values = vec![
            Some(Bytes::from_static(&[0, 0, 0, 9])),
            Some(Bytes::from_static(b"nine")),
            None,
        ];
        Row::new(columns, values, Arc::new(TypeRegistry::new()))
    }

    #[test]
    fn get_by_index_and_name() {
        let row = row();
        assert_eq!(row.try_get::<_, i32>(0usize).unwrap(), 9);
        assert_eq!(row.try_get::<_, String>("name").unwrap(), "nine");
        assert_eq!(row.try_get::<_, Option<String>>("note").unwrap(), None);
        assert!(matches!(row.try_get::<_, String>("note"), Err(DecodeError::Null)));
        assert!(matches!(row.try_get::<_, i32>("nope"), Err(DecodeError::ColumnNotFound(_))));
        assert!(matches!(row.try_get::<_, i32>(3usize), Err(DecodeError::IndexOutOfBounds(3))));
    }

    #[test]
    fn from_row_tuple() {
        let (id, name, note) = row().decode::<(i32, String, Option<String>)>().unwrap();
        assert_eq!((id, name.as_str(), note), (9, "nine", None));
        let debug = format!("{:?}", row());
        assert!(debug.contains(r"\x00\x00\x00\x09"), "{debug}");
        assert!(debug.contains("NULL"), "{debug}");
    }
}
