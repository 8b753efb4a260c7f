//! Codec registration for user defined types, resolved from the catalog.
use std::fmt;

use crate::{
    Result,
    common::log_debug,
    error::UsageError,
    postgres::Oid,
    transport::PgTransport,
    types::{Codec, CompositeCodec, EnumCodec, Param, PgComposite, PgEnum},
};

use super::Connection;

const TYPE_BY_NAME: &str = "SELECT t.oid, t.typarray, t.typrelid, t.typtype::text \
    FROM pg_catalog.pg_type t WHERE t.oid = $1::text::regtype";

const TYPE_BY_OID: &str = "SELECT t.oid, t.typarray, t.typrelid, t.typtype::text \
    FROM pg_catalog.pg_type t WHERE t.oid = $1";

const ATTRIBUTES: &str = "SELECT a.atttypid FROM pg_catalog.pg_attribute a \
    WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped ORDER BY a.attnum";

/// `undefined_object`, raised by a `regtype` cast of an unknown name.
const UNDEFINED_OBJECT: &str = "42704";

/// How to find a type in `pg_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeLookup {
    /// Type name, optionally schema qualified, as accepted by `regtype`.
    Name(String),
    Oid(Oid),
}

impl From<&str> for TypeLookup {
    fn from(value: &str) -> Self {
        Self::Name(value.to_owned())
    }
}

impl From<String> for TypeLookup {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<Oid> for TypeLookup {
    fn from(value: Oid) -> Self {
        Self::Oid(value)
    }
}

impl fmt::Display for TypeLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Oid(oid) => write!(f, "oid {oid}"),
        }
    }
}

struct PgTypeRow {
    oid: Oid,
    array_oid: Oid,
    relid: Oid,
    kind: String,
}

impl<T: PgTransport> Connection<T> {
    /// Register the codec of enum `E` and of its array type.
    ///
    /// Both are installed together, replacing any earlier registration for
    /// the same oids.
    pub async fn register_enum<E: PgEnum>(&mut self, lookup: impl Into<TypeLookup>) -> Result<Oid> {
        let lookup = lookup.into();
        let pg_type = self.lookup_type(&lookup).await?;
        if pg_type.kind != "e" {
            return Err(UsageError::TypeNotFound(format!("{lookup} as enum")).into());
        }
        log_debug!("register enum {lookup}, oid {}", pg_type.oid);
        self.install(EnumCodec::<E>::new(pg_type.oid), pg_type.array_oid);
        Ok(pg_type.oid)
    }

    /// Register the codec of composite `C` and of its array type.
    ///
    /// Field types are read from `pg_attribute` in column order.
    pub async fn register_composite<C: PgComposite>(&mut self, lookup: impl Into<TypeLookup>) -> Result<Oid> {
        let lookup = lookup.into();
        let pg_type = self.lookup_type(&lookup).await?;
        if pg_type.kind != "c" {
            return Err(UsageError::TypeNotFound(format!("{lookup} as composite")).into());
        }
        let relid: Param = &pg_type.relid;
        let field_oids = self
            .execute(ATTRIBUTES, &[relid])
            .await?
            .into_rows()
            .into_iter()
            .map(|row| row.try_get::<usize, Oid>(0))
            .collect::<Result<Vec<_>, _>>()?;
        log_debug!("register composite {lookup}, oid {}, {} field(s)", pg_type.oid, field_oids.len());
        self.install(CompositeCodec::<C>::new(pg_type.oid, field_oids), pg_type.array_oid);
        Ok(pg_type.oid)
    }

    fn install<C: Codec + Clone>(&self, codec: C, array_oid: Oid) {
        match array_oid {
            0 => self.registry.register(codec),
            array_oid => self.registry.register_with_array(codec, array_oid),
        }
    }

    async fn lookup_type(&mut self, lookup: &TypeLookup) -> Result<PgTypeRow> {
        let result = match lookup {
            TypeLookup::Name(name) => {
                let name = name.clone();
                match self.execute(TYPE_BY_NAME, &[&name]).await {
                    Err(err) if err.code() == Some(UNDEFINED_OBJECT) => {
                        return Err(UsageError::TypeNotFound(name).into());
                    }
                    result => result?,
                }
            }
            TypeLookup::Oid(oid) => self.execute(TYPE_BY_OID, &[oid]).await?,
        };
        let Some(row) = result.rows().first() else {
            return Err(UsageError::TypeNotFound(lookup.to_string()).into());
        };
        Ok(PgTypeRow {
            oid: row.try_get(0usize)?,
            array_oid: row.try_get(1usize)?,
            relid: row.try_get(2usize)?,
            kind: row.try_get(3usize)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        connection::Config,
        postgres::{PgFormat, pg_type},
        testing::{self, Script, run},
    };

    #[derive(Debug, PartialEq)]
    enum Mood {
        Sad,
        Happy,
    }

    impl PgEnum for Mood {
        fn label(&self) -> &str {
            match self {
                Mood::Sad => "sad",
                Mood::Happy => "happy",
            }
        }

        fn from_label(label: &str) -> Option<Self> {
            match label {
                "sad" => Some(Mood::Sad),
                "happy" => Some(Mood::Happy),
                _ => None,
            }
        }
    }

    fn script_lookup(script: &Script, row: (Oid, Oid, Oid, &str)) {
        script
            .parse_complete()
            .params(&[pg_type::TEXT])
            .columns(
                &[
                    ("oid", pg_type::OID),
                    ("typarray", pg_type::OID),
                    ("typrelid", pg_type::OID),
                    ("typtype", pg_type::TEXT),
                ],
                PgFormat::Text,
            )
            .ready(b'I')
            .bind_complete()
            .row(&[
                Some(&row.0.to_be_bytes()),
                Some(&row.1.to_be_bytes()),
                Some(&row.2.to_be_bytes()),
                Some(row.3.as_bytes()),
            ])
            .complete("SELECT 1")
            .close_complete()
            .ready(b'I');
    }

    #[test]
    fn enum_by_name() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script_lookup(&script, (90001, 90002, 0, "e"));

        let oid = run(conn.register_enum::<Mood>("mood")).unwrap();
        assert_eq!(oid, 90001);

        let registry = conn.registry();
        assert!(registry.has_decoder(90001));
        assert!(registry.has_decoder(90002));
        assert_eq!(registry.oid_of(&Mood::Sad), Some(90001));
        assert_eq!(registry.decode::<Mood>(90001, PgFormat::Text, Some(b"happy")).unwrap(), Mood::Happy);
        assert_eq!(
            registry.decode::<Vec<Mood>>(90002, PgFormat::Text, Some(b"{sad,happy}")).unwrap(),
            [Mood::Sad, Mood::Happy],
        );
    }

    #[test]
    fn unknown_name() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script
            .parse_complete()
            .params(&[pg_type::TEXT])
            .no_data()
            .ready(b'I')
            .bind_complete()
            .error("ERROR", UNDEFINED_OBJECT, "type \"nope\" does not exist")
            .ready(b'I');

        let err = run(conn.register_enum::<Mood>("nope")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::TypeNotFound(name)) if name == "nope"));
        assert!(!conn.registry().has_decoder(90001));
    }

    #[test]
    fn not_an_enum() {
        let (mut conn, script, _) = testing::connect(Config::default());
        script_lookup(&script, (90003, 90004, 90005, "c"));

        let err = run(conn.register_enum::<Mood>("point3")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::TypeNotFound(_))));
        assert!(!conn.registry().has_decoder(90003));
    }
}
