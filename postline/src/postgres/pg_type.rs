/// Postgres object id.
pub type Oid = u32;

macro_rules! oids {
    ($($(#[$doc:meta])* $name:ident = $oid:literal;)*) => {
        $(
            $(#[$doc])*
            pub const $name: Oid = $oid;
        )*
    };
}

oids! {
    /// Unspecified, let the server infer.
    UNSPECIFIED = 0;
    BOOL = 16;
    BYTEA = 17;
    /// Single byte internal `"char"`.
    CHAR = 18;
    NAME = 19;
    INT8 = 20;
    INT2 = 21;
    INT4 = 23;
    TEXT = 25;
    OID = 26;
    JSON = 114;
    FLOAT4 = 700;
    FLOAT8 = 701;
    UNKNOWN = 705;
    BPCHAR = 1042;
    VARCHAR = 1043;
    DATE = 1082;
    TIMESTAMP = 1114;
    TIMESTAMPTZ = 1184;
    JSONB = 3802;

    BOOL_ARRAY = 1000;
    BYTEA_ARRAY = 1001;
    CHAR_ARRAY = 1002;
    INT2_ARRAY = 1005;
    INT4_ARRAY = 1007;
    TEXT_ARRAY = 1009;
    VARCHAR_ARRAY = 1015;
    INT8_ARRAY = 1016;
    FLOAT4_ARRAY = 1021;
    FLOAT8_ARRAY = 1022;
    OID_ARRAY = 1028;
    DATE_ARRAY = 1182;
    TIMESTAMP_ARRAY = 1115;
    TIMESTAMPTZ_ARRAY = 1185;
    JSON_ARRAY = 199;
    JSONB_ARRAY = 3807;
}
