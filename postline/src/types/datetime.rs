use bytes::{BufMut, BytesMut};
use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset,
    format_description::{BorrowedFormatItem as I, Component as C, modifier},
};

use super::{Codec, DecodeError, EncodeError, TypeRegistry, text};
use crate::postgres::{Oid, PgFormat, pg_type};

/// 2000-01-01
const PG_EPOCH_JULIAN_DAY: i32 = 2_451_545;

const PG_EPOCH: PrimitiveDateTime = {
    let date = match Date::from_julian_day(PG_EPOCH_JULIAN_DAY) {
        Ok(ok) => ok,
        Err(_) => panic!("postgres epoch is a valid date"),
    };
    PrimitiveDateTime::new(date, Time::MIDNIGHT)
};

const DATE: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::StringLiteral("-"),
    I::Component(C::Month(modifier::Month::default())),
    I::StringLiteral("-"),
    I::Component(C::Day(modifier::Day::default())),
];

const TIME: &[I<'_>] = &[
    I::Component(C::Hour(modifier::Hour::default())),
    I::StringLiteral(":"),
    I::Component(C::Minute(modifier::Minute::default())),
    I::StringLiteral(":"),
    I::Component(C::Second(modifier::Second::default())),
    I::Optional(&I::Compound(&[
        I::StringLiteral("."),
        I::Component(C::Subsecond(modifier::Subsecond::default())),
    ])),
];

const OFFSET: &[I<'_>] = &[
    I::Component(C::OffsetHour({
        let mut hour = modifier::OffsetHour::default();
        hour.sign_is_mandatory = true;
        hour
    })),
    I::Optional(&I::Compound(&[
        I::StringLiteral(":"),
        I::Component(C::OffsetMinute(modifier::OffsetMinute::default())),
    ])),
];

const TIMESTAMP: &[I<'_>] = &[I::Compound(DATE), I::StringLiteral(" "), I::Compound(TIME)];

const TIMESTAMPTZ: &[I<'_>] = &[
    I::Compound(DATE),
    I::StringLiteral(" "),
    I::Compound(TIME),
    I::Compound(OFFSET),
];

fn format_into(
    formatted: Result<String, time::error::Format>,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    let formatted = formatted.map_err(|e| EncodeError::Invalid(e.to_string()))?;
    buf.put_slice(formatted.as_bytes());
    Ok(())
}

fn micros(raw: &[u8]) -> Result<Duration, DecodeError> {
    let raw: [u8; 8] = raw.try_into().map_err(|_| DecodeError::invalid("expected 8 bytes timestamp"))?;
    match i64::from_be_bytes(raw) {
        i64::MAX | i64::MIN => Err(DecodeError::invalid("infinite timestamp")),
        value => Ok(Duration::microseconds(value)),
    }
}

fn since_epoch(value: PrimitiveDateTime) -> Result<i64, EncodeError> {
    i64::try_from((value - PG_EPOCH).whole_microseconds())
        .map_err(|_| EncodeError::Invalid("timestamp out of range".into()))
}

fn parse_error(e: time::error::Parse) -> DecodeError {
    DecodeError::invalid(e.to_string())
}

/// `date` as [`time::Date`].
#[derive(Debug, Clone, Copy)]
pub struct DateCodec;

impl Codec for DateCodec {
    type Value = Date;

    fn oid(&self) -> Oid {
        pg_type::DATE
    }

    fn encode(&self, value: &Date, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => {
                buf.put_i32(value.to_julian_day() - PG_EPOCH_JULIAN_DAY);
                Ok(())
            }
            PgFormat::Text => format_into(value.format(DATE), buf),
        }
    }

    fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<Date, DecodeError> {
        match format {
            PgFormat::Binary => {
                let days = raw.try_into().map(i32::from_be_bytes).map_err(|_| DecodeError::invalid("expected 4 bytes date"))?;
                PG_EPOCH_JULIAN_DAY
                    .checked_add(days)
                    .and_then(|day| Date::from_julian_day(day).ok())
                    .ok_or_else(|| DecodeError::invalid("date out of range"))
            }
            PgFormat::Text => Date::parse(text(raw)?, DATE).map_err(parse_error),
        }
    }
}

/// `timestamp` as [`time::PrimitiveDateTime`].
#[derive(Debug, Clone, Copy)]
pub struct TimestampCodec;

impl Codec for TimestampCodec {
    type Value = PrimitiveDateTime;

    fn oid(&self) -> Oid {
        pg_type::TIMESTAMP
    }

    fn encode(&self, value: &PrimitiveDateTime, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => {
                buf.put_i64(since_epoch(*value)?);
                Ok(())
            }
            PgFormat::Text => format_into(value.format(TIMESTAMP), buf),
        }
    }

    fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<PrimitiveDateTime, DecodeError> {
        match format {
            PgFormat::Binary => PG_EPOCH
                .checked_add(micros(raw)?)
                .ok_or_else(|| DecodeError::invalid("timestamp out of range")),
            PgFormat::Text => PrimitiveDateTime::parse(text(raw)?, TIMESTAMP).map_err(parse_error),
        }
    }
}

/// `timestamptz` as [`time::OffsetDateTime`], decoded values are in UTC.
#[derive(Debug, Clone, Copy)]
pub struct TimestamptzCodec;

impl Codec for TimestamptzCodec {
    type Value = OffsetDateTime;

    fn oid(&self) -> Oid {
        pg_type::TIMESTAMPTZ
    }

    fn encode(&self, value: &OffsetDateTime, format: PgFormat, _: &TypeRegistry, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match format {
            PgFormat::Binary => {
                let utc = value.to_offset(UtcOffset::UTC);
                buf.put_i64(since_epoch(PrimitiveDateTime::new(utc.date(), utc.time()))?);
                Ok(())
            }
            PgFormat::Text => format_into(value.format(TIMESTAMPTZ), buf),
        }
    }

    fn decode(&self, raw: &[u8], format: PgFormat, _: &TypeRegistry) -> Result<OffsetDateTime, DecodeError> {
        match format {
            PgFormat::Binary => PG_EPOCH
                .assume_utc()
                .checked_add(micros(raw)?)
                .ok_or_else(|| DecodeError::invalid("timestamp out of range")),
            PgFormat::Text => OffsetDateTime::parse(text(raw)?, TIMESTAMPTZ)
                .map(|value| value.to_offset(UtcOffset::UTC))
                .map_err(parse_error),
        }
    }
}
