//! Type codec: column metadata and value conversion.
//!
//! Values cross the wire in two encodings. The text protocol sends every
//! value as a length-encoded string; the binary protocol (prepared
//! statements) packs fixed layouts with a null bitmap. Both directions are
//! pure functions over the payload bytes, the negotiated
//! [`ConnectionContext`], and the caller's [`CodecConfig`]; there is no
//! ambient codec state.

#![allow(clippy::cast_possible_truncation)]

use mariner_core::error::{DecodeError, EncodeError, Error, ProtocolError, Result};
use mariner_core::value::{Date, DateTime, Time, Value};

use crate::config::CodecConfig;
use crate::connection::ConnectionContext;
use crate::protocol::{LenEnc, WireReader, WireWriter};

/// Wire type tags (the MYSQL_TYPE_* constants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a type tag. Unknown tags decode as strings, which is what
    /// servers expect clients to do with types they postdate.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }
}

/// Column flags in result-set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// The charset id of binary collations.
const BINARY_CHARSET: u16 = 63;

/// A column definition packet, fixed once a result header has been read.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// Always `def` on current servers
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    /// Declared display length (e.g. 1 for `TINYINT(1)`)
    pub length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Decode a column-definition payload (protocol 4.1 layout).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let mut next_str = |field: &'static str| {
            r.lenenc_str().ok_or_else(|| truncated_column(field))
        };

        let catalog = next_str("catalog")?;
        let schema = next_str("schema")?;
        let table = next_str("table")?;
        let org_table = next_str("org_table")?;
        let name = next_str("name")?;
        let org_name = next_str("org_name")?;

        // Length of the fixed tail, always 0x0C
        r.lenenc_int().ok_or_else(|| truncated_column("fixed_len"))?;

        let charset = r.u16_le().ok_or_else(|| truncated_column("charset"))?;
        let length = r.u32_le().ok_or_else(|| truncated_column("length"))?;
        let field_type =
            FieldType::from_tag(r.u8().ok_or_else(|| truncated_column("type"))?);
        let flags = r.u16_le().ok_or_else(|| truncated_column("flags"))?;
        let decimals = r.u8().ok_or_else(|| truncated_column("decimals"))?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            length,
            field_type,
            flags,
            decimals,
        })
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Does this column carry binary (not character) data?
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET && self.flags & column_flags::BINARY != 0
    }

    /// The container name to report for this column, honoring the
    /// configured catalog/schema terminology. Wire catalogs are always
    /// `def`, so schema is the meaningful container either way.
    pub fn container<'a>(&'a self, cfg: &CodecConfig) -> &'a str {
        if cfg.use_catalog_term {
            &self.catalog
        } else {
            &self.schema
        }
    }
}

fn truncated_column(field: &'static str) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("column definition truncated at {field}"),
        source: None,
    })
}

fn decode_err(col: &ColumnDefinition, message: impl Into<String>) -> Error {
    Error::Decode(DecodeError {
        column: Some(col.name.clone()),
        message: message.into(),
    })
}

// ---------------------------------------------------------------------------
// Text protocol decode
// ---------------------------------------------------------------------------

/// Decode one text-protocol value (already length-stripped, non-NULL).
pub fn decode_text_value(
    col: &ColumnDefinition,
    raw: &[u8],
    ctx: &ConnectionContext,
    cfg: &CodecConfig,
) -> Result<Value> {
    let text = || String::from_utf8_lossy(raw).into_owned();

    match col.field_type {
        FieldType::Null => Ok(Value::Null),

        FieldType::Tiny => {
            if cfg.tiny_int_one_is_bit && col.length == 1 {
                let v: i64 = parse_number(col, raw)?;
                return Ok(Value::Bool(v != 0));
            }
            decode_text_int(col, raw)
        }
        FieldType::Short | FieldType::Int24 | FieldType::Long => decode_text_int(col, raw),
        FieldType::LongLong => {
            if col.is_unsigned() {
                let v: u64 = parse_number(col, raw)?;
                Ok(Value::UInt(v))
            } else {
                let v: i64 = parse_number(col, raw)?;
                Ok(Value::Int(v))
            }
        }

        FieldType::Year => {
            let year: u16 = parse_number(col, raw)?;
            if cfg.year_is_date_type {
                Ok(Value::Date(Date::new(year, 1, 1)))
            } else {
                Ok(Value::Int(i64::from(year)))
            }
        }

        FieldType::Float => {
            let v: f32 = parse_number(col, raw)?;
            Ok(Value::Float(v))
        }
        FieldType::Double => {
            let v: f64 = parse_number(col, raw)?;
            Ok(Value::Double(v))
        }

        // Exact numerics stay text
        FieldType::Decimal | FieldType::NewDecimal => Ok(Value::Decimal(text())),

        FieldType::Date | FieldType::NewDate => {
            let date = parse_text_date(col, &text())?;
            finish_date(date, col, cfg)
        }
        FieldType::Time => Ok(Value::Time(parse_text_time(col, &text(), ctx)?)),
        FieldType::DateTime | FieldType::Timestamp => {
            let dt = parse_text_datetime(col, &text(), ctx)?;
            finish_datetime(dt, col, cfg)
        }

        FieldType::Bit => Ok(Value::Bit(raw.to_vec())),

        FieldType::Json => match serde_json::from_slice(raw) {
            Ok(doc) => Ok(Value::Json(doc)),
            Err(_) => Ok(Value::Text(text())),
        },

        FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::Geometry => Ok(Value::Bytes(raw.to_vec())),

        _ => {
            if col.is_binary() {
                Ok(Value::Bytes(raw.to_vec()))
            } else {
                Ok(Value::Text(text()))
            }
        }
    }
}

/// Integer text decode with unsigned widening into the signed domain.
fn decode_text_int(col: &ColumnDefinition, raw: &[u8]) -> Result<Value> {
    if col.is_unsigned() {
        let v: u64 = parse_number(col, raw)?;
        // Everything below 64 bits fits the signed 64-bit domain.
        Ok(Value::Int(v as i64))
    } else {
        let v: i64 = parse_number(col, raw)?;
        Ok(Value::Int(v))
    }
}

fn parse_number<T: std::str::FromStr>(col: &ColumnDefinition, raw: &[u8]) -> Result<T> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            decode_err(
                col,
                format!("malformed numeric text {:?}", String::from_utf8_lossy(raw)),
            )
        })
}

fn parse_text_date(col: &ColumnDefinition, s: &str) -> Result<Date> {
    let mut parts = s.splitn(3, '-');
    let (Some(y), Some(m), Some(d)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(decode_err(col, format!("malformed date {s:?}")));
    };
    let parse = |v: &str| v.parse::<u32>().ok();
    match (parse(y), parse(m), parse(d)) {
        (Some(y), Some(m), Some(d)) if y <= 9999 && m <= 12 && d <= 31 => {
            Ok(Date::new(y as u16, m as u8, d as u8))
        }
        _ => Err(decode_err(col, format!("malformed date {s:?}"))),
    }
}

fn parse_text_time(col: &ColumnDefinition, s: &str, ctx: &ConnectionContext) -> Result<Time> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (clock, fraction) = match body.split_once('.') {
        Some((c, f)) => (c, Some(f)),
        None => (body, None),
    };
    let mut parts = clock.splitn(3, ':');
    let (Some(h), Some(m), Some(sec)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(decode_err(col, format!("malformed time {s:?}")));
    };
    let (Some(hours), Some(minutes), Some(seconds)) = (
        h.parse::<u32>().ok(),
        m.parse::<u8>().ok(),
        sec.parse::<u8>().ok(),
    ) else {
        return Err(decode_err(col, format!("malformed time {s:?}")));
    };

    let micros = match fraction {
        Some(f) if ctx.version.supports_fractional_seconds() => parse_fraction(col, f)?,
        _ => 0,
    };

    Ok(Time {
        negative,
        hours,
        minutes,
        seconds,
        micros,
    })
}

fn parse_text_datetime(
    col: &ColumnDefinition,
    s: &str,
    ctx: &ConnectionContext,
) -> Result<DateTime> {
    let (date_part, time_part) = match s.split_once(' ') {
        Some((d, t)) => (d, t),
        None => (s, "00:00:00"),
    };
    let date = parse_text_date(col, date_part)?;
    let time = parse_text_time(col, time_part, ctx)?;
    if time.negative || time.hours > 23 {
        return Err(decode_err(col, format!("time of day out of range in {s:?}")));
    }
    Ok(DateTime {
        date,
        hour: time.hours as u8,
        minute: time.minutes,
        second: time.seconds,
        micros: time.micros,
    })
}

/// Scale a fractional-second suffix of up to 6 digits to microseconds.
fn parse_fraction(col: &ColumnDefinition, f: &str) -> Result<u32> {
    if f.is_empty() || f.len() > 6 || !f.bytes().all(|b| b.is_ascii_digit()) {
        return Err(decode_err(col, format!("malformed fractional seconds {f:?}")));
    }
    let digits: u32 = f.parse().unwrap_or(0);
    Ok(digits * 10u32.pow(6 - f.len() as u32))
}

fn finish_date(date: Date, col: &ColumnDefinition, cfg: &CodecConfig) -> Result<Value> {
    if date.is_zero() {
        if cfg.zero_date_is_null {
            Ok(Value::Null)
        } else {
            Err(decode_err(col, "zero date 0000-00-00"))
        }
    } else {
        Ok(Value::Date(date))
    }
}

fn finish_datetime(dt: DateTime, col: &ColumnDefinition, cfg: &CodecConfig) -> Result<Value> {
    if dt.date.is_zero() {
        if cfg.zero_date_is_null {
            Ok(Value::Null)
        } else {
            Err(decode_err(col, "zero date 0000-00-00"))
        }
    } else {
        Ok(Value::DateTime(dt))
    }
}

// ---------------------------------------------------------------------------
// Binary protocol decode
// ---------------------------------------------------------------------------

/// Decode one binary-protocol value at the reader's cursor.
///
/// The caller has already consulted the row's null bitmap; this is only
/// invoked for present values.
pub fn decode_binary_value(
    col: &ColumnDefinition,
    r: &mut WireReader<'_>,
    ctx: &ConnectionContext,
    cfg: &CodecConfig,
) -> Result<Value> {
    let short = || decode_err(col, "binary value truncated");

    match col.field_type {
        FieldType::Null => Ok(Value::Null),

        FieldType::Tiny => {
            let b = r.u8().ok_or_else(short)?;
            if cfg.tiny_int_one_is_bit && col.length == 1 {
                return Ok(Value::Bool(b != 0));
            }
            if col.is_unsigned() {
                Ok(Value::Int(i64::from(b)))
            } else {
                Ok(Value::Int(i64::from(b as i8)))
            }
        }
        FieldType::Short => {
            let v = r.u16_le().ok_or_else(short)?;
            if col.is_unsigned() {
                Ok(Value::Int(i64::from(v)))
            } else {
                Ok(Value::Int(i64::from(v as i16)))
            }
        }
        FieldType::Int24 | FieldType::Long => {
            let v = r.u32_le().ok_or_else(short)?;
            if col.is_unsigned() {
                Ok(Value::Int(i64::from(v)))
            } else {
                Ok(Value::Int(i64::from(v as i32)))
            }
        }
        FieldType::LongLong => {
            let v = r.u64_le().ok_or_else(short)?;
            if col.is_unsigned() {
                Ok(Value::UInt(v))
            } else {
                Ok(Value::Int(v as i64))
            }
        }

        FieldType::Year => {
            let year = r.u16_le().ok_or_else(short)?;
            if cfg.year_is_date_type {
                Ok(Value::Date(Date::new(year, 1, 1)))
            } else {
                Ok(Value::Int(i64::from(year)))
            }
        }

        FieldType::Float => {
            let b = r.take(4).ok_or_else(short)?;
            Ok(Value::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        }
        FieldType::Double => {
            let b = r.take(8).ok_or_else(short)?;
            Ok(Value::Double(f64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])))
        }

        FieldType::Decimal | FieldType::NewDecimal => {
            let raw = r.lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Decimal(String::from_utf8_lossy(raw).into_owned()))
        }

        FieldType::Date | FieldType::NewDate => {
            let date = decode_binary_date(col, r)?;
            finish_date(date, col, cfg)
        }
        FieldType::Time => Ok(Value::Time(decode_binary_time(col, r, ctx)?)),
        FieldType::DateTime | FieldType::Timestamp => {
            let dt = decode_binary_datetime(col, r, ctx)?;
            finish_datetime(dt, col, cfg)
        }

        FieldType::Bit => {
            let raw = r.lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Bit(raw.to_vec()))
        }

        FieldType::Json => {
            let raw = r.lenenc_bytes().ok_or_else(short)?;
            match serde_json::from_slice(raw) {
                Ok(doc) => Ok(Value::Json(doc)),
                Err(_) => Ok(Value::Text(String::from_utf8_lossy(raw).into_owned())),
            }
        }

        FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::Geometry => {
            let raw = r.lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Bytes(raw.to_vec()))
        }

        _ => {
            let raw = r.lenenc_bytes().ok_or_else(short)?;
            if col.is_binary() {
                Ok(Value::Bytes(raw.to_vec()))
            } else {
                Ok(Value::Text(String::from_utf8_lossy(raw).into_owned()))
            }
        }
    }
}

fn decode_binary_date(col: &ColumnDefinition, r: &mut WireReader<'_>) -> Result<Date> {
    let len = r.u8().ok_or_else(|| decode_err(col, "date length missing"))?;
    match len {
        0 => Ok(Date::ZERO),
        4 | 7 | 11 => {
            let b = r
                .take(len as usize)
                .ok_or_else(|| decode_err(col, "date value truncated"))?;
            Ok(Date::new(u16::from_le_bytes([b[0], b[1]]), b[2], b[3]))
        }
        other => Err(decode_err(col, format!("invalid date length {other}"))),
    }
}

fn decode_binary_time(
    col: &ColumnDefinition,
    r: &mut WireReader<'_>,
    ctx: &ConnectionContext,
) -> Result<Time> {
    let len = r.u8().ok_or_else(|| decode_err(col, "time length missing"))?;
    match len {
        0 => Ok(Time::new(0, 0, 0)),
        8 | 12 => {
            let b = r
                .take(len as usize)
                .ok_or_else(|| decode_err(col, "time value truncated"))?;
            let negative = b[0] != 0;
            let days = u32::from_le_bytes([b[1], b[2], b[3], b[4]]);
            let hours = days * 24 + u32::from(b[5]);
            let micros = if len == 12 && ctx.version.supports_fractional_seconds() {
                u32::from_le_bytes([b[8], b[9], b[10], b[11]])
            } else {
                0
            };
            Ok(Time {
                negative,
                hours,
                minutes: b[6],
                seconds: b[7],
                micros,
            })
        }
        other => Err(decode_err(col, format!("invalid time length {other}"))),
    }
}

fn decode_binary_datetime(
    col: &ColumnDefinition,
    r: &mut WireReader<'_>,
    ctx: &ConnectionContext,
) -> Result<DateTime> {
    let len = r
        .u8()
        .ok_or_else(|| decode_err(col, "datetime length missing"))?;
    match len {
        0 => Ok(DateTime::new(Date::ZERO, 0, 0, 0)),
        4 | 7 | 11 => {
            let b = r
                .take(len as usize)
                .ok_or_else(|| decode_err(col, "datetime value truncated"))?;
            let date = Date::new(u16::from_le_bytes([b[0], b[1]]), b[2], b[3]);
            let (hour, minute, second) = if len >= 7 { (b[4], b[5], b[6]) } else { (0, 0, 0) };
            let micros = if len == 11 && ctx.version.supports_fractional_seconds() {
                u32::from_le_bytes([b[7], b[8], b[9], b[10]])
            } else {
                0
            };
            Ok(DateTime {
                date,
                hour,
                minute,
                second,
                micros,
            })
        }
        other => Err(decode_err(col, format!("invalid datetime length {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Binary protocol encode
// ---------------------------------------------------------------------------

/// The type tag and flag byte to declare for a parameter value.
pub fn binary_type_of(value: &Value) -> (FieldType, u8) {
    const UNSIGNED_FLAG: u8 = 0x80;
    match value {
        Value::Null => (FieldType::Null, 0),
        Value::Bool(_) => (FieldType::Tiny, 0),
        Value::Int(_) => (FieldType::LongLong, 0),
        Value::UInt(_) => (FieldType::LongLong, UNSIGNED_FLAG),
        Value::Float(_) => (FieldType::Float, 0),
        Value::Double(_) => (FieldType::Double, 0),
        Value::Decimal(_) => (FieldType::NewDecimal, 0),
        Value::Text(_) => (FieldType::VarString, 0),
        Value::Bytes(_) | Value::Bit(_) => (FieldType::Blob, 0),
        Value::Date(_) => (FieldType::Date, 0),
        Value::Time(_) => (FieldType::Time, 0),
        Value::DateTime(_) => (FieldType::DateTime, 0),
        Value::Json(_) => (FieldType::Json, 0),
    }
}

/// Encode one parameter value in the binary layout.
///
/// NULL encodes nothing; it lives in the execute packet's null bitmap.
pub fn encode_binary_value(w: &mut WireWriter, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => w.u8(u8::from(*b)),
        Value::Int(v) => w.u64_le(*v as u64),
        Value::UInt(v) => w.u64_le(*v),
        Value::Float(v) => w.bytes(&v.to_le_bytes()),
        Value::Double(v) => w.bytes(&v.to_le_bytes()),
        Value::Decimal(s) => w.lenenc_str(s),
        Value::Text(s) => w.lenenc_str(s),
        Value::Bytes(b) | Value::Bit(b) => w.lenenc_bytes(b),
        Value::Json(doc) => w.lenenc_str(&doc.to_string()),
        Value::Date(d) => encode_binary_date(w, d)?,
        Value::Time(t) => encode_binary_time(w, t)?,
        Value::DateTime(dt) => encode_binary_datetime(w, dt)?,
    }
    Ok(())
}

fn encode_binary_date(w: &mut WireWriter, d: &Date) -> Result<()> {
    check_date(d)?;
    if d.is_zero() {
        w.u8(0);
    } else {
        w.u8(4);
        w.u16_le(d.year);
        w.u8(d.month);
        w.u8(d.day);
    }
    Ok(())
}

fn encode_binary_time(w: &mut WireWriter, t: &Time) -> Result<()> {
    if t.minutes > 59 || t.seconds > 59 || t.micros > 999_999 {
        return Err(encode_err(format!("time {t} out of range")));
    }
    if t.is_zero() {
        w.u8(0);
        return Ok(());
    }
    let days = t.hours / 24;
    let hour = (t.hours % 24) as u8;
    if t.micros == 0 {
        w.u8(8);
    } else {
        w.u8(12);
    }
    w.u8(u8::from(t.negative));
    w.u32_le(days);
    w.u8(hour);
    w.u8(t.minutes);
    w.u8(t.seconds);
    if t.micros > 0 {
        w.u32_le(t.micros);
    }
    Ok(())
}

fn encode_binary_datetime(w: &mut WireWriter, dt: &DateTime) -> Result<()> {
    check_date(&dt.date)?;
    if dt.hour > 23 || dt.minute > 59 || dt.second > 59 || dt.micros > 999_999 {
        return Err(encode_err(format!("datetime {dt} out of range")));
    }
    if dt.is_zero() {
        w.u8(0);
        return Ok(());
    }
    if dt.hour == 0 && dt.minute == 0 && dt.second == 0 && dt.micros == 0 {
        w.u8(4);
        w.u16_le(dt.date.year);
        w.u8(dt.date.month);
        w.u8(dt.date.day);
        return Ok(());
    }
    if dt.micros == 0 {
        w.u8(7);
    } else {
        w.u8(11);
    }
    w.u16_le(dt.date.year);
    w.u8(dt.date.month);
    w.u8(dt.date.day);
    w.u8(dt.hour);
    w.u8(dt.minute);
    w.u8(dt.second);
    if dt.micros > 0 {
        w.u32_le(dt.micros);
    }
    Ok(())
}

fn check_date(d: &Date) -> Result<()> {
    if d.year > 9999 || d.month > 12 || d.day > 31 {
        Err(encode_err(format!("date {d} out of range")))
    } else {
        Ok(())
    }
}

fn encode_err(message: String) -> Error {
    Error::Encode(EncodeError { message })
}

/// Read one text-protocol cell: either the NULL marker or raw bytes.
pub fn read_text_cell<'a>(r: &mut WireReader<'a>) -> Option<Option<&'a [u8]>> {
    match r.lenenc()? {
        LenEnc::Null => Some(None),
        LenEnc::Int(len) => r.take(len as usize).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ServerVersion, ConnectionContext};

    fn ctx() -> ConnectionContext {
        ConnectionContext::new(0, ServerVersion::parse("8.0.36"))
    }

    fn ctx_no_frac() -> ConnectionContext {
        ConnectionContext::new(0, ServerVersion::parse("5.5.30"))
    }

    fn col(field_type: FieldType) -> ColumnDefinition {
        ColumnDefinition {
            catalog: "def".to_string(),
            schema: "test".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: "c".to_string(),
            org_name: "c".to_string(),
            charset: 255,
            length: 11,
            field_type,
            flags: 0,
            decimals: 0,
        }
    }

    fn unsigned_col(field_type: FieldType) -> ColumnDefinition {
        let mut c = col(field_type);
        c.flags |= column_flags::UNSIGNED;
        c
    }

    #[test]
    fn text_integers() {
        let cfg = CodecConfig::default();
        let v = decode_text_value(&col(FieldType::Long), b"42", &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Int(42));

        let v = decode_text_value(&col(FieldType::LongLong), b"-9223372036854775808", &ctx(), &cfg)
            .unwrap();
        assert_eq!(v, Value::Int(i64::MIN));
    }

    #[test]
    fn text_unsigned_widening() {
        let cfg = CodecConfig::default();
        // Unsigned INT widens into the signed 64-bit domain
        let v =
            decode_text_value(&unsigned_col(FieldType::Long), b"4294967295", &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Int(4_294_967_295));

        // Unsigned BIGINT keeps the full unsigned range
        let v = decode_text_value(
            &unsigned_col(FieldType::LongLong),
            b"18446744073709551615",
            &ctx(),
            &cfg,
        )
        .unwrap();
        assert_eq!(v, Value::UInt(u64::MAX));
    }

    #[test]
    fn tiny_int_one_is_bit_toggle() {
        let mut c = col(FieldType::Tiny);
        c.length = 1;
        let mut cfg = CodecConfig::default();

        cfg.tiny_int_one_is_bit = true;
        assert_eq!(
            decode_text_value(&c, b"1", &ctx(), &cfg).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            decode_text_value(&c, b"0", &ctx(), &cfg).unwrap(),
            Value::Bool(false)
        );

        cfg.tiny_int_one_is_bit = false;
        assert_eq!(
            decode_text_value(&c, b"1", &ctx(), &cfg).unwrap(),
            Value::Int(1)
        );

        // Wider TINYINT columns never turn into booleans
        let mut wide = col(FieldType::Tiny);
        wide.length = 4;
        cfg.tiny_int_one_is_bit = true;
        assert_eq!(
            decode_text_value(&wide, b"5", &ctx(), &cfg).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn year_mode_toggle() {
        let mut cfg = CodecConfig::default();

        cfg.year_is_date_type = false;
        let v = decode_text_value(&col(FieldType::Year), b"2024", &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Int(2024));

        cfg.year_is_date_type = true;
        let v = decode_text_value(&col(FieldType::Year), b"2024", &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Date(Date::new(2024, 1, 1)));
    }

    #[test]
    fn zero_date_both_modes() {
        let mut cfg = CodecConfig::default();

        cfg.zero_date_is_null = true;
        let v = decode_text_value(&col(FieldType::Date), b"0000-00-00", &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Null);

        cfg.zero_date_is_null = false;
        let err = decode_text_value(&col(FieldType::Date), b"0000-00-00", &ctx(), &cfg);
        assert!(matches!(err, Err(Error::Decode(_))));

        // Same rule through the datetime path
        cfg.zero_date_is_null = true;
        let v = decode_text_value(
            &col(FieldType::DateTime),
            b"0000-00-00 00:00:00",
            &ctx(),
            &cfg,
        )
        .unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn decimal_stays_text() {
        let cfg = CodecConfig::default();
        let v = decode_text_value(
            &col(FieldType::NewDecimal),
            b"12345678901234567890.123456789",
            &ctx(),
            &cfg,
        )
        .unwrap();
        assert_eq!(
            v,
            Value::Decimal("12345678901234567890.123456789".to_string())
        );
    }

    #[test]
    fn fractional_seconds_version_gate() {
        let cfg = CodecConfig::default();

        let v = decode_text_value(
            &col(FieldType::DateTime),
            b"2024-03-09 12:30:45.250000",
            &ctx(),
            &cfg,
        )
        .unwrap();
        let Value::DateTime(dt) = v else {
            panic!("expected datetime")
        };
        assert_eq!(dt.micros, 250_000);

        // Pre-5.6.4 MySQL: fraction digits are not read
        let v = decode_text_value(
            &col(FieldType::DateTime),
            b"2024-03-09 12:30:45.250000",
            &ctx_no_frac(),
            &cfg,
        )
        .unwrap();
        let Value::DateTime(dt) = v else {
            panic!("expected datetime")
        };
        assert_eq!(dt.micros, 0);
    }

    #[test]
    fn text_time_negative_and_fraction() {
        let cfg = CodecConfig::default();
        let v = decode_text_value(&col(FieldType::Time), b"-120:01:02.5", &ctx(), &cfg).unwrap();
        let Value::Time(t) = v else { panic!("expected time") };
        assert!(t.negative);
        assert_eq!(t.hours, 120);
        assert_eq!(t.minutes, 1);
        assert_eq!(t.seconds, 2);
        assert_eq!(t.micros, 500_000);
    }

    #[test]
    fn binary_integer_roundtrip() {
        let cfg = CodecConfig::default();

        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::Int(-1)).unwrap();
        let buf = w.into_bytes();
        let mut r = WireReader::new(&buf);
        let v = decode_binary_value(&col(FieldType::LongLong), &mut r, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Int(-1));

        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::UInt(u64::MAX)).unwrap();
        let buf = w.into_bytes();
        let mut r = WireReader::new(&buf);
        let v =
            decode_binary_value(&unsigned_col(FieldType::LongLong), &mut r, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::UInt(u64::MAX));
    }

    #[test]
    fn binary_temporal_roundtrip() {
        let cfg = CodecConfig::default();

        let dt = DateTime::new(Date::new(2038, 1, 19), 3, 14, 7).with_micros(999_999);
        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::DateTime(dt)).unwrap();
        let buf = w.into_bytes();
        assert_eq!(buf[0], 11);
        let mut r = WireReader::new(&buf);
        let v = decode_binary_value(&col(FieldType::DateTime), &mut r, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::DateTime(dt));

        let t = Time::new(100, 59, 59).with_micros(1);
        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::Time(t)).unwrap();
        let buf = w.into_bytes();
        assert_eq!(buf[0], 12);
        let mut r = WireReader::new(&buf);
        let v = decode_binary_value(&col(FieldType::Time), &mut r, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Time(t));

        let d = Date::new(1970, 1, 1);
        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::Date(d)).unwrap();
        let buf = w.into_bytes();
        let mut r = WireReader::new(&buf);
        let v = decode_binary_value(&col(FieldType::Date), &mut r, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Date(d));
    }

    #[test]
    fn binary_datetime_short_forms() {
        let cfg = CodecConfig::default();

        // Date-only datetime compresses to the 4-byte form
        let dt = DateTime::new(Date::new(2024, 6, 1), 0, 0, 0);
        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::DateTime(dt)).unwrap();
        let buf = w.into_bytes();
        assert_eq!(buf[0], 4);
        let mut r = WireReader::new(&buf);
        let v = decode_binary_value(&col(FieldType::DateTime), &mut r, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::DateTime(dt));
    }

    #[test]
    fn binary_fraction_gate_skips_bytes() {
        let cfg = CodecConfig::default();
        let dt = DateTime::new(Date::new(2024, 6, 1), 1, 2, 3).with_micros(42);
        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::DateTime(dt)).unwrap();
        let buf = w.into_bytes();

        // An 11-byte payload decoded against an old server yields zero
        // micros but still consumes the whole value.
        let mut r = WireReader::new(&buf);
        let v = decode_binary_value(&col(FieldType::DateTime), &mut r, &ctx_no_frac(), &cfg)
            .unwrap();
        let Value::DateTime(got) = v else {
            panic!("expected datetime")
        };
        assert_eq!(got.micros, 0);
        assert!(r.is_empty());
    }

    #[test]
    fn encode_range_checks() {
        let mut w = WireWriter::new();
        let bad = Date::new(10_000, 1, 1);
        assert!(matches!(
            encode_binary_value(&mut w, &Value::Date(bad)),
            Err(Error::Encode(_))
        ));

        let bad_time = Time::new(1, 60, 0);
        assert!(matches!(
            encode_binary_value(&mut w, &Value::Time(bad_time)),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn float_and_decimal_roundtrip() {
        let cfg = CodecConfig::default();

        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::Double(-2.5)).unwrap();
        let buf = w.into_bytes();
        let mut r = WireReader::new(&buf);
        assert_eq!(
            decode_binary_value(&col(FieldType::Double), &mut r, &ctx(), &cfg).unwrap(),
            Value::Double(-2.5)
        );

        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::Decimal("99999.00001".to_string())).unwrap();
        let buf = w.into_bytes();
        let mut r = WireReader::new(&buf);
        assert_eq!(
            decode_binary_value(&col(FieldType::NewDecimal), &mut r, &ctx(), &cfg).unwrap(),
            Value::Decimal("99999.00001".to_string())
        );
    }

    #[test]
    fn bit_and_blob_passthrough() {
        let cfg = CodecConfig::default();
        let v = decode_text_value(&col(FieldType::Bit), &[0b1010_0001], &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Bit(vec![0b1010_0001]));

        let mut w = WireWriter::new();
        encode_binary_value(&mut w, &Value::Bytes(vec![0, 159, 146, 150])).unwrap();
        let buf = w.into_bytes();
        let mut r = WireReader::new(&buf);
        assert_eq!(
            decode_binary_value(&col(FieldType::Blob), &mut r, &ctx(), &cfg).unwrap(),
            Value::Bytes(vec![0, 159, 146, 150])
        );
    }

    #[test]
    fn json_decode() {
        let cfg = CodecConfig::default();
        let v = decode_text_value(&col(FieldType::Json), br#"{"a":1}"#, &ctx(), &cfg).unwrap();
        assert_eq!(v, Value::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn column_definition_parse() {
        let mut w = WireWriter::new();
        for s in ["def", "app", "users", "users", "id", "id"] {
            w.lenenc_str(s);
        }
        w.lenenc_int(0x0C);
        w.u16_le(255); // charset
        w.u32_le(20); // length
        w.u8(FieldType::LongLong as u8);
        w.u16_le(column_flags::NOT_NULL | column_flags::UNSIGNED | column_flags::AUTO_INCREMENT);
        w.u8(0); // decimals
        w.u16_le(0); // filler

        let def = ColumnDefinition::parse(w.as_bytes()).unwrap();
        assert_eq!(def.name, "id");
        assert_eq!(def.schema, "app");
        assert_eq!(def.field_type, FieldType::LongLong);
        assert!(def.is_unsigned());
        assert!(def.is_not_null());
        assert!(def.is_auto_increment());

        let cfg = CodecConfig::default();
        assert_eq!(def.container(&cfg), "app");
        let catalog_cfg = CodecConfig {
            use_catalog_term: true,
            ..cfg
        };
        assert_eq!(def.container(&catalog_cfg), "def");
    }

    #[test]
    fn column_definition_truncated() {
        let mut w = WireWriter::new();
        w.lenenc_str("def");
        assert!(matches!(
            ColumnDefinition::parse(w.as_bytes()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn unknown_tag_falls_back_to_string() {
        assert_eq!(FieldType::from_tag(0x42), FieldType::String);
    }
}
