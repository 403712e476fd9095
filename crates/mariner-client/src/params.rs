//! Parameter binding for both sub-protocols.
//!
//! Callers state what each parameter is (a scalar, a byte buffer, or a
//! character/binary stream) by picking a [`ParamHolder`] variant. The
//! binder never inspects a generic runtime value to guess an encoding.
//!
//! For prepared (binary) execution, stream holders travel ahead of the
//! execute packet as COM_STMT_SEND_LONG_DATA chunks: `Known`-length
//! streams are forwarded chunk by chunk without full buffering, while
//! `Unbounded` streams are buffered to completion first (a documented
//! memory cost). For text execution every holder renders as an escaped
//! SQL literal, with the escape style following the session's
//! NO_BACKSLASH_ESCAPES flag.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::result_large_err)]

use std::io::Read;

use mariner_core::error::{EncodeError, Error, Result};
use mariner_core::value::Value;

use crate::codec::{FieldType, binary_type_of, encode_binary_value};
use crate::connection::ConnectionContext;
use crate::protocol::WireWriter;

/// Chunk size for COM_STMT_SEND_LONG_DATA transfers.
pub(crate) const LONG_DATA_CHUNK: usize = 1 << 20;

/// Declared length of a streamed parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLength {
    /// Exactly this many bytes will be read from the source.
    Known(u64),
    /// Read until EOF; the whole stream is buffered before encoding.
    Unbounded,
}

/// One bound parameter. Consumed exactly once per execution.
pub enum ParamHolder {
    /// SQL NULL, regardless of the target column type
    Null,
    /// A scalar value encoded by the type codec
    Scalar(Value),
    /// An in-memory byte payload
    Bytes(Vec<u8>),
    /// Character data pulled from a reader
    TextStream(Box<dyn Read + Send>, StreamLength),
    /// Binary data pulled from a reader
    BinaryStream(Box<dyn Read + Send>, StreamLength),
}

impl std::fmt::Debug for ParamHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamHolder::Null => write!(f, "Null"),
            ParamHolder::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            ParamHolder::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ParamHolder::TextStream(_, len) => write!(f, "TextStream({len:?})"),
            ParamHolder::BinaryStream(_, len) => write!(f, "BinaryStream({len:?})"),
        }
    }
}

impl ParamHolder {
    /// Does this holder travel as COM_STMT_SEND_LONG_DATA?
    pub(crate) fn is_stream(&self) -> bool {
        matches!(
            self,
            ParamHolder::TextStream(..) | ParamHolder::BinaryStream(..)
        )
    }

    /// The wire type declared for this holder in the execute packet.
    pub(crate) fn declared_type(&self) -> (FieldType, u8) {
        match self {
            ParamHolder::Null => (FieldType::Null, 0),
            ParamHolder::Scalar(v) => binary_type_of(v),
            ParamHolder::Bytes(_) | ParamHolder::BinaryStream(..) => (FieldType::Blob, 0),
            ParamHolder::TextStream(..) => (FieldType::VarString, 0),
        }
    }
}

/// An indexed set of parameters for one execution.
#[derive(Debug, Default)]
pub struct ParamBinder {
    slots: Vec<Option<ParamHolder>>,
}

impl ParamBinder {
    /// A binder expecting `count` parameters (the statement's placeholder
    /// count).
    pub fn new(count: u16) -> Self {
        let mut slots = Vec::with_capacity(usize::from(count));
        slots.resize_with(usize::from(count), || None);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind `holder` at the zero-based parameter index. Rebinding an index
    /// replaces the previous holder.
    pub fn bind(&mut self, index: u16, holder: ParamHolder) -> Result<()> {
        let slot = self
            .slots
            .get_mut(usize::from(index))
            .ok_or_else(|| encode_err(format!("parameter index {index} out of range")))?;
        *slot = Some(holder);
        Ok(())
    }

    /// Shorthand for binding a scalar.
    pub fn bind_value(&mut self, index: u16, value: Value) -> Result<()> {
        let holder = if value.is_null() {
            ParamHolder::Null
        } else {
            ParamHolder::Scalar(value)
        };
        self.bind(index, holder)
    }

    /// Are all slots bound?
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Consume every holder, in index order. Fails if any slot is unbound.
    pub(crate) fn take_all(&mut self) -> Result<Vec<ParamHolder>> {
        let mut out = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot.take() {
                Some(holder) => out.push(holder),
                None => return Err(encode_err(format!("parameter {i} was never bound"))),
            }
        }
        Ok(out)
    }

    /// Render a text-protocol statement by substituting `?` placeholders
    /// with escaped literals, consuming the bound holders in order.
    ///
    /// Placeholders inside string literals and quoted identifiers are
    /// left untouched.
    pub fn interpolate(&mut self, sql: &str, ctx: &ConnectionContext) -> Result<String> {
        let holders = self.take_all()?;
        let no_backslash = ctx.no_backslash_escapes();

        let mut out = String::with_capacity(sql.len() + holders.len() * 16);
        let mut holders = holders.into_iter();
        let mut chars = sql.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '?' => match holders.next() {
                    Some(holder) => out.push_str(&render_literal(holder, no_backslash)?),
                    None => {
                        return Err(encode_err(
                            "more placeholders than bound parameters".to_string(),
                        ));
                    }
                },
                '\'' | '"' | '`' => {
                    out.push(ch);
                    copy_quoted(&mut chars, &mut out, ch);
                }
                _ => out.push(ch),
            }
        }

        if holders.next().is_some() {
            return Err(encode_err(
                "more bound parameters than placeholders".to_string(),
            ));
        }
        Ok(out)
    }
}

/// Copy a quoted region verbatim, honoring doubled-delimiter escapes.
fn copy_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
    delim: char,
) {
    while let Some(ch) = chars.next() {
        out.push(ch);
        if ch == delim {
            if chars.peek() == Some(&delim) {
                out.push(chars.next().unwrap());
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Text-protocol literals
// ---------------------------------------------------------------------------

/// Render one holder as a SQL literal, consuming it.
pub(crate) fn render_literal(holder: ParamHolder, no_backslash: bool) -> Result<String> {
    match holder {
        ParamHolder::Null => Ok("NULL".to_string()),
        ParamHolder::Scalar(v) => Ok(render_value_literal(&v, no_backslash)),
        ParamHolder::Bytes(b) => Ok(hex_literal(&b)),
        ParamHolder::TextStream(mut source, length) => {
            let data = drain_stream(&mut source, length)?;
            let text = String::from_utf8_lossy(&data);
            Ok(escape_string(&text, no_backslash))
        }
        ParamHolder::BinaryStream(mut source, length) => {
            let data = drain_stream(&mut source, length)?;
            Ok(hex_literal(&data))
        }
    }
}

fn render_value_literal(value: &Value, no_backslash: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => render_float(f64::from(*v)),
        Value::Double(v) => render_float(*v),
        Value::Decimal(s) => s.clone(),
        Value::Text(s) => escape_string(s, no_backslash),
        Value::Bytes(b) | Value::Bit(b) => hex_literal(b),
        Value::Json(doc) => escape_string(&doc.to_string(), no_backslash),
        Value::Date(d) => format!("'{d}'"),
        Value::Time(t) => format!("'{t}'"),
        Value::DateTime(dt) => format!("'{dt}'"),
    }
}

fn render_float(v: f64) -> String {
    if v.is_nan() || v.is_infinite() {
        // Neither has a SQL literal form.
        "NULL".to_string()
    } else {
        v.to_string()
    }
}

/// Escape a string literal.
///
/// In backslash mode the usual control characters are escaped; in
/// NO_BACKSLASH_ESCAPES mode the backslash is an ordinary character and
/// only the quote is doubled.
pub(crate) fn escape_string(s: &str, no_backslash: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    if no_backslash {
        for ch in s.chars() {
            if ch == '\'' {
                out.push_str("''");
            } else {
                out.push(ch);
            }
        }
    } else {
        for ch in s.chars() {
            match ch {
                '\'' => out.push_str("\\'"),
                '\\' => out.push_str("\\\\"),
                '\0' => out.push_str("\\0"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\x1a' => out.push_str("\\Z"),
                _ => out.push(ch),
            }
        }
    }
    out.push('\'');
    out
}

fn hex_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + 3);
    out.push_str("X'");
    for byte in data {
        out.push_str(&format!("{byte:02X}"));
    }
    out.push('\'');
    out
}

// ---------------------------------------------------------------------------
// Binary-protocol payloads
// ---------------------------------------------------------------------------

/// How one parameter appears in the execute packet.
pub(crate) enum BinaryParam {
    Null,
    Inline(Value),
    /// Already transmitted via long-data packets; only the type is
    /// declared here.
    LongData(FieldType),
}

/// Build the COM_STMT_EXECUTE payload (everything after the command byte).
pub(crate) fn build_execute_payload(
    statement_id: u32,
    params: &[BinaryParam],
) -> Result<Vec<u8>> {
    let mut w = WireWriter::with_capacity(16 + params.len() * 12);
    w.u32_le(statement_id);
    w.u8(0x00); // CURSOR_TYPE_NO_CURSOR
    w.u32_le(1); // iteration count

    if params.is_empty() {
        return Ok(w.into_bytes());
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, p) in params.iter().enumerate() {
        let is_null = matches!(p, BinaryParam::Null)
            || matches!(p, BinaryParam::Inline(Value::Null));
        if is_null {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    w.bytes(&null_bitmap);

    w.u8(1); // new-params-bound flag

    for p in params {
        let (ty, flags) = match p {
            BinaryParam::Null => (FieldType::Null, 0),
            BinaryParam::Inline(v) => binary_type_of(v),
            BinaryParam::LongData(ty) => (*ty, 0),
        };
        w.u8(ty as u8);
        w.u8(flags);
    }

    for p in params {
        if let BinaryParam::Inline(v) = p {
            encode_binary_value(&mut w, v)?;
        }
    }

    Ok(w.into_bytes())
}

/// Build one COM_STMT_SEND_LONG_DATA payload (after the command byte).
pub(crate) fn build_long_data_payload(statement_id: u32, index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(6 + chunk.len());
    w.u32_le(statement_id);
    w.u16_le(index);
    w.bytes(chunk);
    w.into_bytes()
}

/// Feed a stream to `sink` in `LONG_DATA_CHUNK`-sized pieces.
///
/// At least one (possibly empty) chunk is always emitted so the server
/// registers the parameter as long data. A `Known` length is a contract:
/// early EOF is an encode error, and surplus bytes are not read.
pub(crate) fn stream_chunks(
    source: &mut dyn Read,
    length: StreamLength,
    mut sink: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    match length {
        StreamLength::Known(total) => {
            let mut remaining = total;
            if remaining == 0 {
                return sink(&[]);
            }
            let mut buf = vec![0u8; LONG_DATA_CHUNK.min(usize::try_from(total).unwrap_or(LONG_DATA_CHUNK))];
            while remaining > 0 {
                let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
                let mut filled = 0;
                while filled < want {
                    let n = source.read(&mut buf[filled..want]).map_err(Error::from)?;
                    if n == 0 {
                        return Err(encode_err(format!(
                            "stream ended {} bytes short of its declared length",
                            remaining - filled as u64
                        )));
                    }
                    filled += n;
                }
                sink(&buf[..filled])?;
                remaining -= filled as u64;
            }
            Ok(())
        }
        StreamLength::Unbounded => {
            // Unbounded sources are buffered whole before chunking.
            let mut data = Vec::new();
            source.read_to_end(&mut data).map_err(Error::from)?;
            if data.is_empty() {
                return sink(&[]);
            }
            for chunk in data.chunks(LONG_DATA_CHUNK) {
                sink(chunk)?;
            }
            Ok(())
        }
    }
}

fn encode_err(message: String) -> Error {
    Error::Encode(EncodeError { message })
}
