//! Result materialization.
//!
//! A query response is either an OK packet (no rows) or a result set:
//! column count, that many column definitions, then row packets until a
//! terminator. Rows decode through the type codec; one bad row aborts the
//! whole materialization with a `DecodeError`, with no partial recovery.
//! Multi-statement commands chain sub-results in strict FIFO order via
//! the MORE_RESULTS_EXISTS status flag.

#![allow(clippy::result_large_err)]

use std::sync::Arc;

use tracing::trace;

use mariner_core::error::{Error, Result};
use mariner_core::row::{ColumnInfo, Row};
use mariner_core::value::Value;

use crate::codec::{ColumnDefinition, decode_binary_value, decode_text_value, read_text_cell};
use crate::config::CodecConfig;
use crate::connection::{Connection, ConnectionContext, protocol_err};
use crate::params::ParamBinder;
use crate::protocol::{Command, MAX_FRAME_SIZE, OkPacket, WireReader, capability};

/// Which row encoding a result set uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowsProtocol {
    Text,
    Binary,
}

/// Outcome of a buffered command: a row-less acknowledgment or rows.
#[derive(Debug)]
pub enum QueryOutcome {
    /// The statement produced no result set.
    Done(OkPacket),
    /// A fully materialized result set.
    Rows(ResultSet),
}

impl QueryOutcome {
    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            QueryOutcome::Rows(rs) => Some(rs),
            QueryOutcome::Done(_) => None,
        }
    }
}

/// A buffered, random-access result.
#[derive(Debug)]
pub struct ResultSet {
    columns: Arc<[ColumnDefinition]>,
    column_info: Arc<ColumnInfo>,
    rows: Vec<Row>,
    more_results: bool,
}

impl ResultSet {
    pub(crate) fn new(
        columns: Arc<[ColumnDefinition]>,
        column_info: Arc<ColumnInfo>,
        rows: Vec<Row>,
        more_results: bool,
    ) -> Self {
        Self {
            columns,
            column_info,
            rows,
            more_results,
        }
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn column_info(&self) -> &Arc<ColumnInfo> {
        &self.column_info
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Did the server announce another result after this one?
    pub fn more_results(&self) -> bool {
        self.more_results
    }

    /// Open a scrollable cursor over this result.
    pub fn cursor(&self) -> crate::cursor::RowCursor<'_> {
        crate::cursor::RowCursor::new(self)
    }
}

/// A forward-only result that borrows the command channel.
///
/// The borrow is the hostage rule made visible: until the stream is
/// drained, closed, or dropped, no other command can use the connection.
/// Dropping an unfinished stream drains it best-effort.
pub struct StreamingRows<'a> {
    conn: &'a mut Connection,
    columns: Arc<[ColumnDefinition]>,
    column_info: Arc<ColumnInfo>,
    protocol: RowsProtocol,
    ctx: ConnectionContext,
    cfg: CodecConfig,
    finished: bool,
}

impl<'a> StreamingRows<'a> {
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn column_info(&self) -> &Arc<ColumnInfo> {
        &self.column_info
    }

    /// Fetch the next row, or `None` at the end of the result.
    ///
    /// A decode failure aborts the stream: the remaining rows are drained
    /// off the wire so the connection stays usable, then the error is
    /// returned.
    pub fn fetch_next(&mut self) -> Result<Option<Row>> {
        if self.finished {
            return Ok(None);
        }

        let payload = self.conn.read_packet()?;
        match payload.first() {
            None => Err(self.conn.fail(protocol_err("empty row packet"))),
            Some(0xFF) => {
                self.finished = true;
                Err(self.conn.take_server_error(&payload))
            }
            Some(0xFE) if payload.len() < MAX_FRAME_SIZE => {
                self.finished = true;
                let status = read_terminator(self.conn, &payload)?;
                self.conn.finish_command(status);
                Ok(None)
            }
            _ => {
                match decode_row(
                    &self.columns,
                    &self.column_info,
                    &payload,
                    self.protocol,
                    &self.ctx,
                    &self.cfg,
                ) {
                    Ok(row) => Ok(Some(row)),
                    Err(e) if e.is_fatal() => {
                        self.finished = true;
                        Err(self.conn.fail(e))
                    }
                    Err(e) => {
                        // Abort: get the channel back to a packet boundary.
                        self.drain()?;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Drain and discard the rest of the stream.
    pub fn close(mut self) -> Result<()> {
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        while !self.finished {
            let payload = self.conn.read_packet()?;
            match payload.first() {
                None => return Err(self.conn.fail(protocol_err("empty row packet"))),
                Some(0xFF) => {
                    self.finished = true;
                    return Err(self.conn.take_server_error(&payload));
                }
                Some(0xFE) if payload.len() < MAX_FRAME_SIZE => {
                    self.finished = true;
                    let status = read_terminator(self.conn, &payload)?;
                    self.conn.finish_command(status);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for StreamingRows<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.drain();
        }
    }
}

impl Connection {
    /// Run a text-protocol statement and buffer its result.
    pub fn query(&mut self, sql: &str) -> Result<QueryOutcome> {
        self.begin_command(Command::Query, sql.as_bytes())?;
        self.read_outcome_buffered(RowsProtocol::Text)
    }

    /// Run a text-protocol statement with `?` placeholders rendered from
    /// the binder as escaped literals.
    pub fn query_with(&mut self, sql: &str, params: &mut ParamBinder) -> Result<QueryOutcome> {
        let rendered = params.interpolate(sql, self.context())?;
        self.query(&rendered)
    }

    /// Run a text-protocol statement, yielding rows one at a time.
    pub fn query_streaming(&mut self, sql: &str) -> Result<StreamingRows<'_>> {
        self.begin_command(Command::Query, sql.as_bytes())?;
        match self.read_result_head()? {
            ResultHead::Done(_) => {
                // No rows: hand back an already-finished stream.
                let columns: Arc<[ColumnDefinition]> = Arc::from(Vec::new());
                let column_info = Arc::new(ColumnInfo::new(Vec::new()));
                Ok(self.finished_stream(columns, column_info))
            }
            ResultHead::Columns(columns) => Ok(self.start_stream(columns, RowsProtocol::Text)),
        }
    }

    /// Fetch the next sub-result of a multi-statement command, in FIFO
    /// order. Returns `None` when no further result is pending. The
    /// previous sub-result must have been fully drained.
    pub fn next_result(&mut self) -> Result<Option<QueryOutcome>> {
        if !self.has_pending_results() {
            return Ok(None);
        }
        self.resume_pending()?;
        self.read_outcome_buffered(RowsProtocol::Text).map(Some)
    }

    pub(crate) fn read_outcome_buffered(
        &mut self,
        protocol: RowsProtocol,
    ) -> Result<QueryOutcome> {
        match self.read_result_head()? {
            ResultHead::Done(ok) => Ok(QueryOutcome::Done(ok)),
            ResultHead::Columns(columns) => {
                self.materialize_buffered(columns, protocol).map(QueryOutcome::Rows)
            }
        }
    }

    /// Read the first response packet of a command and, for result sets,
    /// the column definitions.
    pub(crate) fn read_result_head(&mut self) -> Result<ResultHead> {
        let payload = self.read_packet()?;
        match payload.first() {
            None => Err(self.fail(protocol_err("empty command response"))),
            Some(0x00) => {
                let ok = self.expect_ok(&payload)?;
                self.finish_command(ok.status_flags);
                Ok(ResultHead::Done(ok))
            }
            Some(0xFF) => Err(self.take_server_error(&payload)),
            Some(0xFB) => {
                // LOCAL INFILE: decline with an empty packet, absorb the
                // server's reaction, and report the operation unsupported.
                self.write_packet_raw(&[])?;
                let reply = self.read_packet()?;
                match reply.first() {
                    Some(0xFF) => {
                        let _ = self.take_server_error(&reply);
                    }
                    _ => {
                        let mut r = WireReader::new(&reply);
                        if let Some(ok) = r.ok_packet() {
                            self.finish_command(ok.status_flags);
                        }
                    }
                }
                Err(Error::Unsupported("LOCAL INFILE transfer"))
            }
            Some(_) => {
                let mut r = WireReader::new(&payload);
                let count = r
                    .lenenc_int()
                    .ok_or_else(|| self.fail(protocol_err("malformed column count")))?;
                trace!(columns = count, "result set header");
                let columns = self.read_column_block(count as usize)?;
                Ok(ResultHead::Columns(columns))
            }
        }
    }

    /// Read `count` column definitions plus the legacy EOF separator when
    /// the peer does not speak DEPRECATE_EOF.
    pub(crate) fn read_column_block(&mut self, count: usize) -> Result<Vec<ColumnDefinition>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet()?;
            match ColumnDefinition::parse(&payload) {
                Ok(col) => columns.push(col),
                Err(e) => return Err(self.fail(e)),
            }
        }
        if count > 0 && !self.context().has_capability(capability::DEPRECATE_EOF) {
            let payload = self.read_packet()?;
            if payload.first() != Some(&0xFE) {
                return Err(self.fail(protocol_err("expected EOF after column definitions")));
            }
        }
        Ok(columns)
    }

    pub(crate) fn materialize_buffered(
        &mut self,
        columns: Vec<ColumnDefinition>,
        protocol: RowsProtocol,
    ) -> Result<ResultSet> {
        let columns: Arc<[ColumnDefinition]> = Arc::from(columns);
        let column_info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        let ctx = self.context().clone();
        let cfg = self.config().codec;

        let mut rows = Vec::new();
        loop {
            let payload = self.read_packet()?;
            match payload.first() {
                None => return Err(self.fail(protocol_err("empty row packet"))),
                Some(0xFF) => return Err(self.take_server_error(&payload)),
                Some(0xFE) if payload.len() < MAX_FRAME_SIZE => {
                    let status = read_terminator(self, &payload)?;
                    self.finish_command(status);
                    let more = self.has_pending_results();
                    trace!(rows = rows.len(), more_results = more, "result set buffered");
                    return Ok(ResultSet::new(columns, column_info, rows, more));
                }
                _ => {
                    let row = match decode_row(
                        &columns,
                        &column_info,
                        &payload,
                        protocol,
                        &ctx,
                        &cfg,
                    ) {
                        Ok(row) => row,
                        Err(e) if e.is_fatal() => return Err(self.fail(e)),
                        Err(e) => {
                            // Abort the materialization but leave the
                            // channel at a packet boundary.
                            drain_rows(self)?;
                            return Err(e);
                        }
                    };
                    rows.push(row);
                }
            }
        }
    }

    pub(crate) fn start_stream(
        &mut self,
        columns: Vec<ColumnDefinition>,
        protocol: RowsProtocol,
    ) -> StreamingRows<'_> {
        let columns: Arc<[ColumnDefinition]> = Arc::from(columns);
        let column_info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        let ctx = self.context().clone();
        let cfg = self.config().codec;
        StreamingRows {
            conn: self,
            columns,
            column_info,
            protocol,
            ctx,
            cfg,
            finished: false,
        }
    }

    pub(crate) fn finished_stream(
        &mut self,
        columns: Arc<[ColumnDefinition]>,
        column_info: Arc<ColumnInfo>,
    ) -> StreamingRows<'_> {
        let ctx = self.context().clone();
        let cfg = self.config().codec;
        StreamingRows {
            conn: self,
            columns,
            column_info,
            protocol: RowsProtocol::Text,
            ctx,
            cfg,
            finished: true,
        }
    }
}

/// Head of a command response.
pub(crate) enum ResultHead {
    Done(OkPacket),
    Columns(Vec<ColumnDefinition>),
}

/// Parse a result-set terminator (EOF packet, or an OK packet wearing the
/// 0xFE header under DEPRECATE_EOF) and return its status flags.
fn read_terminator(conn: &mut Connection, payload: &[u8]) -> Result<u16> {
    let mut r = WireReader::new(payload);
    if conn.context().has_capability(capability::DEPRECATE_EOF) {
        r.skip(1); // 0xFE header
        let ok = r
            .ok_packet()
            .ok_or_else(|| conn.fail(protocol_err("malformed result terminator")))?;
        conn.absorb_ok(&ok);
        Ok(ok.status_flags)
    } else {
        let eof = r
            .eof_packet()
            .ok_or_else(|| conn.fail(protocol_err("malformed EOF packet")))?;
        Ok(eof.status_flags)
    }
}

/// Skip remaining row packets after an abort, up to the terminator.
fn drain_rows(conn: &mut Connection) -> Result<()> {
    loop {
        let payload = conn.read_packet()?;
        match payload.first() {
            None => return Err(conn.fail(protocol_err("empty row packet"))),
            Some(0xFF) => {
                let _ = conn.take_server_error(&payload);
                return Ok(());
            }
            Some(0xFE) if payload.len() < MAX_FRAME_SIZE => {
                let status = read_terminator(conn, &payload)?;
                conn.finish_command(status);
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Decode one row packet. The column count is fixed by the header; a row
/// with too few or too many values is a protocol violation.
fn decode_row(
    columns: &[ColumnDefinition],
    column_info: &Arc<ColumnInfo>,
    payload: &[u8],
    protocol: RowsProtocol,
    ctx: &ConnectionContext,
    cfg: &CodecConfig,
) -> Result<Row> {
    let values = match protocol {
        RowsProtocol::Text => decode_text_row(columns, payload, ctx, cfg)?,
        RowsProtocol::Binary => decode_binary_row(columns, payload, ctx, cfg)?,
    };
    Ok(Row::new(Arc::clone(column_info), values))
}

fn decode_text_row(
    columns: &[ColumnDefinition],
    payload: &[u8],
    ctx: &ConnectionContext,
    cfg: &CodecConfig,
) -> Result<Vec<Value>> {
    let mut r = WireReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for col in columns {
        match read_text_cell(&mut r) {
            None => {
                return Err(protocol_err(format!(
                    "row truncated: {} of {} columns present",
                    values.len(),
                    columns.len()
                )));
            }
            Some(None) => values.push(Value::Null),
            Some(Some(raw)) => values.push(decode_text_value(col, raw, ctx, cfg)?),
        }
    }
    if !r.is_empty() {
        return Err(protocol_err("row carries more values than columns"));
    }
    Ok(values)
}

fn decode_binary_row(
    columns: &[ColumnDefinition],
    payload: &[u8],
    ctx: &ConnectionContext,
    cfg: &CodecConfig,
) -> Result<Vec<Value>> {
    let mut r = WireReader::new(payload);
    if r.u8() != Some(0x00) {
        return Err(protocol_err("binary row missing 0x00 header"));
    }

    // Null bitmap, two reserved low bits.
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = r
        .take(bitmap_len)
        .ok_or_else(|| protocol_err("binary row missing null bitmap"))?
        .to_vec();

    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(col, &mut r, ctx, cfg)?);
        }
    }
    if !r.is_empty() {
        return Err(protocol_err("binary row carries trailing bytes"));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldType, column_flags};
    use crate::connection::ServerVersion;
    use crate::protocol::WireWriter;

    fn ctx() -> ConnectionContext {
        ConnectionContext::new(capability::DEPRECATE_EOF, ServerVersion::parse("8.0.36"))
    }

    fn make_col(name: &str, field_type: FieldType, flags: u16) -> ColumnDefinition {
        ColumnDefinition {
            catalog: "def".to_string(),
            schema: "test".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: 255,
            length: 11,
            field_type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn text_row_decodes_in_order() {
        let columns = vec![
            make_col("id", FieldType::LongLong, 0),
            make_col("name", FieldType::VarString, 0),
        ];
        let mut w = WireWriter::new();
        w.lenenc_str("42");
        w.lenenc_str("ada");
        let values =
            decode_text_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default()).unwrap();
        assert_eq!(values, vec![Value::Int(42), Value::Text("ada".to_string())]);
    }

    #[test]
    fn text_row_null_marker() {
        let columns = vec![make_col("v", FieldType::VarString, 0)];
        let payload = [0xFB];
        let values =
            decode_text_row(&columns, &payload, &ctx(), &CodecConfig::default()).unwrap();
        assert_eq!(values, vec![Value::Null]);
    }

    #[test]
    fn text_row_column_count_enforced() {
        let columns = vec![
            make_col("a", FieldType::VarString, 0),
            make_col("b", FieldType::VarString, 0),
        ];

        // One value short
        let mut w = WireWriter::new();
        w.lenenc_str("only");
        let err = decode_text_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default());
        assert!(matches!(err, Err(Error::Protocol(_))));

        // One value over
        let mut w = WireWriter::new();
        w.lenenc_str("a");
        w.lenenc_str("b");
        w.lenenc_str("c");
        let err = decode_text_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default());
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[test]
    fn binary_row_null_bitmap_offset() {
        let columns = vec![
            make_col("a", FieldType::LongLong, 0),
            make_col("b", FieldType::LongLong, 0),
        ];

        // Row: header 0x00, bitmap with column 0 null (bit 2), then one
        // 8-byte value for column 1.
        let mut w = WireWriter::new();
        w.u8(0x00);
        w.u8(0b0000_0100);
        w.u64_le(7);

        let values =
            decode_binary_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default()).unwrap();
        assert_eq!(values, vec![Value::Null, Value::Int(7)]);
    }

    #[test]
    fn binary_row_trailing_bytes_rejected() {
        let columns = vec![make_col("a", FieldType::LongLong, 0)];
        let mut w = WireWriter::new();
        w.u8(0x00);
        w.u8(0);
        w.u64_le(1);
        w.u8(0xEE); // junk
        let err = decode_binary_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default());
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[test]
    fn binary_row_unsigned_widening() {
        let columns = vec![make_col("n", FieldType::Long, column_flags::UNSIGNED)];
        let mut w = WireWriter::new();
        w.u8(0x00);
        w.u8(0);
        w.u32_le(u32::MAX);
        let values =
            decode_binary_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default()).unwrap();
        assert_eq!(values, vec![Value::Int(i64::from(u32::MAX))]);
    }

    #[test]
    fn decode_failure_is_decode_error() {
        let columns = vec![make_col("d", FieldType::Date, 0)];
        let mut w = WireWriter::new();
        w.lenenc_str("not-a-date");
        let err = decode_text_row(&columns, w.as_bytes(), &ctx(), &CodecConfig::default());
        assert!(matches!(err, Err(Error::Decode(_))));
    }
}
