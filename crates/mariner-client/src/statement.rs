//! Server-side prepared statements.
//!
//! A statement is parsed once with COM_STMT_PREPARE, executed any number
//! of times with different parameters, and deallocated with
//! COM_STMT_CLOSE. A handle only means something to the connection that
//! prepared it, and a server-side reset throws every handle away. The
//! registry never re-prepares behind the caller's back: a stale handle
//! surfaces as server error 1243 (`ServerError::is_stale_statement`) and
//! the caller decides whether to prepare again.

#![allow(clippy::result_large_err)]

use tracing::debug;

use mariner_core::error::{EncodeError, Error, Result};

use crate::codec::ColumnDefinition;
use crate::connection::{Connection, protocol_err};
use crate::params::{
    BinaryParam, ParamBinder, ParamHolder, build_execute_payload, build_long_data_payload,
    stream_chunks,
};
use crate::protocol::{Command, WireReader, WireWriter};
use crate::result::{QueryOutcome, ResultHead, RowsProtocol, StreamingRows};

/// A server-assigned prepared statement handle.
///
/// Valid only while the owning connection is open; connection loss or a
/// session reset invalidates it server-side.
#[derive(Debug)]
pub struct StatementHandle {
    id: u32,
    param_count: u16,
    columns: Vec<ColumnDefinition>,
    closed: bool,
}

impl StatementHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of `?` placeholders the statement expects.
    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    /// Result column definitions, empty for row-less statements.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// A binder sized for this statement's parameters.
    pub fn binder(&self) -> ParamBinder {
        ParamBinder::new(self.param_count)
    }
}

/// The fixed head of a COM_STMT_PREPARE response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    #[allow(dead_code)]
    pub warnings: u16,
}

pub(crate) fn parse_prepare_ok(payload: &[u8]) -> Option<PrepareOk> {
    let mut r = WireReader::new(payload);
    if r.u8()? != 0x00 {
        return None;
    }
    let statement_id = r.u32_le()?;
    let num_columns = r.u16_le()?;
    let num_params = r.u16_le()?;
    r.skip(1); // reserved
    let warnings = r.u16_le().unwrap_or(0);
    Some(PrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

impl Connection {
    /// Parse `sql` server-side, allocating a reusable handle.
    pub fn prepare(&mut self, sql: &str) -> Result<StatementHandle> {
        self.begin_command(Command::StmtPrepare, sql.as_bytes())?;

        let payload = self.read_packet()?;
        match payload.first() {
            Some(0x00) => {}
            Some(0xFF) => return Err(self.take_server_error(&payload)),
            _ => return Err(self.fail(protocol_err("malformed prepare response"))),
        }
        let head = parse_prepare_ok(&payload)
            .ok_or_else(|| self.fail(protocol_err("malformed prepare response")))?;

        // Parameter definitions come first; their content is only type
        // hints, so the definitions are read and dropped.
        let _params = self.read_column_block(usize::from(head.num_params))?;
        let columns = self.read_column_block(usize::from(head.num_columns))?;

        let status = self.context().status_flags;
        self.finish_command(status);

        debug!(
            statement_id = head.statement_id,
            params = head.num_params,
            columns = head.num_columns,
            "statement prepared"
        );
        Ok(StatementHandle {
            id: head.statement_id,
            param_count: head.num_params,
            columns,
            closed: false,
        })
    }

    /// Execute a prepared statement, buffering any result set.
    ///
    /// The binder must have every one of the handle's parameters bound;
    /// holders are consumed by the execution.
    pub fn execute(
        &mut self,
        handle: &StatementHandle,
        params: &mut ParamBinder,
    ) -> Result<QueryOutcome> {
        self.send_execute(handle, params)?;
        self.read_outcome_buffered(RowsProtocol::Binary)
    }

    /// Execute a prepared statement, yielding rows one at a time.
    pub fn execute_streaming(
        &mut self,
        handle: &StatementHandle,
        params: &mut ParamBinder,
    ) -> Result<StreamingRows<'_>> {
        self.send_execute(handle, params)?;
        match self.read_result_head()? {
            ResultHead::Done(_) => {
                let columns: std::sync::Arc<[ColumnDefinition]> =
                    std::sync::Arc::from(Vec::new());
                let column_info =
                    std::sync::Arc::new(mariner_core::row::ColumnInfo::new(Vec::new()));
                Ok(self.finished_stream(columns, column_info))
            }
            ResultHead::Columns(columns) => Ok(self.start_stream(columns, RowsProtocol::Binary)),
        }
    }

    fn send_execute(&mut self, handle: &StatementHandle, params: &mut ParamBinder) -> Result<()> {
        if handle.closed {
            return Err(Error::Unsupported("execute on a closed statement handle"));
        }
        if params.len() != usize::from(handle.param_count) {
            return Err(Error::Encode(EncodeError {
                message: format!(
                    "statement expects {} parameters, binder holds {}",
                    handle.param_count,
                    params.len()
                ),
            }));
        }

        let holders = params.take_all()?;

        // Stream holders travel ahead of the execute packet.
        let mut encoded = Vec::with_capacity(holders.len());
        for (index, holder) in holders.into_iter().enumerate() {
            if holder.is_stream() {
                let (field_type, _) = holder.declared_type();
                self.send_long_data(handle.id, index as u16, holder)?;
                encoded.push(BinaryParam::LongData(field_type));
            } else {
                encoded.push(match holder {
                    ParamHolder::Null => BinaryParam::Null,
                    ParamHolder::Scalar(v) => BinaryParam::Inline(v),
                    ParamHolder::Bytes(b) => {
                        BinaryParam::Inline(mariner_core::value::Value::Bytes(b))
                    }
                    ParamHolder::TextStream(..) | ParamHolder::BinaryStream(..) => unreachable!(),
                });
            }
        }

        let payload = build_execute_payload(handle.id, &encoded)?;
        self.begin_command(Command::StmtExecute, &payload)
    }

    /// Push one stream parameter as COM_STMT_SEND_LONG_DATA chunks.
    fn send_long_data(&mut self, statement_id: u32, index: u16, holder: ParamHolder) -> Result<()> {
        let (mut source, length) = match holder {
            ParamHolder::TextStream(s, l) | ParamHolder::BinaryStream(s, l) => (s, l),
            _ => return Err(protocol_err("long data requested for a non-stream holder")),
        };

        // Each chunk goes out as its own command packet; a Known-length
        // source is never held in memory whole.
        stream_chunks(&mut *source, length, |chunk| {
            let payload = build_long_data_payload(statement_id, index, chunk);
            self.send_command_no_reply(Command::StmtSendLongData, &payload)
        })
    }

    /// Deallocate a prepared statement. Closing an already-closed handle
    /// is a no-op. The server sends no reply.
    pub fn close_statement(&mut self, handle: &mut StatementHandle) -> Result<()> {
        if handle.closed {
            return Ok(());
        }
        let mut w = WireWriter::with_capacity(4);
        w.u32_le(handle.id);
        self.send_command_no_reply(Command::StmtClose, w.as_bytes())?;
        handle.closed = true;
        debug!(statement_id = handle.id, "statement closed");
        Ok(())
    }

    /// Discard long data accumulated for the statement server-side.
    pub fn reset_statement(&mut self, handle: &StatementHandle) -> Result<()> {
        if handle.closed {
            return Err(Error::Unsupported("reset on a closed statement handle"));
        }
        let mut w = WireWriter::with_capacity(4);
        w.u32_le(handle.id);
        self.begin_command(Command::StmtReset, w.as_bytes())?;
        let payload = self.read_packet()?;
        let ok = self.expect_ok(&payload)?;
        self.finish_command(ok.status_flags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_ok_layout() {
        let payload = [
            0x00, // status
            0x2A, 0x00, 0x00, 0x00, // statement id 42
            0x02, 0x00, // two result columns
            0x03, 0x00, // three parameters
            0x00, // reserved
            0x01, 0x00, // one warning
        ];
        let head = parse_prepare_ok(&payload).unwrap();
        assert_eq!(head.statement_id, 42);
        assert_eq!(head.num_columns, 2);
        assert_eq!(head.num_params, 3);
        assert_eq!(head.warnings, 1);
    }

    #[test]
    fn prepare_ok_rejects_error_status() {
        let payload = [0xFF, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(parse_prepare_ok(&payload).is_none());
        assert!(parse_prepare_ok(&[0x00, 0x01]).is_none());
    }

    #[test]
    fn handle_binder_is_sized() {
        let handle = StatementHandle {
            id: 1,
            param_count: 3,
            columns: Vec::new(),
            closed: false,
        };
        let binder = handle.binder();
        assert_eq!(binder.len(), 3);
        assert!(!binder.is_complete());
    }
}
