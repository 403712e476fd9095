//! Distributed (XA) transaction commands.
//!
//! Every two-phase-commit operation maps 1:1 onto an `XA <VERB>` text
//! command carrying the xid rendered as `0x<gtrid>,0x<bqual>,<formatId>`
//! in hex. The server's XA error codes (1397–1402) translate into typed
//! [`XaErrorCode`]s at this boundary; anything else surfaces the server's
//! own message.

#![allow(clippy::result_large_err)]

use std::fmt;

use mariner_core::error::{Error, ServerError, XaErrorCode};
use mariner_core::row::Row;

use crate::connection::Connection;
use crate::result::QueryOutcome;

/// Maximum length of a global transaction id or branch qualifier.
pub const MAX_XID_PART: usize = 64;

/// Scan flags for [`XaSession::recover`].
pub mod recover_flags {
    pub const NO_FLAGS: u32 = 0;
    /// Start a new recovery scan
    pub const START_SCAN: u32 = 0x0100_0000;
    /// End the current recovery scan
    pub const END_SCAN: u32 = 0x0080_0000;
}

/// A distributed transaction id: format id, global transaction id, and
/// branch qualifier. Pure value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    /// Build an xid. Both byte parts are capped at 64 bytes.
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Result<Self, XaError> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if gtrid.len() > MAX_XID_PART || bqual.len() > MAX_XID_PART {
            return Err(XaError::InvalidXid(format!(
                "xid parts limited to {MAX_XID_PART} bytes (gtrid {}, bqual {})",
                gtrid.len(),
                bqual.len()
            )));
        }
        Ok(Self {
            format_id,
            gtrid,
            bqual,
        })
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// The wire rendering used in every XA command.
    pub fn render(&self) -> String {
        format!(
            "0x{},0x{},{}",
            hex(&self.gtrid),
            hex(&self.bqual),
            self.format_id
        )
    }
}

fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Modifier for `XA START`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XaStartMode {
    #[default]
    New,
    Join,
    Resume,
}

/// Modifier for `XA END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XaEndMode {
    #[default]
    Success,
    Suspend,
}

/// Failures from XA operations.
#[derive(Debug)]
pub enum XaError {
    /// A server XA error code, translated
    Code(XaErrorCode, ServerError),
    /// A server error outside the XA range; the raw message is carried
    Server(ServerError),
    /// Transport, protocol, or client-side failure
    Client(Error),
    /// Malformed xid input or recover row
    InvalidXid(String),
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XaError::Code(code, err) => write!(f, "{code:?}: {}", err.message),
            XaError::Server(err) => write!(f, "{err}"),
            XaError::Client(err) => write!(f, "{err}"),
            XaError::InvalidXid(msg) => write!(f, "invalid xid: {msg}"),
        }
    }
}

impl std::error::Error for XaError {}

impl From<Error> for XaError {
    fn from(err: Error) -> Self {
        match err {
            Error::Server(server) => match server.xa_code() {
                Some(code) => XaError::Code(code, server),
                None => XaError::Server(server),
            },
            other => XaError::Client(other),
        }
    }
}

/// XA command surface over one connection.
pub struct XaSession<'a> {
    conn: &'a mut Connection,
}

impl<'a> XaSession<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// `XA START <xid>`, optionally with JOIN or RESUME.
    pub fn start(&mut self, xid: &Xid, mode: XaStartMode) -> Result<(), XaError> {
        let suffix = match mode {
            XaStartMode::New => "",
            XaStartMode::Join => " JOIN",
            XaStartMode::Resume => " RESUME",
        };
        self.run(format!("XA START {}{}", xid.render(), suffix))
    }

    /// `XA END <xid>`, optionally with SUSPEND.
    pub fn end(&mut self, xid: &Xid, mode: XaEndMode) -> Result<(), XaError> {
        let suffix = match mode {
            XaEndMode::Success => "",
            XaEndMode::Suspend => " SUSPEND",
        };
        self.run(format!("XA END {}{}", xid.render(), suffix))
    }

    /// `XA PREPARE <xid>`: first phase.
    pub fn prepare(&mut self, xid: &Xid) -> Result<(), XaError> {
        self.run(format!("XA PREPARE {}", xid.render()))
    }

    /// `XA COMMIT <xid>`: second phase, or both at once with `one_phase`.
    pub fn commit(&mut self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        let suffix = if one_phase { " ONE PHASE" } else { "" };
        self.run(format!("XA COMMIT {}{}", xid.render(), suffix))
    }

    /// `XA ROLLBACK <xid>`.
    pub fn rollback(&mut self, xid: &Xid) -> Result<(), XaError> {
        self.run(format!("XA ROLLBACK {}", xid.render()))
    }

    /// `XA FORGET <xid>`: discard a heuristically completed branch.
    pub fn forget(&mut self, xid: &Xid) -> Result<(), XaError> {
        self.run(format!("XA FORGET {}", xid.render()))
    }

    /// `XA RECOVER`: list prepared transactions.
    ///
    /// Without the start-scan flag this is a continuation of a scan the
    /// protocol has no cursor for, so the list is empty by definition.
    pub fn recover(&mut self, flags: u32) -> Result<Vec<Xid>, XaError> {
        if flags & recover_flags::START_SCAN == 0 {
            return Ok(Vec::new());
        }

        let outcome = self.conn.query("XA RECOVER")?;
        let result = match outcome {
            QueryOutcome::Rows(rs) => rs,
            QueryOutcome::Done(_) => return Ok(Vec::new()),
        };

        result.rows().iter().map(parse_recover_row).collect()
    }

    fn run(&mut self, sql: String) -> Result<(), XaError> {
        self.conn.query(&sql)?;
        Ok(())
    }
}

/// Decode one `XA RECOVER` row:
/// `(formatId, gtrid_length, bqual_length, data)`, where `data` packs the
/// gtrid followed by the bqual.
pub(crate) fn parse_recover_row(row: &Row) -> Result<Xid, XaError> {
    let bad = |what: &str| XaError::InvalidXid(format!("recover row: {what}"));

    let format_id = row
        .get(0)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad("missing format id"))?;
    let len1 = row
        .get(1)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad("missing gtrid length"))?;
    let len2 = row
        .get(2)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad("missing bqual length"))?;
    let data = row
        .get(3)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| bad("missing xid data"))?;

    let (Ok(len1), Ok(len2)) = (usize::try_from(len1), usize::try_from(len2)) else {
        return Err(bad("negative xid part length"));
    };
    if len1 > MAX_XID_PART || len2 > MAX_XID_PART || data.len() < len1 + len2 {
        return Err(bad("xid part lengths exceed the packed data"));
    }

    let format_id =
        i32::try_from(format_id).map_err(|_| bad("format id out of range"))?;
    Xid::new(format_id, &data[..len1], &data[len1..len1 + len2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mariner_core::row::ColumnInfo;
    use mariner_core::value::Value;

    #[test]
    fn xid_renders_hex_parts() {
        let xid = Xid::new(1, b"tx-1".to_vec(), b"b".to_vec()).unwrap();
        assert_eq!(xid.render(), "0x74782D31,0x62,1");

        let negative = Xid::new(-4, vec![0xFF], vec![0x00]).unwrap();
        assert_eq!(negative.render(), "0xFF,0x00,-4");
    }

    #[test]
    fn xid_rejects_oversized_parts() {
        assert!(Xid::new(1, vec![0u8; 65], vec![]).is_err());
        assert!(Xid::new(1, vec![], vec![0u8; 65]).is_err());
        assert!(Xid::new(1, vec![0u8; 64], vec![0u8; 64]).is_ok());
    }

    #[test]
    fn server_code_translation() {
        let server = ServerError {
            code: 1397,
            sqlstate: "XAE04".to_string(),
            message: "XAER_NOTA: Unknown XID".to_string(),
        };
        match XaError::from(Error::Server(server)) {
            XaError::Code(XaErrorCode::XaerNota, _) => {}
            other => panic!("expected XAER_NOTA, got {other}"),
        }

        // Unmapped codes keep the raw server message
        let server = ServerError {
            code: 1064,
            sqlstate: "42000".to_string(),
            message: "syntax error".to_string(),
        };
        match XaError::from(Error::Server(server)) {
            XaError::Server(err) => assert_eq!(err.message, "syntax error"),
            other => panic!("expected raw server error, got {other}"),
        }
    }

    fn recover_row(format_id: i64, len1: i64, len2: i64, data: Vec<u8>) -> Row {
        let info = Arc::new(ColumnInfo::new(vec![
            "formatID".to_string(),
            "gtrid_length".to_string(),
            "bqual_length".to_string(),
            "data".to_string(),
        ]));
        Row::new(
            info,
            vec![
                Value::Int(format_id),
                Value::Int(len1),
                Value::Int(len2),
                Value::Bytes(data),
            ],
        )
    }

    #[test]
    fn recover_row_splits_packed_bytes() {
        let row = recover_row(1, 4, 4, b"ABCDEFGH".to_vec());
        let xid = parse_recover_row(&row).unwrap();
        assert_eq!(xid.format_id(), 1);
        assert_eq!(xid.gtrid(), b"ABCD");
        assert_eq!(xid.bqual(), b"EFGH");
    }

    #[test]
    fn recover_row_length_validation() {
        // Lengths larger than the packed payload
        let row = recover_row(1, 10, 10, b"short".to_vec());
        assert!(matches!(
            parse_recover_row(&row),
            Err(XaError::InvalidXid(_))
        ));

        let row = recover_row(1, -1, 0, Vec::new());
        assert!(matches!(
            parse_recover_row(&row),
            Err(XaError::InvalidXid(_))
        ));
    }

    #[test]
    fn recover_row_accepts_text_data() {
        // Servers may send the packed column as text
        let info = Arc::new(ColumnInfo::new(vec![
            "formatID".to_string(),
            "gtrid_length".to_string(),
            "bqual_length".to_string(),
            "data".to_string(),
        ]));
        let row = Row::new(
            info,
            vec![
                Value::Int(7),
                Value::Int(2),
                Value::Int(1),
                Value::Text("abc".to_string()),
            ],
        );
        let xid = parse_recover_row(&row).unwrap();
        assert_eq!(xid.gtrid(), b"ab");
        assert_eq!(xid.bqual(), b"c");
        assert_eq!(xid.format_id(), 7);
    }
}
