//! Payload reading primitives.
//!
//! All integers on the wire are little-endian. Variable-length integers use
//! the length-encoded scheme: one byte up to 250, then a 0xFC/0xFD/0xFE
//! marker followed by 2, 3, or 8 bytes. 0xFB marks NULL in row data.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// Result of reading a length-encoded integer from row data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenEnc {
    Int(u64),
    /// The 0xFB NULL marker.
    Null,
}

/// A cursor over one reassembled payload.
///
/// Primitives return `None` when the payload is exhausted; callers promote
/// that to a `ProtocolError` with the context they have.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() < n {
            return false;
        }
        self.pos += n;
        true
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Remaining bytes; empties the reader.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn u16_le(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u24_le(&mut self) -> Option<u32> {
        let b = self.take(3)?;
        Some(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn u32_le(&mut self) -> Option<u32> {
        let b = self.take(4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Option<u64> {
        let b = self.take(8)?;
        Some(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a length-encoded integer, surfacing the NULL marker.
    pub fn lenenc(&mut self) -> Option<LenEnc> {
        match self.u8()? {
            v @ 0x00..=0xFA => Some(LenEnc::Int(u64::from(v))),
            0xFB => Some(LenEnc::Null),
            0xFC => self.u16_le().map(|v| LenEnc::Int(u64::from(v))),
            0xFD => self.u24_le().map(|v| LenEnc::Int(u64::from(v))),
            0xFE => self.u64_le().map(LenEnc::Int),
            0xFF => None,
        }
    }

    /// Read a length-encoded integer where NULL is not legal.
    pub fn lenenc_int(&mut self) -> Option<u64> {
        match self.lenenc()? {
            LenEnc::Int(v) => Some(v),
            LenEnc::Null => None,
        }
    }

    /// Read a length-prefixed byte slice.
    pub fn lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.lenenc_int()? as usize;
        self.take(len)
    }

    /// Read a length-prefixed string (lossy UTF-8).
    pub fn lenenc_str(&mut self) -> Option<String> {
        self.lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a NUL-terminated string, consuming the terminator.
    pub fn cstr(&mut self) -> Option<String> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Some(s)
    }

    /// Read `len` bytes as a lossy UTF-8 string.
    pub fn str_fixed(&mut self, len: usize) -> Option<String> {
        self.take(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Remaining bytes as a lossy UTF-8 string; empties the reader.
    pub fn str_rest(&mut self) -> String {
        String::from_utf8_lossy(self.take_rest()).into_owned()
    }

    /// Decode an OK payload (0x00 marker optional at the cursor).
    pub fn ok_packet(&mut self) -> Option<OkPacket> {
        if self.peek() == Some(0x00) {
            self.skip(1);
        }
        let affected_rows = self.lenenc_int()?;
        let last_insert_id = self.lenenc_int()?;
        let status_flags = self.u16_le()?;
        let warnings = self.u16_le()?;
        let info = if self.is_empty() {
            String::new()
        } else {
            self.str_rest()
        };
        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Decode an ERR payload (0xFF marker optional at the cursor).
    ///
    /// Protocol 4.1 servers prefix the message with `#` and a 5-byte
    /// SQLSTATE; older or progress packets may omit it.
    pub fn err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }
        let code = self.u16_le()?;
        let sqlstate = if self.peek() == Some(b'#') {
            self.skip(1);
            self.str_fixed(5)?
        } else {
            String::new()
        };
        Some(ErrPacket {
            code,
            sqlstate,
            message: self.str_rest(),
        })
    }

    /// Decode an EOF payload (0xFE marker optional at the cursor).
    pub fn eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }
        let warnings = self.u16_le()?;
        let status_flags = self.u16_le()?;
        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_integers() {
        let mut r = WireReader::new(&[0x01, 0x34, 0x12, 0x56, 0x34, 0x12]);
        assert_eq!(r.u8(), Some(0x01));
        assert_eq!(r.u16_le(), Some(0x1234));
        assert_eq!(r.u24_le(), Some(0x0012_3456));
        assert_eq!(r.u8(), None);
    }

    #[test]
    fn u64_and_exhaustion() {
        let mut r = WireReader::new(&[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(r.u64_le(), Some(1));
        assert!(r.is_empty());
        assert_eq!(r.u64_le(), None);
    }

    #[test]
    fn lenenc_all_widths() {
        let mut r = WireReader::new(&[0xFA]);
        assert_eq!(r.lenenc(), Some(LenEnc::Int(0xFA)));

        let mut r = WireReader::new(&[0xFC, 0xCD, 0xAB]);
        assert_eq!(r.lenenc(), Some(LenEnc::Int(0xABCD)));

        let mut r = WireReader::new(&[0xFD, 0x01, 0x02, 0x03]);
        assert_eq!(r.lenenc(), Some(LenEnc::Int(0x0003_0201)));

        let mut r = WireReader::new(&[0xFE, 8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(r.lenenc(), Some(LenEnc::Int(0x0102_0304_0506_0708)));
    }

    #[test]
    fn lenenc_null_marker() {
        let mut r = WireReader::new(&[0xFB]);
        assert_eq!(r.lenenc(), Some(LenEnc::Null));

        let mut r = WireReader::new(&[0xFB]);
        assert_eq!(r.lenenc_int(), None);
    }

    #[test]
    fn cstr_pair() {
        let mut r = WireReader::new(b"8.0.36\0mysql_native_password\0");
        assert_eq!(r.cstr().as_deref(), Some("8.0.36"));
        assert_eq!(r.cstr().as_deref(), Some("mysql_native_password"));
        assert!(r.is_empty());
    }

    #[test]
    fn lenenc_str() {
        let mut r = WireReader::new(&[0x03, b'd', b'e', b'f']);
        assert_eq!(r.lenenc_str().as_deref(), Some("def"));
    }

    #[test]
    fn ok_payload() {
        let payload = [0x00, 0x03, 0x09, 0x22, 0x00, 0x01, 0x00];
        let mut r = WireReader::new(&payload);
        let ok = r.ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 9);
        assert_eq!(ok.status_flags, 0x22);
        assert_eq!(ok.warnings, 1);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn err_payload_with_sqlstate() {
        let mut payload = vec![0xFF, 0x15, 0x04, b'#'];
        payload.extend_from_slice(b"28000");
        payload.extend_from_slice(b"Access denied for user");
        let mut r = WireReader::new(&payload);
        let err = r.err_packet().unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sqlstate, "28000");
        assert_eq!(err.message, "Access denied for user");
    }

    #[test]
    fn err_payload_without_sqlstate() {
        let mut payload = vec![0xFF, 0xE9, 0x03];
        payload.extend_from_slice(b"too many connections");
        let mut r = WireReader::new(&payload);
        let err = r.err_packet().unwrap();
        assert_eq!(err.code, 1001);
        assert!(err.sqlstate.is_empty());
    }

    #[test]
    fn eof_payload() {
        let mut r = WireReader::new(&[0xFE, 0x02, 0x00, 0x08, 0x00]);
        let eof = r.eof_packet().unwrap();
        assert_eq!(eof.warnings, 2);
        assert!(eof.more_results());
    }
}
