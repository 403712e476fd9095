//! Cursor navigation over materialized results.
//!
//! A buffered result supports full scrolling with a position ranging over
//! `[-1, row_count]`, where −1 is before-first and `row_count` is
//! after-last. A streaming result only moves forward; every other motion
//! is an unsupported operation.

#![allow(clippy::result_large_err)]

use mariner_core::error::{Error, Result};
use mariner_core::row::Row;

use crate::result::{ResultSet, StreamingRows};

/// A scrollable cursor over a buffered [`ResultSet`].
#[derive(Debug)]
pub struct RowCursor<'a> {
    result: &'a ResultSet,
    /// Position in `[-1, row_count]`
    pos: i64,
}

impl<'a> RowCursor<'a> {
    pub(crate) fn new(result: &'a ResultSet) -> Self {
        Self { result, pos: -1 }
    }

    fn row_count(&self) -> i64 {
        self.result.row_count() as i64
    }

    /// Current position: −1 before-first, `row_count` after-last.
    pub fn position(&self) -> i64 {
        self.pos
    }

    pub fn is_before_first(&self) -> bool {
        self.pos == -1
    }

    pub fn is_after_last(&self) -> bool {
        self.pos == self.row_count()
    }

    fn on_row(&self) -> bool {
        self.pos >= 0 && self.pos < self.row_count()
    }

    /// The row under the cursor, if any.
    pub fn row(&self) -> Option<&'a Row> {
        if self.on_row() {
            self.result.row(self.pos as usize)
        } else {
            None
        }
    }

    /// Move to the first row. False on an empty result.
    pub fn first(&mut self) -> bool {
        if self.result.is_empty() {
            self.pos = -1;
            false
        } else {
            self.pos = 0;
            true
        }
    }

    /// Move to the last row. False on an empty result.
    pub fn last(&mut self) -> bool {
        if self.result.is_empty() {
            self.pos = -1;
            false
        } else {
            self.pos = self.row_count() - 1;
            true
        }
    }

    /// Absolute positioning: `n >= 1` counts from the start, `n < 0` from
    /// the end (`absolute(-1)` is the last row), and `n == 0` lands
    /// before-first. Out-of-range targets clamp to before-first or
    /// after-last; the return value says whether the cursor ended on a
    /// valid row.
    pub fn absolute(&mut self, n: i64) -> bool {
        let target = if n > 0 {
            n - 1
        } else if n < 0 {
            self.row_count() + n
        } else {
            -1
        };

        self.pos = target.clamp(-1, self.row_count());
        self.on_row()
    }

    /// Relative motion. `relative(0)` never moves and reports whether the
    /// cursor is on a valid row. A move that would leave
    /// `[-1, row_count]` is rejected: the position is unchanged and the
    /// call returns false.
    pub fn relative(&mut self, delta: i64) -> bool {
        if delta == 0 {
            return self.on_row();
        }
        let target = self.pos + delta;
        if target < -1 || target > self.row_count() {
            return false;
        }
        self.pos = target;
        self.on_row()
    }

    /// Single step forward.
    pub fn next(&mut self) -> bool {
        self.relative(1)
    }

    /// Single step backward.
    pub fn previous(&mut self) -> bool {
        self.relative(-1)
    }
}

/// A forward-only cursor over a streaming result.
///
/// Only [`next`](ForwardCursor::next) advances; every scrolling operation
/// fails with `UnsupportedOperation` without touching the stream.
pub struct ForwardCursor<'a> {
    rows: StreamingRows<'a>,
    current: Option<Row>,
}

impl<'a> ForwardCursor<'a> {
    pub fn new(rows: StreamingRows<'a>) -> Self {
        Self {
            rows,
            current: None,
        }
    }

    /// Advance to the next row; false once the stream is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.current = self.rows.fetch_next()?;
        Ok(self.current.is_some())
    }

    /// The row under the cursor.
    pub fn row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn first(&mut self) -> Result<bool> {
        Err(Error::Unsupported("first() on a forward-only cursor"))
    }

    pub fn last(&mut self) -> Result<bool> {
        Err(Error::Unsupported("last() on a forward-only cursor"))
    }

    pub fn absolute(&mut self, _n: i64) -> Result<bool> {
        Err(Error::Unsupported("absolute() on a forward-only cursor"))
    }

    pub fn relative(&mut self, _delta: i64) -> Result<bool> {
        Err(Error::Unsupported("relative() on a forward-only cursor"))
    }

    pub fn previous(&mut self) -> Result<bool> {
        Err(Error::Unsupported("previous() on a forward-only cursor"))
    }

    /// Drain the remaining rows and release the connection.
    pub fn close(self) -> Result<()> {
        self.rows.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mariner_core::row::ColumnInfo;
    use mariner_core::value::Value;

    use crate::codec::{ColumnDefinition, FieldType};
    use crate::result::ResultSet;

    fn result_with(n: usize) -> ResultSet {
        let column = ColumnDefinition {
            catalog: "def".to_string(),
            schema: "test".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: "n".to_string(),
            org_name: "n".to_string(),
            charset: 255,
            length: 20,
            field_type: FieldType::LongLong,
            flags: 0,
            decimals: 0,
        };
        let info = Arc::new(ColumnInfo::new(vec!["n".to_string()]));
        let rows = (0..n)
            .map(|i| Row::new(Arc::clone(&info), vec![Value::Int(i as i64)]))
            .collect();
        ResultSet::new(Arc::from(vec![column]), info, rows, false)
    }

    fn value_at(cursor: &RowCursor<'_>) -> Option<i64> {
        cursor.row().and_then(|r| r.get(0)).and_then(Value::as_i64)
    }

    #[test]
    fn starts_before_first() {
        let rs = result_with(3);
        let cursor = rs.cursor();
        assert!(cursor.is_before_first());
        assert!(cursor.row().is_none());
    }

    #[test]
    fn first_and_last() {
        let rs = result_with(3);
        let mut cursor = rs.cursor();
        assert!(cursor.first());
        assert_eq!(value_at(&cursor), Some(0));
        assert!(cursor.last());
        assert_eq!(value_at(&cursor), Some(2));
    }

    #[test]
    fn first_and_last_on_empty() {
        let rs = result_with(0);
        let mut cursor = rs.cursor();
        assert!(!cursor.first());
        assert!(!cursor.last());
        assert!(cursor.row().is_none());
    }

    #[test]
    fn absolute_matches_first_and_last() {
        let rs = result_with(4);
        let mut a = rs.cursor();
        let mut b = rs.cursor();

        assert_eq!(a.absolute(1), b.first());
        assert_eq!(a.position(), b.position());

        assert_eq!(a.absolute(-1), b.last());
        assert_eq!(a.position(), b.position());
    }

    #[test]
    fn absolute_clamps_out_of_range() {
        let rs = result_with(3);
        let mut cursor = rs.cursor();

        assert!(!cursor.absolute(10));
        assert!(cursor.is_after_last());

        assert!(!cursor.absolute(-10));
        assert!(cursor.is_before_first());

        assert!(!cursor.absolute(0));
        assert!(cursor.is_before_first());
    }

    #[test]
    fn absolute_negative_counts_from_end() {
        let rs = result_with(5);
        let mut cursor = rs.cursor();
        assert!(cursor.absolute(-2));
        assert_eq!(value_at(&cursor), Some(3));
    }

    #[test]
    fn relative_zero_is_a_no_op() {
        let rs = result_with(3);
        let mut cursor = rs.cursor();

        assert!(!cursor.relative(0));
        assert!(cursor.is_before_first());

        cursor.first();
        let pos = cursor.position();
        assert!(cursor.relative(0));
        assert_eq!(cursor.position(), pos);
    }

    #[test]
    fn relative_rejects_out_of_range() {
        let rs = result_with(3);
        let mut cursor = rs.cursor();
        cursor.first();

        // 0 + 5 > row_count: rejected, position unchanged
        assert!(!cursor.relative(5));
        assert_eq!(cursor.position(), 0);

        // A move to exactly after-last is allowed and reports no row
        assert!(!cursor.relative(3));
        assert!(cursor.is_after_last());

        // From after-last, -5 would pass before-first: rejected
        assert!(!cursor.relative(-5));
        assert!(cursor.is_after_last());
    }

    #[test]
    fn next_and_previous_walk() {
        let rs = result_with(2);
        let mut cursor = rs.cursor();

        assert!(cursor.next());
        assert_eq!(value_at(&cursor), Some(0));
        assert!(cursor.next());
        assert_eq!(value_at(&cursor), Some(1));
        assert!(!cursor.next());
        assert!(cursor.is_after_last());

        assert!(cursor.previous());
        assert_eq!(value_at(&cursor), Some(1));
        assert!(cursor.previous());
        assert!(!cursor.previous());
        assert!(cursor.is_before_first());
    }
}
