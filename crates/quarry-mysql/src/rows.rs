//! Binary result-row iteration.
//!
//! All variable-length field bodies for one row land contiguously in the
//! connection-owned row buffer; slots record offsets into it. The views
//! handed to the caller borrow that buffer, so they are valid only until
//! the next `next()` or `close()`. Callers keeping bytes must copy them.

use quarry_core::Result;

use crate::protocol::{codec, protocol_err, wire_err};
use crate::statement::Statement;

/// Connection-owned backing storage for the current row.
pub(crate) struct RowBuffer {
    /// Variable-length field bodies, packed back to back
    pub buf: Vec<u8>,
    /// One decoded slot per column
    pub slots: Vec<Slot>,
}

impl RowBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Forget the previous row. Capacity is kept for reuse.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.slots.clear();
    }
}

/// A decoded field, with byte bodies stored as offsets into the row
/// buffer so decoding never allocates per field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Slot {
    Null,
    Int(i64),
    Double(f64),
    Bytes { start: usize, end: usize },
    Timestamp(i64),
}

/// A field value borrowed from the row iterator.
///
/// `Bytes` aliases the connection's row buffer and is invalidated by the
/// next row; the borrow checker enforces the lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinValue<'a> {
    /// SQL NULL
    Null,
    /// Any integer column, widened per its signedness
    Int(i64),
    /// FLOAT or DOUBLE, widened to f64
    Double(f64),
    /// String, decimal, and blob families
    Bytes(&'a [u8]),
    /// Temporal columns as UTC microseconds since the Unix epoch
    Timestamp(i64),
}

/// Streaming iterator over the rows of one query.
pub struct Rows<'s, 'c> {
    stmt: &'s mut Statement<'c>,
    done: bool,
}

impl<'s, 'c> Rows<'s, 'c> {
    pub(crate) fn new(stmt: &'s mut Statement<'c>, exhausted: bool) -> Self {
        stmt.conn.row.reset();
        Self {
            stmt,
            done: exhausted,
        }
    }

    /// Result column names, `table.column` where the server reported a
    /// result table.
    pub fn columns(&self) -> Vec<String> {
        self.stmt
            .columns
            .iter()
            .map(|field| field.name.clone())
            .collect()
    }

    /// Number of result columns.
    pub fn column_count(&self) -> usize {
        self.stmt.columns.len()
    }

    /// Advance to the next row. Returns `false` once the row stream is
    /// exhausted; the previous row's values are invalidated either way.
    pub fn next(&mut self) -> Result<bool> {
        match self.next_inner() {
            Ok(more) => Ok(more),
            Err(err) => Err(self.stmt.conn.poison(err)),
        }
    }

    /// The value of column `idx` in the current row.
    pub fn get(&self, idx: usize) -> Option<BinValue<'_>> {
        let slot = self.stmt.conn.row.slots.get(idx)?;
        Some(match *slot {
            Slot::Null => BinValue::Null,
            Slot::Int(v) => BinValue::Int(v),
            Slot::Double(v) => BinValue::Double(v),
            Slot::Timestamp(v) => BinValue::Timestamp(v),
            Slot::Bytes { start, end } => BinValue::Bytes(&self.stmt.conn.row.buf[start..end]),
        })
    }

    /// All values of the current row in column order.
    pub fn values(&self) -> Vec<BinValue<'_>> {
        (0..self.stmt.conn.row.slots.len())
            .map(|i| self.get(i).unwrap_or(BinValue::Null))
            .collect()
    }

    /// Drain the rest of the row stream and release the connection.
    pub fn close(self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        match self.stmt.conn.skip_until_eof() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.stmt.conn.poison(err)),
        }
    }

    fn next_inner(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        let stmt = &mut *self.stmt;
        let columns = &stmt.columns;
        let conn = &mut *stmt.conn;

        conn.advance()?;
        let first = conn.read_reply_byte()?;

        if conn.at_eof_packet(first) {
            conn.framer.drain_message().map_err(wire_err)?;
            conn.row.reset();
            self.done = true;
            return Ok(false);
        }
        if first != 0x00 {
            return Err(protocol_err(format!(
                "unexpected leading byte 0x{first:02X} of binary row"
            )));
        }

        // NULL bitmap, offset by two bits reserved for OK/EOF
        // disambiguation.
        let bitmap_len = (columns.len() + 2).div_ceil(8);
        conn.scratch.clear();
        conn.scratch.resize(bitmap_len, 0);
        {
            let (framer, scratch) = (&mut conn.framer, &mut conn.scratch);
            std::io::Read::read_exact(framer, scratch).map_err(wire_err)?;
        }

        conn.row.reset();
        for (i, field) in columns.iter().enumerate() {
            if null_bit(&conn.scratch, i) {
                conn.row.slots.push(Slot::Null);
                continue;
            }
            let slot = codec::read_value(
                &mut conn.framer,
                field.ftype,
                field.is_unsigned(),
                &mut conn.row.buf,
            )
            .map_err(wire_err)?;
            conn.row.slots.push(slot);
        }

        // The packet must be exactly spent.
        let mut probe = [0u8; 1];
        let extra = std::io::Read::read(&mut conn.framer, &mut probe).map_err(wire_err)?;
        if extra != 0 {
            return Err(protocol_err("trailing bytes after binary row"));
        }

        Ok(true)
    }
}

impl std::fmt::Debug for Rows<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.column_count())
            .field("done", &self.done)
            .finish()
    }
}

/// Whether column `column` is flagged NULL in a binary-row bitmap. The
/// first two bits of the bitmap are reserved.
pub(crate) fn null_bit(bitmap: &[u8], column: usize) -> bool {
    let bit = column + 2;
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}
