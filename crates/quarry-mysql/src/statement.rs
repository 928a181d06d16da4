//! Prepared statements over the binary protocol.
//!
//! A statement mutably borrows its connection for its whole lifetime, so
//! only one statement can drive the wire at a time and iterators cannot
//! outlive the statement that produced them.

use std::io::Write;

use quarry_core::{EncodingError, Error, Result, Value};
use tracing::trace;

use crate::connection::Connection;
use crate::protocol::{codec, wire_err, Command};
use crate::rows::Rows;
use crate::types::Field;

/// A prepared statement bound to its connection.
pub struct Statement<'c> {
    pub(crate) conn: &'c mut Connection,
    id: u32,
    params: Vec<Field>,
    pub(crate) columns: Vec<Field>,
}

/// The outcome of an `exec`.
///
/// When the server answers a row-count command with a result set instead
/// of an OK packet, neither counter is known; asking for one then yields
/// the matching sentinel error.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    affected_rows: Option<u64>,
    last_insert_id: Option<u64>,
}

impl ExecResult {
    /// Number of rows the statement touched.
    pub fn rows_affected(&self) -> Result<u64> {
        self.affected_rows.ok_or(Error::UnknownRowsAffected)
    }

    /// The id generated for an AUTO_INCREMENT column, if any.
    pub fn last_insert_id(&self) -> Result<u64> {
        self.last_insert_id.ok_or(Error::UnknownLastInsertId)
    }
}

impl<'c> Statement<'c> {
    pub(crate) fn new(
        conn: &'c mut Connection,
        id: u32,
        params: Vec<Field>,
        columns: Vec<Field>,
    ) -> Self {
        Self {
            conn,
            id,
            params,
            columns,
        }
    }

    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of `?` placeholders the statement expects.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Number of result columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Result column descriptors.
    pub fn fields(&self) -> &[Field] {
        &self.columns
    }

    /// Execute for a row count. A result set arriving instead of an OK is
    /// drained, and the counters come back unknown.
    pub fn exec(&mut self, params: &[Value]) -> Result<ExecResult> {
        match self.exec_inner(params) {
            Ok(result) => Ok(result),
            Err(err) => Err(self.conn.poison(err)),
        }
    }

    /// Execute for rows. The returned iterator borrows this statement
    /// exclusively until it is closed or dropped.
    pub fn query(&mut self, params: &[Value]) -> Result<Rows<'_, 'c>> {
        match self.query_inner(params) {
            Ok(exhausted) => Ok(Rows::new(self, exhausted)),
            Err(err) => Err(self.conn.poison(err)),
        }
    }

    /// Release the server-side statement. The server sends no reply.
    pub fn close(self) -> Result<()> {
        trace!(statement_id = self.id, "closing statement");
        let framer = &mut self.conn.framer;
        framer.reset_sequence();
        framer.begin_packet(5);

        let mut packet = [0u8; 5];
        packet[0] = Command::StmtClose as u8;
        packet[1..5].copy_from_slice(&self.id.to_le_bytes());

        let result = framer
            .write_all(&packet)
            .and_then(|()| framer.end_packet(true))
            .map_err(wire_err);
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.conn.poison(err)),
        }
    }

    fn exec_inner(&mut self, params: &[Value]) -> Result<ExecResult> {
        self.send_execute(params)?;

        self.conn.advance()?;
        match self.conn.read_reply_byte()? {
            0xFF => Err(self.conn.read_server_error()?),
            0x00 => {
                let affected =
                    codec::read_lenenc_uint(&mut self.conn.framer).map_err(wire_err)?;
                let last_insert_id =
                    codec::read_lenenc_uint(&mut self.conn.framer).map_err(wire_err)?;
                // Status, warnings, and the info string are not retained.
                self.conn.framer.drain_message().map_err(wire_err)?;
                Ok(ExecResult {
                    affected_rows: Some(affected),
                    last_insert_id: Some(last_insert_id),
                })
            }
            _ => {
                // The caller wanted a row count but the server produced a
                // result set. Drain the column definitions and the rows.
                self.conn.skip_until_eof()?;
                self.conn.skip_until_eof()?;
                Ok(ExecResult {
                    affected_rows: None,
                    last_insert_id: None,
                })
            }
        }
    }

    /// Returns whether the result set arrived pre-exhausted.
    fn query_inner(&mut self, params: &[Value]) -> Result<bool> {
        self.send_execute(params)?;

        self.conn.advance()?;
        match self.conn.read_reply_byte()? {
            0xFF => Err(self.conn.read_server_error()?),
            0x00 => {
                // An OK packet: no rows will follow.
                self.conn.framer.drain_message().map_err(wire_err)?;
                Ok(true)
            }
            _ => {
                // The leading byte of the column-count lenenc. The column
                // descriptors captured at prepare time are authoritative,
                // so the metadata packets are skipped wholesale.
                self.conn.skip_until_eof()?;
                Ok(false)
            }
        }
    }

    /// Emit a COM_STMT_EXECUTE packet.
    ///
    /// The payload size is computed up front with a counting pass over
    /// the parameters, then every byte is streamed through the framer;
    /// both passes share the codec so they cannot disagree.
    fn send_execute(&mut self, params: &[Value]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(Error::Encoding(EncodingError {
                message: format!(
                    "statement expects {} parameters, got {}",
                    self.params.len(),
                    params.len()
                ),
            }));
        }

        let bitmap_len = params.len().div_ceil(8);
        let mut size = 10u64; // command, statement id, flags, iteration count
        if !params.is_empty() {
            size += bitmap_len as u64; // NULL bitmap
            size += 1; // new-params-bound flag
            size += 2 * params.len() as u64; // per-parameter type and flag
            for value in params {
                size += codec::measure_value(value).map_err(wire_err)? as u64;
            }
        }

        let framer = &mut self.conn.framer;
        framer.reset_sequence();
        framer.begin_packet(size);

        let mut head = [0u8; 10];
        head[0] = Command::StmtExecute as u8;
        head[1..5].copy_from_slice(&self.id.to_le_bytes());
        head[5] = 0x00; // no cursor
        head[6..10].copy_from_slice(&1u32.to_le_bytes());
        framer.write_all(&head).map_err(wire_err)?;

        if !params.is_empty() {
            let mut bitmap = vec![0u8; bitmap_len];
            for (i, value) in params.iter().enumerate() {
                if value.is_null() {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            framer.write_all(&bitmap).map_err(wire_err)?;

            // new-params-bound: types follow
            framer.write_all(&[0x01]).map_err(wire_err)?;
            for value in params {
                let wire_type = codec::value_wire_type(value) as u8;
                framer.write_all(&[wire_type, 0x00]).map_err(wire_err)?;
            }
            for value in params {
                codec::write_value(&mut *framer, value).map_err(wire_err)?;
            }
        }

        framer.end_packet(true).map_err(wire_err)
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("params", &self.params.len())
            .field("columns", &self.columns.len())
            .finish()
    }
}
