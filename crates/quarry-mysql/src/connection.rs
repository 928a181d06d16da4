//! MySQL connection: dialling, handshake, and command plumbing.
//!
//! A connection owns the transport, the framer wrapped around it, and the
//! scratch buffers reused across commands. It is strictly single-user:
//! one command/reply cycle at a time, which the borrow checker enforces
//! through the statement and row-iterator types.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use quarry_core::{ConnectionError, ConnectionErrorKind, Error, Result, ServerError};
use tracing::debug;

use crate::config::{Config, ServerAddr};
use crate::framer::Framer;
use crate::protocol::{capabilities, protocol_err, wire_err, Command};
use crate::rows::RowBuffer;
use crate::statement::Statement;
use crate::types::{Field, FieldType};

const READ_BUF_SIZE: usize = 8 * 1024;
const WRITE_BUF_SIZE: usize = 16 * 1024;

/// The underlying byte stream.
pub(crate) enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    fn dial(addr: &ServerAddr, timeout: Option<Duration>) -> Result<Self> {
        match addr {
            ServerAddr::Tcp(host_port) => {
                let stream = dial_tcp(host_port, timeout)?;
                stream.set_nodelay(true).ok();
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .map_err(|e| connect_error(&format!("{}", path.display()), e))?;
                Ok(Transport::Unix(stream))
            }
        }
    }

    fn try_clone(&self) -> std::io::Result<Self> {
        Ok(match self {
            Transport::Tcp(s) => Transport::Tcp(s.try_clone()?),
            #[cfg(unix)]
            Transport::Unix(s) => Transport::Unix(s.try_clone()?),
        })
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

fn dial_tcp(host_port: &str, timeout: Option<Duration>) -> Result<TcpStream> {
    match timeout {
        None => TcpStream::connect(host_port).map_err(|e| connect_error(host_port, e)),
        Some(timeout) => {
            let addrs = host_port
                .to_socket_addrs()
                .map_err(|e| connect_error(host_port, e))?;
            let mut last = None;
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, timeout) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last = Some(e),
                }
            }
            Err(match last {
                Some(e) => connect_error(host_port, e),
                None => Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("no addresses resolved for {host_port}"),
                    source: None,
                }),
            })
        }
    }
}

fn connect_error(addr: &str, err: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: format!("failed to connect to {addr}: {err}"),
        source: Some(Box::new(err)),
    })
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport established, handshake in progress
    Connecting,
    /// Ready for commands
    Ready,
    /// A transport or protocol error left the connection unusable
    Broken,
    /// Closed by the caller
    Closed,
}

/// A live MySQL connection.
pub struct Connection {
    pub(crate) framer: Framer<BufReader<Transport>, BufWriter<Transport>>,
    state: ConnectionState,

    server_version: String,
    connection_id: u32,
    server_caps: u32,
    charset: u8,

    /// Scratch space reused across commands.
    pub(crate) scratch: Vec<u8>,
    /// Backing storage for the row currently exposed to the caller.
    pub(crate) row: RowBuffer,
}

impl Connection {
    /// Dial the server and complete the handshake.
    pub fn connect(config: Config) -> Result<Self> {
        debug!(addr = ?config.addr, "dialing mysql server");
        let transport = Transport::dial(&config.addr, config.connect_timeout)?;
        let reader = BufReader::with_capacity(
            READ_BUF_SIZE,
            transport.try_clone().map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("failed to clone transport handle: {e}"),
                    source: Some(Box::new(e)),
                })
            })?,
        );
        let writer = BufWriter::with_capacity(WRITE_BUF_SIZE, transport);

        let mut conn = Connection {
            framer: Framer::new(reader, writer),
            state: ConnectionState::Connecting,
            server_version: String::new(),
            connection_id: 0,
            server_caps: 0,
            charset: 0,
            scratch: Vec::with_capacity(512),
            row: RowBuffer::new(),
        };

        conn.handshake(&config.user, &config.password, config.database.as_deref())?;
        conn.state = ConnectionState::Ready;
        debug!(
            server_version = %conn.server_version,
            connection_id = conn.connection_id,
            "handshake complete"
        );
        Ok(conn)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server version string from the greeting.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Server-assigned connection (thread) id.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Lower capability flags announced by the server.
    pub fn server_capabilities(&self) -> u32 {
        self.server_caps
    }

    /// Prepare a statement. The returned handle borrows this connection
    /// exclusively until it is closed or dropped.
    pub fn prepare(&mut self, sql: &str) -> Result<Statement<'_>> {
        self.ensure_ready()?;
        match self.prepare_inner(sql) {
            Ok((id, params, columns)) => Ok(Statement::new(self, id, params, columns)),
            Err(err) => Err(self.poison(err)),
        }
    }

    /// Check the server is alive.
    pub fn ping(&mut self) -> Result<()> {
        self.ensure_ready()?;
        match self.ping_inner() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.poison(err)),
        }
    }

    /// Close the connection, sending a best-effort COM_QUIT first.
    pub fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Ready {
            let _ = self.send_quit();
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }

    fn send_quit(&mut self) -> Result<()> {
        self.framer.reset_sequence();
        self.framer.begin_packet(1);
        self.framer
            .write_all(&[Command::Quit as u8])
            .map_err(wire_err)?;
        self.framer.end_packet(true).map_err(wire_err)?;
        Ok(())
    }

    fn ping_inner(&mut self) -> Result<()> {
        self.framer.reset_sequence();
        self.framer.begin_packet(1);
        self.framer
            .write_all(&[Command::Ping as u8])
            .map_err(wire_err)?;
        self.framer.end_packet(true).map_err(wire_err)?;

        self.advance()?;
        match self.read_reply_byte()? {
            0x00 => {
                self.framer.drain_message().map_err(wire_err)?;
                Ok(())
            }
            0xFF => Err(self.read_server_error()?),
            other => Err(protocol_err(format!(
                "unexpected leading byte 0x{other:02X} in ping reply"
            ))),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == ConnectionState::Ready {
            return Ok(());
        }
        Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("connection is not ready (state {:?})", self.state),
            source: None,
        }))
    }

    /// Record fatal errors so later calls are refused.
    pub(crate) fn poison(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.state = ConnectionState::Broken;
        }
        err
    }

    /// Drain the current message and position on the next packet.
    pub(crate) fn advance(&mut self) -> Result<()> {
        self.framer.advance_packet().map_err(wire_err)
    }

    /// Read the first byte of the packet just advanced to.
    pub(crate) fn read_reply_byte(&mut self) -> Result<u8> {
        self.framer.read_u8().map_err(wire_err)
    }

    /// Whether the byte just read opens an EOF packet: `0xFE` with at
    /// most 4 bytes behind it.
    pub(crate) fn at_eof_packet(&self, first: u8) -> bool {
        first == 0xFE && self.framer.packet_remaining() <= 4
    }

    /// Decode the remainder of an error packet. The leading `0xFF` has
    /// already been consumed.
    pub(crate) fn read_server_error(&mut self) -> Result<Error> {
        let code = self.framer.read_u16::<LittleEndian>().map_err(wire_err)?;

        // '#' marker, then the five-character SQLSTATE.
        let mut marker = [0u8; 1];
        self.framer.read_exact(&mut marker).map_err(wire_err)?;
        let mut sql_state = [0u8; 5];
        self.framer.read_exact(&mut sql_state).map_err(wire_err)?;

        self.scratch.clear();
        self.framer
            .read_to_end(&mut self.scratch)
            .map_err(wire_err)?;

        Ok(Error::Server(ServerError {
            code,
            sql_state: String::from_utf8_lossy(&sql_state).into_owned(),
            message: String::from_utf8_lossy(&self.scratch).into_owned(),
        }))
    }

    fn handshake(&mut self, user: &str, password: &str, database: Option<&str>) -> Result<()> {
        // Server greeting, protocol v10.
        self.advance()?;

        let protocol_version = self.framer.read_u8().map_err(wire_err)?;
        if protocol_version != 0x0A {
            return Err(protocol_err(format!(
                "unexpected protocol version 0x{protocol_version:02X}"
            )));
        }

        self.server_version = read_nul_string(&mut self.framer).map_err(wire_err)?;
        self.connection_id = self.framer.read_u32::<LittleEndian>().map_err(wire_err)?;

        let mut challenge = [0u8; 20];
        let mut challenge_len = 8;
        self.framer
            .read_exact(&mut challenge[..8])
            .map_err(wire_err)?;

        // One filler byte.
        let mut skip = [0u8; 10];
        self.framer.read_exact(&mut skip[..1]).map_err(wire_err)?;

        let caps_lower = self.framer.read_u16::<LittleEndian>().map_err(wire_err)?;
        if u32::from(caps_lower) & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(protocol_err("server does not support the 4.1 protocol"));
        }
        self.server_caps = u32::from(caps_lower);

        if self.framer.packet_remaining() > 0 {
            self.charset = self.framer.read_u8().map_err(wire_err)?;
            // Status flags, upper capability flags, auth-data length.
            self.framer.read_exact(&mut skip[..5]).map_err(wire_err)?;
            // Ten reserved bytes.
            self.framer.read_exact(&mut skip[..10]).map_err(wire_err)?;
            self.framer
                .read_exact(&mut challenge[8..20])
                .map_err(wire_err)?;
            challenge_len = 20;
        }
        // Anything further (plugin name and friends) is irrelevant here.
        self.framer.drain_message().map_err(wire_err)?;

        // Login packet; the sequence continues from the greeting.
        let mut client_caps = capabilities::CLIENT_FLAGS;
        if database.is_some() {
            client_caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&client_caps.to_le_bytes());
        self.scratch.extend_from_slice(&0u32.to_le_bytes()); // max packet size, 0 is acceptable
        self.scratch.push(self.charset);
        self.scratch.extend_from_slice(&[0u8; 23]);
        self.scratch.extend_from_slice(user.as_bytes());
        self.scratch.push(0);

        let scramble = crate::auth::native_password_scramble(password, &challenge[..challenge_len]);
        self.scratch.push(scramble.len() as u8);
        self.scratch.extend_from_slice(&scramble);

        if let Some(db) = database {
            self.scratch.extend_from_slice(db.as_bytes());
            self.scratch.push(0);
        }

        self.framer.begin_packet(self.scratch.len() as u64);
        self.framer.write_all(&self.scratch).map_err(wire_err)?;
        self.framer.end_packet(true).map_err(wire_err)?;

        // Login reply.
        self.advance()?;
        match self.read_reply_byte()? {
            0x00 => {
                self.framer.drain_message().map_err(wire_err)?;
                Ok(())
            }
            0xFF => {
                let err = self.read_server_error()?;
                Err(match err {
                    Error::Server(server) => Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Authentication,
                        message: server.to_string(),
                        source: Some(Box::new(server)),
                    }),
                    other => other,
                })
            }
            other => Err(protocol_err(format!(
                "unexpected leading byte 0x{other:02X} in login reply"
            ))),
        }
    }

    fn prepare_inner(&mut self, sql: &str) -> Result<(u32, Vec<Field>, Vec<Field>)> {
        self.framer.reset_sequence();
        self.framer.begin_packet(1 + sql.len() as u64);
        self.framer
            .write_all(&[Command::StmtPrepare as u8])
            .map_err(wire_err)?;
        self.framer.write_all(sql.as_bytes()).map_err(wire_err)?;
        self.framer.end_packet(true).map_err(wire_err)?;

        self.advance()?;
        match self.read_reply_byte()? {
            0x00 => {}
            0xFF => return Err(self.read_server_error()?),
            other => {
                return Err(protocol_err(format!(
                    "unexpected leading byte 0x{other:02X} in prepare reply"
                )))
            }
        }

        let id = self.framer.read_u32::<LittleEndian>().map_err(wire_err)?;
        let num_columns = self.framer.read_u16::<LittleEndian>().map_err(wire_err)?;
        let num_params = self.framer.read_u16::<LittleEndian>().map_err(wire_err)?;
        // One reserved byte, then the warning count; neither is retained.
        self.framer.drain_message().map_err(wire_err)?;

        let mut params = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            params.push(self.read_field_definition()?);
        }
        if num_params > 0 {
            self.read_eof_packet()?;
        }

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            columns.push(self.read_field_definition()?);
        }
        if num_columns > 0 {
            self.read_eof_packet()?;
        }

        debug!(
            statement_id = id,
            params = num_params,
            columns = num_columns,
            "prepared statement"
        );
        Ok((id, params, columns))
    }

    /// Parse one column-definition packet, retaining the display name,
    /// wire type, and flags.
    fn read_field_definition(&mut self) -> Result<Field> {
        use crate::protocol::codec;

        self.advance()?;

        codec::skip_lenenc_bytes(&mut self.framer).map_err(wire_err)?; // catalog
        codec::skip_lenenc_bytes(&mut self.framer).map_err(wire_err)?; // schema
        let table = codec::read_lenenc_string(&mut self.framer).map_err(wire_err)?;
        codec::skip_lenenc_bytes(&mut self.framer).map_err(wire_err)?; // physical table
        let column = codec::read_lenenc_string(&mut self.framer).map_err(wire_err)?;
        codec::skip_lenenc_bytes(&mut self.framer).map_err(wire_err)?; // physical name

        // Fixed tail: type at offset 7, flags at offsets 8 and 9. Filler
        // bytes past the tail are drained with the packet.
        let mut tail = [0u8; 11];
        self.framer.read_exact(&mut tail).map_err(wire_err)?;

        let ftype = FieldType::from_u8(tail[7])
            .ok_or_else(|| protocol_err(format!("unknown field type 0x{:02X}", tail[7])))?;
        let flags = u16::from_le_bytes([tail[8], tail[9]]);

        let name = if table.is_empty() {
            column
        } else {
            format!("{table}.{column}")
        };

        Ok(Field { name, ftype, flags })
    }

    /// Expect an EOF packet next in the stream.
    pub(crate) fn read_eof_packet(&mut self) -> Result<()> {
        self.advance()?;
        let first = self.read_reply_byte()?;
        if self.at_eof_packet(first) {
            return Ok(());
        }
        Err(protocol_err(
            "did not find EOF packet where one was expected",
        ))
    }

    /// Skip packets until an EOF packet goes by, then drain it.
    pub(crate) fn skip_until_eof(&mut self) -> Result<()> {
        loop {
            self.advance()?;
            let first = self.read_reply_byte()?;
            if self.at_eof_packet(first) {
                break;
            }
        }
        self.framer.drain_message().map_err(wire_err)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

fn read_nul_string<R: Read>(r: &mut R) -> std::io::Result<String> {
    let mut out = Vec::new();
    loop {
        let byte = r.read_u8()?;
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.push(byte);
    }
}
