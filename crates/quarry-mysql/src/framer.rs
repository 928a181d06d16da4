//! Packet framing over the raw byte stream.
//!
//! The framer converts between logical byte streams and on-wire MySQL
//! packets. It owns the sequence counter, splits outgoing payloads at the
//! packet ceiling, and transparently merges incoming continuation packets
//! into one contiguous logical message.
//!
//! Reading goes through `std::io::Read`: a return of `Ok(0)` marks the
//! end of the current logical message, after which `advance_packet`
//! positions the framer on the next one. Writing is bracketed by
//! `begin_packet(size)` / `end_packet(flush)`; the announced size is a
//! contract, and violating it is a programmer error that panics.

use std::io::{self, Read, Write};

use crate::protocol::{PacketHeader, MAX_PACKET_SIZE};

pub(crate) struct Framer<R, W> {
    reader: R,
    writer: W,

    /// Largest packet the peer may send before continuing in a follow-up.
    recv_max: u32,
    /// Largest packet we emit before splitting.
    send_max: u32,

    /// Bytes left in the packet currently being read.
    remaining: u32,
    /// The current packet is full-sized, so the next one continues it.
    merge_next: bool,

    /// A `begin_packet` is outstanding.
    write_active: bool,
    /// Bytes of the announced payload not yet written.
    write_remaining: u64,
    /// Capacity left in the wire packet currently being filled.
    write_cap: u32,
    /// The last chunk exactly filled `send_max`, so an empty trailer
    /// packet must follow for the peer to see the message boundary.
    needs_trailer: bool,

    /// Sequence id for the next packet in either direction.
    seq: u8,
}

impl<R: Read, W: Write> Framer<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_limits(reader, writer, MAX_PACKET_SIZE, MAX_PACKET_SIZE)
    }

    /// Construct with explicit packet ceilings. Production code uses the
    /// protocol maximum; tests shrink it to exercise splitting cheaply.
    pub fn with_limits(reader: R, writer: W, recv_max: u32, send_max: u32) -> Self {
        Self {
            reader,
            writer,
            recv_max,
            send_max,
            remaining: 0,
            merge_next: false,
            write_active: false,
            write_remaining: 0,
            write_cap: 0,
            needs_trailer: false,
            seq: 0,
        }
    }

    /// Reset the sequence counter. Done at the start of every command.
    pub fn reset_sequence(&mut self) {
        self.seq = 0;
    }

    /// Bytes left in the packet currently being read.
    pub fn packet_remaining(&self) -> u32 {
        self.remaining
    }

    /// Drain the rest of the current logical message.
    pub fn drain_message(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 512];
        loop {
            if self.read(&mut scratch)? == 0 {
                return Ok(());
            }
        }
    }

    /// Drain the current message and position on the next packet header.
    pub fn advance_packet(&mut self) -> io::Result<()> {
        self.drain_message()?;
        self.read_header(false)
    }

    /// Announce a logical payload of exactly `size` bytes. The writes
    /// that follow must sum to `size` before `end_packet` is called.
    pub fn begin_packet(&mut self, size: u64) {
        assert!(!self.write_active, "begin_packet while a packet is being written");
        assert_eq!(self.write_cap, 0, "write capacity left over from a previous packet");
        assert!(size > 0, "begin_packet with an empty payload");
        self.write_active = true;
        self.write_remaining = size;
    }

    /// Finish the announced packet, emitting the empty trailer when the
    /// payload was an exact multiple of the packet ceiling.
    pub fn end_packet(&mut self, flush: bool) -> io::Result<()> {
        assert!(self.write_active, "end_packet without begin_packet");
        assert_eq!(
            self.write_remaining, 0,
            "miscalculated packet size, announced bytes remain unwritten"
        );
        self.write_active = false;
        if self.needs_trailer {
            self.needs_trailer = false;
            self.put_header(0)?;
        }
        if flush {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// Give back the underlying streams.
    #[allow(dead_code)]
    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }

    fn put_header(&mut self, payload_length: u32) -> io::Result<()> {
        let header = PacketHeader {
            payload_length,
            sequence_id: self.seq,
        };
        self.seq = self.seq.wrapping_add(1);
        self.writer.write_all(&header.to_bytes())
    }

    /// Read and validate the next 4-byte packet header.
    ///
    /// A zero-length packet is the natural terminator of a message sized
    /// at an exact multiple of the ceiling, and is an error anywhere else.
    fn read_header(&mut self, continuation: bool) -> io::Result<()> {
        let mut head = [0u8; 4];
        self.reader.read_exact(&mut head)?;
        let header = PacketHeader::from_bytes(&head);

        if header.sequence_id != self.seq {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expecting sequence id {}, got {}",
                    self.seq, header.sequence_id
                ),
            ));
        }
        if header.payload_length == 0 && !continuation {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected zero-length packet",
            ));
        }
        self.seq = self.seq.wrapping_add(1);

        self.remaining = header.payload_length.min(self.recv_max);
        self.merge_next = header.payload_length >= self.recv_max;
        Ok(())
    }
}

impl<R: Read, W: Write> Read for Framer<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            if !self.merge_next {
                return Ok(0);
            }
            self.read_header(true)?;
            if self.remaining == 0 {
                // Zero-length continuation: the message is over.
                return Ok(0);
            }
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(self.remaining as usize);
        let got = self.reader.read(&mut buf[..want])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a packet",
            ));
        }
        self.remaining -= got as u32;
        Ok(got)
    }
}

impl<R: Read, W: Write> Write for Framer<R, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        assert!(self.write_active, "write outside of begin_packet/end_packet");
        assert!(
            buf.len() as u64 <= self.write_remaining,
            "write exceeds the announced packet size"
        );

        let mut rest = buf;
        while !rest.is_empty() {
            if self.write_cap == 0 {
                let cap = if self.write_remaining >= u64::from(self.send_max) {
                    if self.write_remaining == u64::from(self.send_max) {
                        self.needs_trailer = true;
                    }
                    self.send_max
                } else {
                    self.write_remaining as u32
                };
                self.put_header(cap)?;
                self.write_cap = cap;
            }

            let n = rest.len().min(self.write_cap as usize);
            self.writer.write_all(&rest[..n])?;
            rest = &rest[n..];
            self.write_remaining -= n as u64;
            self.write_cap -= n as u32;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
