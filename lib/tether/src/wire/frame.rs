use crate::logging;
use crate::wire::{WireError, WireResult, SYNC_BYTE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

pub const HEADER_SIZE: usize = 4;

/// Frame kinds. `Push` and `Result` carry a payload length in the 24-bit
/// header value, `Execute` carries the function opcode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Push = 0x01,
    Execute = 0x02,
    Result = 0x03,
}

impl From<MessageType> for u8 {
    #[inline]
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

impl MessageType {
    #[inline]
    fn from_byte(byte: u8) -> WireResult<MessageType> {
        match byte {
            0x01 => Ok(MessageType::Push),
            0x02 => Ok(MessageType::Execute),
            0x03 => Ok(MessageType::Result),
            other => Err(WireError::BadType(other)),
        }
    }
}

/// Four byte message header: one type byte followed by a 24-bit big-endian
/// value whose meaning depends on the type.
#[derive(Debug, Eq, PartialEq)]
pub struct Header {
    pub kind: MessageType,
    pub value: u32,
}

impl Header {
    #[inline]
    pub fn new(kind: MessageType, value: u32) -> Header {
        Header {
            kind,
            value: value & 0x00ff_ffff,
        }
    }

    pub fn read<R: io::Read>(stream: &mut R) -> WireResult<Header> {
        let mut raw = [0u8; HEADER_SIZE];
        read_exact(stream, &mut raw)?;

        let kind = MessageType::from_byte(raw[0])?;
        let value = (&raw[1..])
            .read_u24::<BigEndian>()
            .expect("Error decoding header value");

        Ok(Header { kind, value })
    }

    pub fn write<W: io::Write>(&self, stream: &mut W) -> WireResult<()> {
        let mut raw = [0u8; HEADER_SIZE];
        {
            let mut buf = &mut raw[..];
            buf.write_u8(self.kind.into()).expect("Error writing type");
            buf.write_u24::<BigEndian>(self.value)
                .expect("Error writing header value");
        }

        write_all(stream, &raw)
    }
}

/// Consumes bytes until two consecutive sync bytes have been seen. Anything
/// else resets the counter and is diverted to the trace log, so the frontend
/// can resynchronize after boot noise without corrupting later frames.
pub fn synchronize<R: io::Read>(stream: &mut R, log: &logging::Logger) -> WireResult<()> {
    let mut run = 0;

    loop {
        let mut byte = [0u8; 1];
        read_exact(stream, &mut byte)?;

        if byte[0] == SYNC_BYTE {
            run += 1;
            if run == 2 {
                logging::debug!(log, "stream synchronized"; "context" => "synchronize");
                return Ok(());
            }
        } else {
            run = 0;
            logging::trace!(log, "discarding noise byte";
                            "context" => "synchronize",
                            "byte" => byte[0]);
        }
    }
}

/// Writes a single result frame: header plus payload.
pub fn write_result<W: io::Write>(stream: &mut W, payload: &[u8]) -> WireResult<()> {
    Header::new(MessageType::Result, payload.len() as u32).write(stream)?;
    write_all(stream, payload)
}

/// Reads exactly `buf.len()` bytes. Timeouts bound the per-call latency of
/// the underlying device, not frame latency, so they are retried. Everything
/// else is fatal to the channel.
pub fn read_exact<R: io::Read>(stream: &mut R, buf: &mut [u8]) -> WireResult<()> {
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(WireError::Receive(io::ErrorKind::UnexpectedEof)),
            Ok(count) => filled += count,
            Err(err) => match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => (),
                kind => return Err(WireError::Receive(kind)),
            },
        }
    }

    Ok(())
}

/// Writes the whole buffer, retrying short writes and timeouts.
pub fn write_all<W: io::Write>(stream: &mut W, buf: &[u8]) -> WireResult<()> {
    let mut written = 0;

    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(WireError::Send(io::ErrorKind::WriteZero)),
            Ok(count) => written += count,
            Err(err) => match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => (),
                kind => return Err(WireError::Send(kind)),
            },
        }
    }

    let _ = stream.flush();
    Ok(())
}
