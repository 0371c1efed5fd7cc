//! Opcode dispatch: validates the popped arguments, decodes scalars,
//! invokes the host collaborators and assembles the reply items.

use crate::host::fs::FileStore;
use crate::host::net::{NetStack, MODE_BLOCKING, MODE_NONBLOCKING};
use crate::host::HostError;
use crate::logging;
use crate::stack::{ArgStack, Item};
use crate::wire::{Status, MAX_STRING_LENGTH};
use byteorder::{BigEndian, ByteOrder};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::str;
use std::thread;
use std::time::Duration;

/// 24-bit function opcodes. Bits 4-7 carry the arity, bits 8-23 the
/// function ordinal.
pub mod op {
    pub const EXIT: u32 = 0x0000_0010;
    pub const ECHO: u32 = 0x0000_0110;
    pub const USLEEP: u32 = 0x0000_0210;
    pub const SOCKET: u32 = 0x0000_0330;
    pub const ACCEPT: u32 = 0x0000_0420;
    pub const SET_BLOCK: u32 = 0x0000_0520;
    pub const RECV: u32 = 0x0000_0630;
    pub const SEND: u32 = 0x0000_0720;
    pub const SHUTDOWN: u32 = 0x0000_0810;
    pub const FOPEN: u32 = 0x0000_0920;
    pub const FREAD: u32 = 0x0000_0a20;
    pub const FGETS: u32 = 0x0000_0b20;
    pub const FWRITE: u32 = 0x0000_0c20;
    pub const FCLOSE: u32 = 0x0000_0d10;
    pub const FSEEK: u32 = 0x0000_0e30;
    pub const FTELL: u32 = 0x0000_0f10;
    pub const FERROR: u32 = 0x0000_1010;
    pub const DOPEN: u32 = 0x0000_1110;
    pub const DREAD: u32 = 0x0000_1220;
    pub const DCLOSE: u32 = 0x0000_1310;
    pub const STAT: u32 = 0x0000_1410;
}

/// Output slots available to a single call.
pub const MAX_OUTPUTS: usize = 16;

/// Declared argument count, taken from bits 4-7 of the opcode.
#[inline]
pub fn arity(opcode: u32) -> usize {
    ((opcode >> 4) & 0xf) as usize
}

/// What one execute produced. `Exit` carries the target-supplied code and
/// must not be answered on the wire.
#[derive(Debug)]
pub enum Outcome {
    Reply(Reply),
    Exit(u32),
}

/// Reply to a single execute: the status followed by zero or more data
/// items. A non-ok status never carries data.
#[derive(Debug)]
pub struct Reply {
    pub status: Status,
    pub outputs: Vec<Item>,
}

impl Reply {
    #[inline]
    fn ok(outputs: Vec<Item>) -> Reply {
        Reply {
            status: Status::Ok,
            outputs,
        }
    }

    #[inline]
    pub fn failure(status: Status) -> Reply {
        Reply {
            status,
            outputs: Vec::new(),
        }
    }
}

pub struct Dispatcher {
    files: FileStore,
    net: NetStack,
    log: logging::Logger,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Dispatcher {
        let log = logging::child_or_discard(log.into());

        Dispatcher {
            files: FileStore::new(&log),
            net: NetStack::new(&log),
            log,
        }
    }

    /// Executes one opcode against the argument stack. The caller clears
    /// the stack afterwards regardless of the outcome.
    pub fn dispatch(&mut self, opcode: u32, stack: &mut ArgStack) -> Outcome {
        let inputs = match stack.take(arity(opcode)) {
            Some(inputs) => inputs,
            None => {
                logging::debug!(self.log, "argument deficit";
                                "context" => "dispatch",
                                "opcode" => opcode,
                                "declared" => arity(opcode),
                                "stacked" => stack.len());
                return Outcome::Reply(Reply::failure(Status::BadInput));
            }
        };

        logging::trace!(self.log, "executing";
                        "context" => "dispatch",
                        "opcode" => opcode,
                        "arity" => inputs.len());

        let result = match opcode {
            op::EXIT => {
                return match scalar_u32(&inputs[0]) {
                    Ok(code) => Outcome::Exit(code),
                    Err(status) => Outcome::Reply(Reply::failure(status)),
                };
            }
            op::ECHO => self.echo(&inputs),
            op::USLEEP => self.usleep(&inputs),
            op::SOCKET => self.socket(&inputs),
            op::ACCEPT => self.accept(&inputs),
            op::SET_BLOCK => self.set_block(&inputs),
            op::RECV => self.recv(&inputs),
            op::SEND => self.send(&inputs),
            op::SHUTDOWN => self.shutdown(&inputs),
            op::FOPEN => self.fopen(&inputs),
            op::FREAD => self.fread(&inputs),
            op::FGETS => self.fgets(&inputs),
            op::FWRITE => self.fwrite(&inputs),
            op::FCLOSE => self.fclose(&inputs),
            op::FSEEK => self.fseek(&inputs),
            op::FTELL => self.ftell(&inputs),
            op::FERROR => self.ferror(&inputs),
            op::DOPEN => self.dopen(&inputs),
            op::DREAD => self.dread(&inputs),
            op::DCLOSE => self.dclose(&inputs),
            op::STAT => self.stat(&inputs),
            unknown => {
                logging::debug!(self.log, "unknown opcode";
                                "context" => "dispatch",
                                "opcode" => unknown);
                Err(Status::BadInput)
            }
        };

        let reply = match result {
            Ok(outputs) if outputs.len() > MAX_OUTPUTS => Reply::failure(Status::BadOutput),
            Ok(outputs) => Reply::ok(outputs),
            Err(status) => Reply::failure(status),
        };

        logging::debug!(self.log, "executed";
                        "context" => "dispatch",
                        "opcode" => opcode,
                        "status" => ?reply.status,
                        "outputs" => reply.outputs.len());

        Outcome::Reply(reply)
    }

    fn echo(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        Ok(vec![Item::from_slice(inputs[0].as_slice())])
    }

    fn usleep(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let usec = scalar_u32(&inputs[0])?;

        thread::sleep(Duration::from_micros(u64::from(usec)));
        Ok(Vec::new())
    }

    fn socket(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let host = text(&inputs[0])?;
        let port = text(&inputs[1])?
            .parse::<u16>()
            .map_err(|_| Status::BadInput)?;
        let setup = scalar_u16(&inputs[2])?;

        let socket = self
            .net
            .open(host, port, setup)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u16(socket)])
    }

    fn accept(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let socket = scalar_u16(&inputs[0])?;
        let capacity = output_capacity(scalar_u32(&inputs[1])?)?;

        let (bind, client, ip) = self
            .net
            .accept(socket, capacity)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![
            Item::scalar_u16(bind),
            Item::scalar_u16(client),
            Item::from_vec(ip),
        ])
    }

    fn set_block(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let socket = scalar_u16(&inputs[0])?;
        let blocking = match scalar_u16(&inputs[1])? {
            MODE_BLOCKING => true,
            MODE_NONBLOCKING => false,
            _ => return Err(Status::BadInput),
        };

        self.net
            .set_blocking(socket, blocking)
            .map_err(|err| self.host_failure(err))?;

        Ok(Vec::new())
    }

    fn recv(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let socket = scalar_u16(&inputs[0])?;
        let size = output_capacity(scalar_u32(&inputs[1])?)?;
        let timeout = scalar_u32(&inputs[2])?;

        let data = self
            .net
            .recv(socket, size, timeout)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::from_vec(data)])
    }

    fn send(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let socket = scalar_u16(&inputs[0])?;

        let sent = self
            .net
            .send(socket, inputs[1].as_slice())
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u32(sent)])
    }

    fn shutdown(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let socket = scalar_u16(&inputs[0])?;

        self.net
            .shutdown(socket)
            .map_err(|err| self.host_failure(err))?;

        Ok(Vec::new())
    }

    fn fopen(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let mode = text(&inputs[0])?;
        let path = os_text(&inputs[1])?;

        let handle = self
            .files
            .open(mode, path)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u32(handle)])
    }

    fn fread(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let size = output_capacity(scalar_u32(&inputs[0])?)?;
        let handle = scalar_u32(&inputs[1])?;

        let data = self
            .files
            .read(handle, size)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::from_vec(data)])
    }

    fn fgets(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let size = output_capacity(scalar_u32(&inputs[0])?)?;
        let handle = scalar_u32(&inputs[1])?;

        let line = self
            .files
            .gets(handle, size)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::from_vec(line)])
    }

    fn fwrite(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let handle = scalar_u32(&inputs[1])?;

        let written = self
            .files
            .write(handle, inputs[0].as_slice())
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u32(written)])
    }

    fn fclose(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let handle = scalar_u32(&inputs[0])?;

        self.files
            .close(handle)
            .map_err(|err| self.host_failure(err))?;

        Ok(Vec::new())
    }

    fn fseek(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let offset = scalar_u32(&inputs[0])?;
        let whence = scalar_u32(&inputs[1])?;
        let handle = scalar_u32(&inputs[2])?;

        self.files
            .seek(handle, offset, whence)
            .map_err(|err| self.host_failure(err))?;

        Ok(Vec::new())
    }

    fn ftell(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let handle = scalar_u32(&inputs[0])?;

        let position = self
            .files
            .tell(handle)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u32(position)])
    }

    fn ferror(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let handle = scalar_u32(&inputs[0])?;

        let flagged = self
            .files
            .error_flag(handle)
            .map_err(|err| self.host_failure(err))?;

        match flagged {
            false => Ok(Vec::new()),
            true => Err(Status::BadOutput),
        }
    }

    fn dopen(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let path = os_text(&inputs[0])?;

        let handle = self
            .files
            .open_dir(path)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u32(handle)])
    }

    fn dread(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let size = output_capacity(scalar_u32(&inputs[0])?)?;
        let handle = scalar_u32(&inputs[1])?;

        let name = self
            .files
            .read_dir_entry(handle, size)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::from_vec(name)])
    }

    fn dclose(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let handle = scalar_u32(&inputs[0])?;

        self.files
            .close_dir(handle)
            .map_err(|err| self.host_failure(err))?;

        Ok(Vec::new())
    }

    fn stat(&mut self, inputs: &[Item]) -> Result<Vec<Item>, Status> {
        let path = os_text(&inputs[0])?;

        let kind = self
            .files
            .stat(path)
            .map_err(|err| self.host_failure(err))?;

        Ok(vec![Item::scalar_u16(kind)])
    }

    fn host_failure(&self, err: HostError) -> Status {
        logging::debug!(self.log, "host operation failed";
                        "context" => "dispatch",
                        "error" => ?err);
        Status::BadOutput
    }
}

#[inline]
fn scalar_u16(item: &Item) -> Result<u16, Status> {
    if item.len() < 2 {
        return Err(Status::BadInput);
    }

    Ok(BigEndian::read_u16(item.as_slice()))
}

#[inline]
fn scalar_u32(item: &Item) -> Result<u32, Status> {
    if item.len() < 4 {
        return Err(Status::BadInput);
    }

    Ok(BigEndian::read_u32(item.as_slice()))
}

/// Bytes of a NUL-terminated string argument, without the NUL.
fn cstr(item: &Item) -> Result<&[u8], Status> {
    let bytes = item.as_slice();

    match bytes.iter().position(|&b| b == 0) {
        Some(end) => Ok(&bytes[..end]),
        None => Err(Status::BadInput),
    }
}

fn text(item: &Item) -> Result<&str, Status> {
    str::from_utf8(cstr(item)?).map_err(|_| Status::BadInput)
}

fn os_text(item: &Item) -> Result<&OsStr, Status> {
    Ok(OsStr::from_bytes(cstr(item)?))
}

/// Requested output size, refused before any host work when it exceeds the
/// result payload limit.
#[inline]
fn output_capacity(size: u32) -> Result<usize, Status> {
    let size = size as usize;

    if size > MAX_STRING_LENGTH {
        return Err(Status::UnsupportedOutput);
    }

    Ok(size)
}
