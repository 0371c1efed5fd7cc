//! Channel context and the frontend loop: owns the stream, the argument
//! stack and the session status machine, and routes incoming frames to the
//! dispatcher.

use crate::dispatch::{Dispatcher, Outcome, Reply};
use crate::logging;
use crate::stack::ArgStack;
use crate::wire::frame::{self, Header, MessageType};
use crate::wire::{Status, GREETING, MAX_STRING_LENGTH};
use byteorder::{BigEndian, WriteBytesExt};
use std::io;

const DRAIN_CHUNK: usize = 4096;

/// Session status machine. `OutOfMemory` is transient: the failed push's
/// payload is drained, the next execute is answered with `ALLOC_FAILED`
/// and the channel returns to `Ok`. The other two are terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Ok,
    OutOfMemory,
    Exited(u32),
    Dead(Status),
}

/// One target link: the byte stream, the pending arguments and the session
/// state, owned exclusively by the frontend loop.
pub struct Channel<S> {
    stream: S,
    stack: ArgStack,
    state: ChannelState,
    log: logging::Logger,
}

impl<S: io::Read + io::Write> Channel<S> {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(stream: S, log: L) -> Channel<S> {
        Channel::with_stack(stream, ArgStack::new(), log)
    }

    /// Constructor taking a pre-sized argument stack.
    #[inline]
    pub fn with_stack<'a, L: Into<Option<&'a logging::Logger>>>(
        stream: S,
        stack: ArgStack,
        log: L,
    ) -> Channel<S> {
        Channel {
            stream,
            stack,
            state: ChannelState::Ok,
            log: logging::child_or_discard(log.into()),
        }
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Writes the greeting preamble: the literal marker the target scans
    /// for, the 4-byte big-endian argv length and the concatenated
    /// NUL-terminated argv strings.
    pub fn greet(&mut self, args: &[String]) -> Result<(), Status> {
        let mut payload = Vec::new();
        for arg in args {
            payload.extend_from_slice(arg.as_bytes());
            payload.push(0);
        }

        logging::debug!(self.log, "greeting target";
                        "context" => "greet",
                        "argv_count" => args.len(),
                        "argv_bytes" => payload.len());

        let mut length = [0u8; 4];
        (&mut length[..])
            .write_u32::<BigEndian>(payload.len() as u32)
            .expect("Error encoding argv length");

        let result = frame::write_all(&mut self.stream, GREETING)
            .and_then(|()| frame::write_all(&mut self.stream, &length))
            .and_then(|()| frame::write_all(&mut self.stream, &payload));

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = ChannelState::Dead(err.status());
                Err(err.status())
            }
        }
    }

    /// Runs the session until the target exits or the channel dies.
    /// Synchronizes on the frame stream once, then processes headers
    /// back-to-back.
    pub fn run(&mut self, dispatcher: &mut Dispatcher) -> ChannelState {
        if let Err(err) = frame::synchronize(&mut self.stream, &self.log) {
            self.state = ChannelState::Dead(err.status());
            return self.state;
        }

        loop {
            match self.state {
                ChannelState::Ok | ChannelState::OutOfMemory => (),
                _ => break,
            }

            let header = match Header::read(&mut self.stream) {
                Ok(header) => header,
                Err(err) => {
                    logging::warn!(self.log, "failed reading header";
                                   "context" => "run",
                                   "error" => ?err);
                    self.state = ChannelState::Dead(err.status());
                    break;
                }
            };

            match header.kind {
                MessageType::Push => self.receive_push(header.value as usize),
                MessageType::Execute => self.execute(dispatcher, header.value),
                MessageType::Result => {
                    logging::warn!(self.log, "result frame from target";
                                   "context" => "run");
                    self.state = ChannelState::Dead(Status::Receive);
                }
            }
        }

        logging::info!(self.log, "session over";
                       "context" => "run",
                       "state" => ?self.state);

        self.state
    }

    /// Receives one pushed argument. When the item cannot be allocated the
    /// payload is still consumed off the wire so the frame stream stays
    /// synchronized, and the failure is reported on the next execute.
    fn receive_push(&mut self, length: usize) {
        match self.stack.push_alloc(length) {
            Some(item) => {
                if let Err(err) = frame::read_exact(&mut self.stream, item.as_mut_slice()) {
                    self.state = ChannelState::Dead(err.status());
                } else {
                    logging::trace!(self.log, "argument pushed";
                                    "context" => "push",
                                    "length" => length);
                }
            }
            None => {
                logging::warn!(self.log, "push allocation failed, draining payload";
                               "context" => "push",
                               "length" => length);

                self.state = ChannelState::OutOfMemory;

                if let Err(err) = self.drain(length) {
                    self.state = ChannelState::Dead(err.status());
                }
            }
        }
    }

    fn execute(&mut self, dispatcher: &mut Dispatcher, opcode: u32) {
        if self.state == ChannelState::OutOfMemory {
            logging::debug!(self.log, "reporting allocation failure";
                            "context" => "execute",
                            "opcode" => opcode);

            self.stack.clear();
            self.state = ChannelState::Ok;

            if let Err(status) = self.send_reply(&Reply::failure(Status::AllocFailed)) {
                self.state = ChannelState::Dead(status);
            }

            return;
        }

        let outcome = dispatcher.dispatch(opcode, &mut self.stack);
        self.stack.clear();

        match outcome {
            Outcome::Exit(code) => {
                logging::info!(self.log, "target requested exit";
                               "context" => "execute",
                               "code" => code);
                self.state = ChannelState::Exited(code);
            }
            Outcome::Reply(reply) => {
                if let Err(status) = self.send_reply(&reply) {
                    self.state = ChannelState::Dead(status);
                }
            }
        }
    }

    /// Sends the status item followed by the data outputs, in that order.
    /// An oversize output downgrades the whole reply to a bare
    /// `UNSUPPORTED_OUTPUT` status before anything is transmitted.
    fn send_reply(&mut self, reply: &Reply) -> Result<(), Status> {
        let oversize = reply
            .outputs
            .iter()
            .any(|item| item.len() > MAX_STRING_LENGTH);

        let status = match oversize {
            true => Status::UnsupportedOutput,
            false => reply.status,
        };

        if oversize {
            logging::warn!(self.log, "refusing oversize output";
                           "context" => "reply",
                           "status" => ?reply.status);
        }

        let mut status_item = [0u8; 4];
        (&mut status_item[..])
            .write_u32::<BigEndian>(status.code())
            .expect("Error encoding status");

        frame::write_result(&mut self.stream, &status_item).map_err(|err| err.status())?;

        if oversize {
            return Ok(());
        }

        for item in &reply.outputs {
            frame::write_result(&mut self.stream, item.as_slice()).map_err(|err| err.status())?;
        }

        Ok(())
    }

    /// Consumes and discards `remaining` payload bytes from the wire.
    fn drain(&mut self, mut remaining: usize) -> crate::wire::WireResult<()> {
        let mut sink = [0u8; DRAIN_CHUNK];

        while remaining > 0 {
            let chunk = remaining.min(sink.len());
            frame::read_exact(&mut self.stream, &mut sink[..chunk])?;
            remaining -= chunk;
        }

        Ok(())
    }
}
