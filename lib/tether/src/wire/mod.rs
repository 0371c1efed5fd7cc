//! Wire-level plumbing shared by the frame codec and the channel: protocol
//! constants, reply status codes and the transport error taxonomy.

pub mod frame;

use std::io;

/// Byte the receiver synchronizes on; two in a row mark the start of the
/// frame stream after boot noise or a target reset.
pub const SYNC_BYTE: u8 = b'{';

/// Literal preamble written to the target when the channel opens. The two
/// trailing braces double as the synchronization marker the target expects.
pub const GREETING: &[u8] = b"mbed{{";

/// Upper bound on a single result payload. Oversize outputs are refused
/// with `Status::UnsupportedOutput` before anything is transmitted.
pub const MAX_STRING_LENGTH: usize = 0x10_0000;

/// Reply status codes. Every execute reply opens with one of these encoded
/// as a 4-byte big-endian item; the remaining values double as process exit
/// codes when the session dies before the target requests an exit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Ok = 0,
    BadInput = 1,
    BadOutput = 2,
    AllocFailed = 3,
    UnsupportedOutput = 4,
    Send = 5,
    Receive = 6,
}

impl Status {
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

pub type WireResult<T> = Result<T, WireError>;

/// Transport failures. All of these are fatal to the channel: the loop
/// transitions to `Dead` and no further frames are accepted.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    Receive(io::ErrorKind),
    Send(io::ErrorKind),
    BadType(u8),
}

impl WireError {
    /// Folds the error into the status reported as the session outcome.
    #[inline]
    pub fn status(&self) -> Status {
        match self {
            WireError::Send(_) => Status::Send,
            _ => Status::Receive,
        }
    }
}
