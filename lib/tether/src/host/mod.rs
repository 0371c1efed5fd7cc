//! Blocking host-side collaborators the dispatcher executes opcodes
//! against: the socket stack and the file/directory store.

pub mod fs;
pub mod net;

use std::io;

pub type HostResult<T> = Result<T, HostError>;

/// Resource-level failures. The dispatcher folds all of these into the
/// `BAD_OUTPUT` reply status; the variants exist so logs stay precise.
#[derive(Debug, Eq, PartialEq)]
pub enum HostError {
    /// No free slot in the resource table.
    Exhausted,
    /// The ID names no live resource of the expected kind.
    StaleHandle,
    /// A mode, whence or protocol selector outside the supported set.
    Unsupported,
    Io(io::ErrorKind),
}

impl From<io::Error> for HostError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        HostError::Io(io_error.kind())
    }
}
