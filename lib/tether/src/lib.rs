//! Host side of the serial offloading link: the target pushes serialized
//! function arguments over the wire, asks the host to execute an opcode
//! against its operating system, and reads the results back.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod channel;
pub mod dispatch;
pub mod host;
pub mod logging;
pub mod serial;
pub mod stack;
pub mod table;
pub mod wire;
