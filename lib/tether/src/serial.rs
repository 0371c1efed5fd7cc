//! Serial device adapter. The only OS-variant surface of the frontend;
//! everything above it talks `io::Read + io::Write`.

use crate::logging;
use serialport::SerialPort;
use std::io;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

pub const BAUD_RATE: u32 = 9600;

/// Bounds per-syscall latency only; frame latency is unbounded and the
/// codec retries timed-out reads.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

const BREAK_HOLD: Duration = Duration::from_secs(2);
const BREAK_SETTLE: Duration = Duration::from_secs(2);

/// An open serial device configured for the target link: 9600 baud, 8 data
/// bits, no parity, 1 stop bit, no flow control.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    log: logging::Logger,
}

impl SerialLink {
    pub fn open<'a, L: Into<Option<&'a logging::Logger>>>(
        device: &str,
        log: L,
    ) -> io::Result<SerialLink> {
        let port = serialport::new(device, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let log = logging::child_or_discard(log.into());

        logging::debug!(log, "serial device opened";
                        "context" => "open",
                        "device" => device,
                        "baud_rate" => BAUD_RATE);

        Ok(SerialLink { port, log })
    }

    /// Resets the target by driving break for two seconds, then leaves it
    /// two more seconds to come out of reset. A failing break is logged and
    /// the session proceeds regardless.
    pub fn send_break(&mut self) {
        if let Err(err) = self.port.set_break() {
            logging::warn!(self.log, "break assert failed";
                           "context" => "send_break",
                           "error" => %err);
        }

        thread::sleep(BREAK_HOLD);

        if let Err(err) = self.port.clear_break() {
            logging::warn!(self.log, "break clear failed";
                           "context" => "send_break",
                           "error" => %err);
        }

        thread::sleep(BREAK_SETTLE);
    }
}

impl io::Read for SerialLink {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl io::Write for SerialLink {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = SerialLink::open("/dev/nonexistent-target-link", None);

        assert!(result.is_err());
    }
}
