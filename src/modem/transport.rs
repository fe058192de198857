//! Serial transport for the modem's command and notification ports.
//!
//! The engine talks to a [`Transport`] rather than to `serialport` directly so
//! that the protocol can be driven by a scripted transport in tests.

use log::{debug, trace};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

use super::error::{AtError, AtResult};

/// Upper bound on a single blocking read from the serial device.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte-level duplex link to the modem.
///
/// `read` must never block indefinitely: it returns `Ok(0)` when nothing is
/// pending. Any `Err` from `read` or `write_all` is treated as the link being
/// gone.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Drop any bytes received but not yet read.
    fn discard_input(&mut self) -> std::io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (**self).read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        (**self).write_all(data)
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        (**self).discard_input()
    }
}

/// Opens transports by device path. Lets the monitor reconnect without knowing
/// whether it is talking to real hardware.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> AtResult<Box<dyn Transport>>;

    /// Cheap presence probe used by the removal watcher.
    fn is_present(&self, path: &str) -> bool;
}

/// A `serialport` device configured 8N1 without flow control.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> AtResult<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| AtError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Only touch the blocking read path when the driver already holds bytes.
        let pending = self.port.bytes_to_read().map_err(std::io::Error::from)?;
        if pending == 0 {
            return Ok(0);
        }
        let want = buf.len().min(pending as usize);
        match self.port.read(&mut buf[..want]) {
            Ok(n) => {
                trace!("serial read {} bytes", n);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        Write::write_all(&mut self.port, data)?;
        self.port.flush()
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::from)
    }
}

/// Opens real serial devices.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    pub read_timeout: Duration,
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl DeviceOpener for SerialOpener {
    fn open(&self, path: &str, baud_rate: u32) -> AtResult<Box<dyn Transport>> {
        let transport = SerialTransport::open(path, baud_rate, self.read_timeout)?;
        Ok(Box::new(transport))
    }

    fn is_present(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}
